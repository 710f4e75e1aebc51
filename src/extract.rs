//! Extraction engine: observed flow -> normalized prompt record
//!
//! Declines (returns `None`) for everything that is not a recognizable
//! prompt. That is the normal outcome for most intercepted traffic and is
//! only logged at debug level.

use std::sync::Arc;
use tracing::{debug, info};

use crate::flow::FlowEvent;
use crate::record::{PromptRecord, Source};
use crate::tracker::ConversationTracker;
use crate::vendor::VendorRegistry;

pub struct Extractor {
    registry: Arc<VendorRegistry>,
    tracker: Arc<ConversationTracker>,
}

impl Extractor {
    pub fn new(registry: Arc<VendorRegistry>, tracker: Arc<ConversationTracker>) -> Self {
        Self { registry, tracker }
    }

    pub fn registry(&self) -> &VendorRegistry {
        &self.registry
    }

    /// Turn one completed exchange into a record with its conversation assigned.
    ///
    /// Reads only the already-buffered body; never touches a store.
    pub fn extract(&self, flow: &FlowEvent) -> Option<PromptRecord> {
        if flow.aborted {
            debug!(url = %flow.url, "flow aborted, skipping");
            return None;
        }

        let payload = flow.payload()?;
        let Some(schema) = self.registry.find(&payload.target) else {
            debug!(target = %payload.target, "no vendor schema matches");
            return None;
        };

        let Some(extraction) = schema.extract(&payload) else {
            debug!(vendor = schema.id(), target = %payload.target, "body not extractable");
            return None;
        };
        let prompt_text = extraction.prompt_text.trim();
        if prompt_text.is_empty() {
            debug!(vendor = schema.id(), "extracted prompt is blank");
            return None;
        }

        let mut record = PromptRecord::new(Source::Proxy, schema.llm_name(), prompt_text);
        record.model_name = extraction.model_name.unwrap_or_default();
        record.description = Some(format!("{} prompt via {}", schema.llm_name(), payload.host()));
        record.url = Some(flow.url.clone());
        record.metadata = extraction.metadata;
        record
            .metadata
            .entry("vendor".to_string())
            .or_insert_with(|| schema.id().into());

        let conversation_id = self
            .tracker
            .assign(&mut record, extraction.conversation_id.as_deref());

        info!(
            vendor = schema.id(),
            id = %record.id,
            conversation = %conversation_id,
            chars = record.prompt_text.len(),
            "extracted prompt"
        );
        Some(record)
    }
}
