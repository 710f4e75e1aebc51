//! Conversation grouping
//!
//! Vendor-native conversation ids are used as-is (namespaced by llm_name).
//! Without one, a record joins the conversation of the last record from the
//! same llm + host if that one was seen within the recency window and was not
//! part of a vendor-native conversation. This is a best-effort heuristic: it
//! can merge two unrelated chats or split one chat in two.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::record::PromptRecord;

#[derive(Debug, Clone)]
struct LastSeen {
    conversation_id: String,
    at: DateTime<Utc>,
    explicit: bool,
}

pub struct ConversationTracker {
    window: Duration,
    recent: Mutex<HashMap<(String, String), LastSeen>>,
}

impl ConversationTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Assign `record.conversation_id` and return it.
    ///
    /// `native` is the vendor-supplied conversation id, if the schema found one.
    /// A record that already carries a conversation id keeps it.
    pub fn assign(&self, record: &mut PromptRecord, native: Option<&str>) -> String {
        let key = (record.llm_name.clone(), record.host().unwrap_or_default());

        // The table only ever holds plain values, so a poisoned lock is still usable.
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());

        let (conversation_id, explicit) = if !record.conversation_id.trim().is_empty() {
            (record.conversation_id.clone(), true)
        } else if let Some(native) = native.filter(|n| !n.trim().is_empty()) {
            (format!("{}:{}", record.llm_name, native), true)
        } else {
            match recent.get(&key) {
                Some(last) if !last.explicit && record.timestamp - last.at <= self.window => {
                    (last.conversation_id.clone(), false)
                }
                _ => (mint(&record.llm_name), false),
            }
        };

        recent.insert(
            key,
            LastSeen {
                conversation_id: conversation_id.clone(),
                at: record.timestamp,
                explicit,
            },
        );

        record.conversation_id = conversation_id.clone();
        conversation_id
    }
}

fn mint(llm_name: &str) -> String {
    let slug: String = llm_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("{}-{}", if slug.is_empty() { "conv" } else { slug.as_str() }, Uuid::new_v4())
}
