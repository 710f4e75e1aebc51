//! Recorder: the one owned component wiring extraction, conversation
//! tracking, active files, persistence and change notification together.
//!
//! Both entry points end in the same coordinator:
//! - `on_flow_observed` for intercepted traffic (extraction first)
//! - `submit` for the REST and assistant-integration collaborators

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::active_files::{scan_project, ActiveFileRegistry, ActiveFileSet};
use crate::config::Config;
use crate::coordinator::{AssociateOutcome, PersistenceCoordinator, ReconcileReport, Stats, WriteOutcome};
use crate::error::{RecorderError, Result};
use crate::extract::Extractor;
use crate::flow::FlowEvent;
use crate::notify::{ChangeEvent, ChangeNotifier};
use crate::record::{FileAssociation, PromptFilter, PromptRecord, Source};
use crate::tracker::ConversationTracker;
use crate::vendor::VendorRegistry;

/// A prompt handed over directly, bypassing extraction
#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub prompt_text: String,
    pub llm_name: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default = "default_submission_source")]
    pub source: Source,
    /// Files to associate in addition to the active set
    #[serde(default)]
    pub files: Vec<String>,
}

fn default_submission_source() -> Source {
    Source::RestApi
}

impl Submission {
    pub fn new(prompt_text: impl Into<String>, llm_name: impl Into<String>) -> Self {
        Self {
            prompt_text: prompt_text.into(),
            llm_name: llm_name.into(),
            model_name: None,
            description: None,
            url: None,
            metadata: None,
            conversation_id: None,
            source: Source::RestApi,
            files: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingStatus {
    pub enabled: bool,
    /// Entries in the backup store
    pub recorded: usize,
    pub backup_path: String,
}

pub struct Recorder {
    config: Config,
    recording: AtomicBool,
    extractor: Extractor,
    tracker: Arc<ConversationTracker>,
    active_files: Arc<ActiveFileRegistry>,
    notifier: Arc<ChangeNotifier>,
    coordinator: PersistenceCoordinator,
}

impl Recorder {
    pub fn open(config: Config) -> Self {
        let registry = Arc::new(VendorRegistry::new(&config));
        Self::with_registry(config, registry)
    }

    /// Open with a caller-built vendor registry.
    pub fn with_registry(config: Config, registry: Arc<VendorRegistry>) -> Self {
        let tracker = Arc::new(ConversationTracker::new(config.recency_window()));
        let active_files = Arc::new(ActiveFileRegistry::new());
        let notifier = Arc::new(ChangeNotifier::new());
        let coordinator = PersistenceCoordinator::open(&config, active_files.clone(), notifier.clone());

        Self {
            recording: AtomicBool::new(config.recording.enabled),
            extractor: Extractor::new(registry, tracker.clone()),
            tracker,
            active_files,
            notifier,
            coordinator,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &PersistenceCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &VendorRegistry {
        self.extractor.registry()
    }

    // ============================================
    // INBOUND
    // ============================================

    /// One completed exchange from the interception transport.
    ///
    /// `Ok(None)` when the traffic carries no prompt; nothing is written then.
    pub fn on_flow_observed(&self, flow: &FlowEvent) -> Result<Option<WriteOutcome>> {
        if !self.is_recording() {
            debug!(url = %flow.url, "recording paused, flow ignored");
            return Ok(None);
        }
        match self.extractor.extract(flow) {
            Some(record) => self.coordinator.write(record, &[]).map(Some),
            None => Ok(None),
        }
    }

    pub fn submit(&self, submission: Submission) -> Result<WriteOutcome> {
        if !self.is_recording() {
            return Err(RecorderError::RecordingPaused);
        }
        if submission.prompt_text.trim().is_empty() {
            return Err(RecorderError::validation("prompt text is empty"));
        }

        let mut record = PromptRecord::new(submission.source, submission.llm_name.trim(), submission.prompt_text);
        record.model_name = submission.model_name.unwrap_or_default();
        record.description = submission.description.filter(|d| !d.trim().is_empty());
        record.url = submission.url.filter(|u| !u.trim().is_empty());
        record.metadata = submission.metadata.unwrap_or_default();
        record.conversation_id = submission.conversation_id.unwrap_or_default();
        record.validate()?;

        let conversation_id = self.tracker.assign(&mut record, None);
        debug!(id = %record.id, conversation = %conversation_id, source = %record.source, "accepted submission");

        let extra: Vec<FileAssociation> = submission
            .files
            .into_iter()
            .map(|file_path| FileAssociation {
                prompt_id: record.id.clone(),
                file_path,
                token_change: None,
            })
            .collect();
        self.coordinator.write(record, &extra)
    }

    // ============================================
    // RECORDING SWITCH
    // ============================================

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Pause or resume recording. While paused, flows are ignored and
    /// submissions are declined; reads and associations still work.
    pub fn set_recording(&self, enabled: bool) -> Result<RecordingStatus> {
        let was = self.recording.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(enabled, "recording switched");
        }
        self.recording_status()
    }

    pub fn recording_status(&self) -> Result<RecordingStatus> {
        Ok(RecordingStatus {
            enabled: self.is_recording(),
            recorded: self.coordinator.backup().load()?.len(),
            backup_path: self.coordinator.backup().path().display().to_string(),
        })
    }

    // ============================================
    // ACTIVE FILES
    // ============================================

    pub fn register_active_files<S: AsRef<str>>(&self, paths: &[S]) -> Result<Vec<String>> {
        self.active_files.register(paths)
    }

    pub fn active_files(&self) -> Result<ActiveFileSet> {
        self.active_files.snapshot()
    }

    /// Register every file under `root` matching `patterns` (or the configured defaults).
    pub fn register_project_files(&self, root: &Path, patterns: Option<&[String]>) -> Result<Vec<String>> {
        let patterns = patterns.unwrap_or(&self.config.files.default_patterns);
        let found = scan_project(root, patterns)?;
        self.active_files.register(found.as_slice())
    }

    pub fn associate_file(&self, prompt_id: &str, path: &str, token_change: Option<i64>) -> Result<AssociateOutcome> {
        self.coordinator.associate(prompt_id, path, token_change)
    }

    // ============================================
    // READS & MAINTENANCE
    // ============================================

    pub fn list_recent(&self, limit: usize) -> Result<Vec<PromptRecord>> {
        self.coordinator.list_recent(limit)
    }

    /// Newest-first page, skipping the first `offset` records
    pub fn list_page(&self, limit: usize, offset: usize) -> Result<Vec<PromptRecord>> {
        self.coordinator.query(&PromptFilter::page(limit, offset))
    }

    pub fn query(&self, filter: &PromptFilter) -> Result<Vec<PromptRecord>> {
        self.coordinator.query(filter)
    }

    pub fn get(&self, id: &str) -> Result<Option<PromptRecord>> {
        self.coordinator.get(id)
    }

    pub fn associations(&self, id: &str) -> Result<Vec<FileAssociation>> {
        self.coordinator.associations(id)
    }

    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.coordinator.reconcile()
    }

    pub fn stats(&self) -> Result<Stats> {
        self.coordinator.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }
}
