//! Backup store: one JSON array document, rewritten atomically on every append
//!
//! Appends are serialized across processes with an exclusive lock on a
//! `.lock` sidecar; the document itself is replaced by write-then-rename so a
//! reader never sees a partial file.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{RecorderError, Result};
use crate::record::{parse_timestamp, FileAssociation, PromptRecord, Source};

/// One element of the backup array: the record plus its associated paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEntry")]
pub struct BackupEntry {
    #[serde(flatten)]
    pub record: PromptRecord,
    #[serde(default)]
    pub files: Vec<String>,
    /// Token deltas for the entries of `files` that have one
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_changes: BTreeMap<String, i64>,
}

impl BackupEntry {
    pub fn new(record: PromptRecord, associations: &[FileAssociation]) -> Self {
        let mut entry = Self {
            record,
            files: vec![],
            file_changes: BTreeMap::new(),
        };
        for association in associations {
            entry.merge(&association.file_path, association.token_change);
        }
        entry
    }

    /// Add a path, keeping any token delta already recorded for it.
    fn merge(&mut self, path: &str, token_change: Option<i64>) -> bool {
        let mut changed = false;
        if !self.files.iter().any(|f| f == path) {
            self.files.push(path.to_string());
            changed = true;
        }
        if let Some(tokens) = token_change {
            changed |= self.file_changes.insert(path.to_string(), tokens) != Some(tokens);
        }
        changed
    }

    pub fn associations(&self) -> Vec<FileAssociation> {
        self.files
            .iter()
            .map(|path| FileAssociation {
                prompt_id: self.record.id.clone(),
                file_path: path.clone(),
                token_change: self.file_changes.get(path).copied(),
            })
            .collect()
    }
}

/// Wire form accepted on read. Also covers entries written by the desktop
/// recorder: `model` for the llm name, free-form source labels, no
/// conversation id, zone-less timestamps.
#[derive(Deserialize)]
struct RawEntry {
    id: String,
    timestamp: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default, alias = "model")]
    llm_name: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    prompt_text: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    file_changes: BTreeMap<String, i64>,
}

impl TryFrom<RawEntry> for BackupEntry {
    type Error = String;

    fn try_from(raw: RawEntry) -> std::result::Result<Self, Self::Error> {
        let timestamp =
            parse_timestamp(&raw.timestamp).ok_or_else(|| format!("invalid timestamp: {}", raw.timestamp))?;
        // entries the desktop recorder could not label were imported as json_import
        let source = raw
            .source
            .as_deref()
            .and_then(Source::parse)
            .unwrap_or(Source::RestApi);
        // ungrouped legacy entries form a conversation of one
        let conversation_id = raw
            .conversation_id
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| raw.id.clone());

        Ok(Self {
            record: PromptRecord {
                id: raw.id,
                timestamp,
                source,
                llm_name: raw.llm_name.unwrap_or_else(|| "Claude".to_string()),
                model_name: raw.model_name.unwrap_or_default(),
                prompt_text: raw.prompt_text,
                description: raw.description.filter(|d| !d.is_empty()),
                url: raw.url,
                conversation_id,
                metadata: raw.metadata.unwrap_or_default(),
            },
            files: raw.files,
            file_changes: raw.file_changes,
        })
    }
}

pub struct BackupStore {
    path: PathBuf,
}

impl BackupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries in append order. A missing or empty file is an empty store.
    pub fn load(&self) -> Result<Vec<BackupEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(self.io_error(e)),
        };
        if content.trim().is_empty() {
            return Ok(vec![]);
        }
        serde_json::from_str(&content).map_err(|source| RecorderError::BackupCorrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Append an entry unless its id is already present.
    pub fn append(&self, entry: &BackupEntry) -> Result<bool> {
        self.update(|entries| {
            if entries.iter().any(|e| e.record.id == entry.record.id) {
                return false;
            }
            entries.push(entry.clone());
            true
        })
    }

    /// Merge an association into the entry for `prompt_id`.
    ///
    /// Returns `UnknownPrompt` when the backup holds no such entry.
    pub fn add_association(&self, association: &FileAssociation) -> Result<bool> {
        let mut found = false;
        let changed = self.update(|entries| {
            match entries.iter_mut().find(|e| e.record.id == association.prompt_id) {
                Some(entry) => {
                    found = true;
                    entry.merge(&association.file_path, association.token_change)
                }
                None => false,
            }
        })?;
        if !found {
            return Err(RecorderError::UnknownPrompt(association.prompt_id.clone()));
        }
        Ok(changed)
    }

    pub fn get(&self, id: &str) -> Result<Option<BackupEntry>> {
        Ok(self.load()?.into_iter().find(|e| e.record.id == id))
    }

    /// Same-triple entry within `[from, to]`, newest first.
    pub fn find_duplicate(
        &self,
        record: &PromptRecord,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<String>> {
        Ok(self
            .load()?
            .into_iter()
            .rev()
            .find(|e| {
                e.record.id != record.id
                    && e.record.llm_name == record.llm_name
                    && e.record.prompt_text == record.prompt_text
                    && e.record.conversation_id == record.conversation_id
                    && e.record.timestamp >= from
                    && e.record.timestamp <= to
            })
            .map(|e| e.record.id))
    }

    /// Load, mutate, and (if the closure reports a change) rewrite under the lock.
    fn update<F>(&self, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut Vec<BackupEntry>) -> bool,
    {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let lock = self.acquire_lock()?;
        let mut entries = self.load()?;
        let changed = mutate(&mut entries);
        if changed {
            self.write_atomic(&entries)?;
        }
        drop(lock);
        Ok(changed)
    }

    fn acquire_lock(&self) -> Result<File> {
        let lock_path = self.path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| self.io_error(e))?;
        file.lock_exclusive().map_err(|e| self.io_error(e))?;
        Ok(file)
    }

    fn write_atomic(&self, entries: &[BackupEntry]) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp_path = self.path.with_extension("json.tmp");

        let mut tmp = File::create(&tmp_path).map_err(|e| self.io_error(e))?;
        tmp.write_all(&json).map_err(|e| self.io_error(e))?;
        tmp.sync_all().map_err(|e| self.io_error(e))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), entries = entries.len(), "rewrote backup store");
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> RecorderError {
        RecorderError::BackupStore {
            path: self.path.clone(),
            source,
        }
    }
}
