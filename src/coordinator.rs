//! Persistence coordinator
//!
//! Every write lands in the backup store first, then in the primary store.
//! The backup is the append-only log; the primary is an index that can be
//! rebuilt from it with `reconcile`. A primary failure after a successful
//! backup append is reported as `WriteOutcome::Degraded`, never swallowed.

use chrono::Duration;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::active_files::{normalize_path, ActiveFileRegistry};
use crate::config::{Config, RetryPolicy};
use crate::error::{RecorderError, Result};
use crate::notify::{ChangeEvent, ChangeKind, ChangeNotifier};
use crate::record::{FileAssociation, PromptFilter, PromptRecord};
use crate::store::{BackupEntry, BackupStore, PromptStore};

/// Result of a single `write` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// In both stores
    Recorded { id: String, conversation_id: String },
    /// In the backup store only; `reconcile` will restore it to the primary
    Degraded {
        id: String,
        conversation_id: String,
        reason: String,
    },
    /// Same prompt already written within the dedup window; nothing stored
    Duplicate { dropped_id: String, existing_id: String },
}

impl WriteOutcome {
    /// Id of the stored record, `None` for a dropped duplicate
    pub fn id(&self) -> Option<&str> {
        match self {
            WriteOutcome::Recorded { id, .. } | WriteOutcome::Degraded { id, .. } => Some(id),
            WriteOutcome::Duplicate { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, WriteOutcome::Degraded { .. })
    }
}

/// Result of an explicit association
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssociateOutcome {
    pub association: FileAssociation,
    /// Set when only the backup store took the association
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub backup_entries: usize,
    /// Ids re-inserted into the primary store
    pub restored: Vec<String>,
    pub associations_restored: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total: i64,
    pub associations: i64,
    pub by_llm: BTreeMap<String, i64>,
    pub by_source: BTreeMap<String, i64>,
    pub backup_entries: usize,
    pub primary_available: bool,
}

pub struct PersistenceCoordinator {
    primary_path: PathBuf,
    primary: Mutex<Option<PromptStore>>,
    backup: BackupStore,
    active_files: Arc<ActiveFileRegistry>,
    notifier: Arc<ChangeNotifier>,
    retry: RetryPolicy,
    dedup_window: Option<Duration>,
    /// Set whenever the primary handle was lost; cleared by the next reconcile
    needs_reconcile: AtomicBool,
    /// Serializes writers within this process; the SQLite lock covers other processes
    write_lock: Mutex<()>,
}

impl PersistenceCoordinator {
    /// Open both stores. An unreadable primary is not fatal: reads are served
    /// from the backup until the primary can be opened again.
    pub fn open(config: &Config, active_files: Arc<ActiveFileRegistry>, notifier: Arc<ChangeNotifier>) -> Self {
        let primary_path = config.database_path();
        let retry = config.retry_policy();

        let primary = match PromptStore::open(&primary_path, retry.busy_timeout) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(path = %primary_path.display(), error = %e, "primary store unavailable, serving from backup");
                None
            }
        };
        let needs_reconcile = AtomicBool::new(primary.is_none());

        Self {
            primary_path,
            primary: Mutex::new(primary),
            backup: BackupStore::new(config.backup_path()),
            active_files,
            notifier,
            retry,
            dedup_window: config.dedup_window(),
            needs_reconcile,
            write_lock: Mutex::new(()),
        }
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary_path
    }

    pub fn backup(&self) -> &BackupStore {
        &self.backup
    }

    pub fn primary_available(&self) -> bool {
        self.with_primary(|_| Ok(())).is_ok()
    }

    // ============================================
    // WRITES
    // ============================================

    /// Durably record `record`, associating it with the active file set
    /// plus any `extra` associations.
    pub fn write(&self, record: PromptRecord, extra: &[FileAssociation]) -> Result<WriteOutcome> {
        record.validate()?;

        let mut associations: Vec<FileAssociation> = vec![];
        for path in self.active_files.snapshot()?.paths {
            merge_association(&mut associations, &record.id, path, None);
        }
        for association in extra {
            let path = normalize_path(&association.file_path)?;
            merge_association(&mut associations, &record.id, path, association.token_change);
        }

        let _serial = self.serialize()?;
        let mut attempts = Attempts::new(self.retry.attempts);

        if let Some(existing_id) = self.find_duplicate(&record, &mut attempts)? {
            info!(
                dropped = %record.id,
                existing = %existing_id,
                llm = %record.llm_name,
                "dropped duplicate delivery"
            );
            return Ok(WriteOutcome::Duplicate {
                dropped_id: record.id,
                existing_id,
            });
        }

        if let Err(e) = self.backup.append(&BackupEntry::new(record.clone(), &associations)) {
            error!(id = %record.id, error = %e, "backup store write failed");
            return Err(e);
        }

        let outcome = match self.with_primary_within(&mut attempts, |store| store.insert_record(&record, &associations)) {
            Ok(_) => {
                info!(
                    id = %record.id,
                    llm = %record.llm_name,
                    source = %record.source,
                    files = associations.len(),
                    "recorded prompt"
                );
                WriteOutcome::Recorded {
                    id: record.id.clone(),
                    conversation_id: record.conversation_id.clone(),
                }
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "primary store write failed, record kept in backup only");
                self.needs_reconcile.store(true, Ordering::SeqCst);
                WriteOutcome::Degraded {
                    id: record.id.clone(),
                    conversation_id: record.conversation_id.clone(),
                    reason: e.to_string(),
                }
            }
        };

        self.notifier.notify(ChangeEvent {
            kind: ChangeKind::Recorded,
            prompt_id: record.id.clone(),
            conversation_id: record.conversation_id.clone(),
        });

        if !outcome.is_degraded() && self.needs_reconcile.load(Ordering::SeqCst) {
            if let Err(e) = self.reconcile_locked() {
                warn!(error = %e, "reconcile after primary recovery failed");
            }
        }

        Ok(outcome)
    }

    /// Link an existing prompt to a file. Associations accumulate; a repeated
    /// path only updates the token delta when one is given.
    pub fn associate(&self, prompt_id: &str, file_path: &str, token_change: Option<i64>) -> Result<AssociateOutcome> {
        let association = FileAssociation {
            prompt_id: prompt_id.to_string(),
            file_path: normalize_path(file_path)?,
            token_change,
        };

        let _serial = self.serialize()?;

        let primary_record = match self.with_primary(|store| store.get(prompt_id)) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "primary store unavailable while associating");
                None
            }
        };

        let in_backup = match self.backup.add_association(&association) {
            Ok(_) => true,
            Err(RecorderError::UnknownPrompt(_)) => false,
            Err(e) => return Err(e),
        };

        let conversation_id = if in_backup {
            let entry = self
                .backup
                .get(prompt_id)?
                .ok_or_else(|| RecorderError::UnknownPrompt(prompt_id.to_string()))?;
            entry.record.conversation_id.clone()
        } else {
            // known to the primary only: copy it into the backup so the log stays complete
            let record = primary_record
                .clone()
                .ok_or_else(|| RecorderError::UnknownPrompt(prompt_id.to_string()))?;
            let mut existing = self.with_primary(|store| store.associations(prompt_id))?;
            existing.push(association.clone());
            self.backup.append(&BackupEntry::new(record.clone(), &existing))?;
            record.conversation_id
        };

        let primary_result = match primary_record {
            Some(_) => self.with_primary(|store| store.add_association(&association).map(|_| ())),
            None => match self.backup.get(prompt_id)? {
                Some(entry) => {
                    self.with_primary(|store| store.insert_record(&entry.record, &entry.associations()).map(|_| ()))
                }
                None => Err(RecorderError::UnknownPrompt(prompt_id.to_string())),
            },
        };
        let degraded = match primary_result {
            Ok(()) => None,
            Err(e) => {
                warn!(id = %prompt_id, error = %e, "association kept in backup only");
                self.needs_reconcile.store(true, Ordering::SeqCst);
                Some(e.to_string())
            }
        };

        info!(id = %prompt_id, path = %association.file_path, "associated file");
        self.notifier.notify(ChangeEvent {
            kind: ChangeKind::Associated,
            prompt_id: prompt_id.to_string(),
            conversation_id,
        });

        Ok(AssociateOutcome { association, degraded })
    }

    /// Re-insert every backup entry missing from the primary store, and any
    /// association the primary lacks. Running it again is a no-op.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let _serial = self.serialize()?;
        self.reconcile_locked()
    }

    fn reconcile_locked(&self) -> Result<ReconcileReport> {
        let entries = self.backup.load()?;

        let (restored, associations_restored) = self.with_primary(|store| {
            let present = store.all_ids()?;
            let mut restored = vec![];
            let mut associations_restored = 0;

            for entry in &entries {
                let associations = entry.associations();
                if !present.contains(&entry.record.id) {
                    if store.insert_record(&entry.record, &associations)? {
                        restored.push(entry.record.clone());
                        associations_restored += associations.len();
                    }
                    continue;
                }

                let known: HashSet<String> = store
                    .associations(&entry.record.id)?
                    .into_iter()
                    .map(|a| a.file_path)
                    .collect();
                for association in associations.iter().filter(|a| !known.contains(&a.file_path)) {
                    store.add_association(association)?;
                    associations_restored += 1;
                }
            }
            Ok((restored, associations_restored))
        })?;

        self.needs_reconcile.store(false, Ordering::SeqCst);
        if !restored.is_empty() || associations_restored > 0 {
            info!(
                restored = restored.len(),
                associations = associations_restored,
                "reconciled primary store from backup"
            );
        }

        for record in &restored {
            self.notifier.notify(ChangeEvent {
                kind: ChangeKind::Restored,
                prompt_id: record.id.clone(),
                conversation_id: record.conversation_id.clone(),
            });
        }

        Ok(ReconcileReport {
            backup_entries: entries.len(),
            restored: restored.into_iter().map(|r| r.id).collect(),
            associations_restored,
        })
    }

    // ============================================
    // READS
    // ============================================

    /// Newest first. Served from the backup when the primary is unusable.
    pub fn query(&self, filter: &PromptFilter) -> Result<Vec<PromptRecord>> {
        match self.with_primary(|store| store.query(filter)) {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(error = %e, "primary store unavailable, querying backup");
                let mut records: Vec<PromptRecord> = self
                    .backup
                    .load()?
                    .into_iter()
                    .filter(|entry| filter.matches(&entry.record, &entry.files))
                    .map(|entry| entry.record)
                    .collect();
                records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
                let records = records
                    .into_iter()
                    .skip(filter.offset.unwrap_or(0))
                    .take(filter.limit.unwrap_or(usize::MAX))
                    .collect();
                Ok(records)
            }
        }
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<PromptRecord>> {
        self.query(&PromptFilter::recent(limit))
    }

    pub fn get(&self, id: &str) -> Result<Option<PromptRecord>> {
        match self.with_primary(|store| store.get(id)) {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => Ok(self.backup.get(id)?.map(|e| e.record)),
            Err(e) => {
                warn!(error = %e, "primary store unavailable, reading backup");
                Ok(self.backup.get(id)?.map(|e| e.record))
            }
        }
    }

    pub fn associations(&self, id: &str) -> Result<Vec<FileAssociation>> {
        match self.with_primary(|store| store.associations(id)) {
            Ok(associations) => Ok(associations),
            Err(e) => {
                warn!(error = %e, "primary store unavailable, reading backup");
                Ok(self
                    .backup
                    .get(id)?
                    .map(|e| e.associations())
                    .unwrap_or_default())
            }
        }
    }

    pub fn stats(&self) -> Result<Stats> {
        let entries = self.backup.load()?;
        match self.with_primary(|store| store.stats()) {
            Ok(store) => Ok(Stats {
                total: store.total,
                associations: store.associations,
                by_llm: store.by_llm,
                by_source: store.by_source,
                backup_entries: entries.len(),
                primary_available: true,
            }),
            Err(e) => {
                warn!(error = %e, "primary store unavailable, computing stats from backup");
                let mut stats = Stats {
                    total: entries.len() as i64,
                    backup_entries: entries.len(),
                    ..Default::default()
                };
                for entry in &entries {
                    stats.associations += entry.files.len() as i64;
                    *stats.by_llm.entry(entry.record.llm_name.clone()).or_default() += 1;
                    *stats.by_source.entry(entry.record.source.to_string()).or_default() += 1;
                }
                Ok(stats)
            }
        }
    }

    // ============================================
    // PRIMARY ACCESS
    // ============================================

    fn serialize(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| RecorderError::Poisoned)
    }

    /// Earlier record with the same triple. Records left backup-only by a
    /// degraded write are still candidates until the next reconcile.
    fn find_duplicate(&self, record: &PromptRecord, attempts: &mut Attempts) -> Result<Option<String>> {
        let Some(window) = self.dedup_window else {
            return Ok(None);
        };
        let from = record.timestamp - window;
        let to = record.timestamp + window;

        match self.with_primary_within(attempts, |store| store.find_duplicate(record, from, to)) {
            Ok(Some(existing)) => Ok(Some(existing)),
            Ok(None) if !self.needs_reconcile.load(Ordering::SeqCst) => Ok(None),
            Ok(None) => self.backup.find_duplicate(record, from, to),
            Err(e) => {
                warn!(error = %e, "primary store unavailable, checking backup for duplicates");
                self.backup.find_duplicate(record, from, to)
            }
        }
    }

    fn with_primary<T, F>(&self, op: F) -> Result<T>
    where
        F: FnMut(&mut PromptStore) -> Result<T>,
    {
        self.with_primary_within(&mut Attempts::new(self.retry.attempts), op)
    }

    /// Run `op` against the primary store, reopening it if needed and
    /// retrying while another connection holds the lock. Busy retries draw
    /// on `attempts`, which callers share across one logical operation.
    fn with_primary_within<T, F>(&self, attempts: &mut Attempts, mut op: F) -> Result<T>
    where
        F: FnMut(&mut PromptStore) -> Result<T>,
    {
        let mut slot = self.primary.lock().map_err(|_| RecorderError::Poisoned)?;
        let mut reopened = false;
        loop {
            if slot.is_some() && !self.primary_path.exists() {
                warn!(path = %self.primary_path.display(), "primary store file is gone, reopening");
                *slot = None;
                self.needs_reconcile.store(true, Ordering::SeqCst);
            }

            let Some(attempt) = attempts.take() else {
                return Err(RecorderError::StoreBusy { attempts: attempts.used });
            };
            let result = match open_slot(&mut slot, &self.primary_path, &self.retry) {
                Ok(store) => op(store),
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_busy() => {
                    if attempts.left == 0 {
                        return Err(RecorderError::StoreBusy { attempts: attempts.used });
                    }
                    let delay = self.retry.delay_after(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "primary store busy, retrying");
                    std::thread::sleep(delay);
                }
                Err(e) if is_unusable(&e) && slot.is_some() => {
                    warn!(error = %e, "dropping primary store handle");
                    *slot = None;
                    self.needs_reconcile.store(true, Ordering::SeqCst);
                    if reopened {
                        return Err(e);
                    }
                    // one fresh connection per call, outside the busy budget
                    reopened = true;
                    attempts.refund();
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Primary-store attempts left for one logical operation
struct Attempts {
    left: u32,
    used: u32,
}

impl Attempts {
    fn new(total: u32) -> Self {
        Self { left: total, used: 0 }
    }

    /// 1-based number of the attempt being started, `None` once spent
    fn take(&mut self) -> Option<u32> {
        if self.left == 0 {
            return None;
        }
        self.left -= 1;
        self.used += 1;
        Some(self.used)
    }

    fn refund(&mut self) {
        if self.used > 0 {
            self.used -= 1;
            self.left += 1;
        }
    }
}

fn merge_association(associations: &mut Vec<FileAssociation>, prompt_id: &str, path: String, token_change: Option<i64>) {
    match associations.iter_mut().find(|a| a.file_path == path) {
        Some(existing) => existing.token_change = token_change.or(existing.token_change),
        None => associations.push(FileAssociation {
            prompt_id: prompt_id.to_string(),
            file_path: path,
            token_change,
        }),
    }
}

fn open_slot<'a>(slot: &'a mut Option<PromptStore>, path: &Path, retry: &RetryPolicy) -> Result<&'a mut PromptStore> {
    if slot.is_none() {
        let store = PromptStore::open(path, retry.busy_timeout)?;
        info!(path = %path.display(), "opened primary store");
        *slot = Some(store);
    }
    slot.as_mut()
        .ok_or_else(|| RecorderError::PrimaryUnavailable(path.display().to_string()))
}

/// Errors after which the open connection should not be reused.
fn is_unusable(err: &RecorderError) -> bool {
    match err {
        RecorderError::PrimaryStore(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::NotADatabase
                | rusqlite::ErrorCode::DatabaseCorrupt
                | rusqlite::ErrorCode::CannotOpen
                | rusqlite::ErrorCode::SystemIoFailure
                | rusqlite::ErrorCode::ReadOnly
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Source;
    use std::time::{Duration as StdDuration, Instant};

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.storage.database_path = dir.join("prompts.db").display().to_string();
        config.storage.backup_path = dir.join("prompts.json").display().to_string();
        config
    }

    fn coordinator(config: &Config) -> PersistenceCoordinator {
        PersistenceCoordinator::open(config, Arc::new(ActiveFileRegistry::new()), Arc::new(ChangeNotifier::new()))
    }

    fn record(text: &str, conversation: &str) -> PromptRecord {
        let mut record = PromptRecord::new(Source::Proxy, "ChatGPT", text);
        record.conversation_id = conversation.to_string();
        record
    }

    fn rows_on_disk(path: &Path) -> i64 {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.query_row("SELECT COUNT(*) FROM prompts", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_busy_write_shares_one_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let coordinator = coordinator(&config);

        let other = rusqlite::Connection::open(coordinator.primary_path()).unwrap();
        other.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let started = Instant::now();
        let outcome = coordinator.write(record("locked out", "c1"), &[]).unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed < StdDuration::from_secs(2), "write took {:?}", elapsed);

        let WriteOutcome::Degraded { reason, .. } = outcome else {
            panic!("expected degraded outcome");
        };
        assert!(reason.contains("after 3 attempts"), "reason was {}", reason);

        other.execute_batch("COMMIT;").unwrap();
    }

    #[test]
    fn test_deleted_primary_is_recreated_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let coordinator = coordinator(&config);

        coordinator.write(record("one", "c1"), &[]).unwrap();
        coordinator.write(record("two", "c1"), &[]).unwrap();

        std::fs::remove_file(coordinator.primary_path()).unwrap();

        let report = coordinator.reconcile().unwrap();
        assert_eq!(report.restored.len(), 2);
        assert_eq!(rows_on_disk(coordinator.primary_path()), 2);

        let outcome = coordinator.write(record("three", "c1"), &[]).unwrap();
        assert!(matches!(outcome, WriteOutcome::Recorded { .. }));
        assert_eq!(rows_on_disk(coordinator.primary_path()), 3);
    }

    #[test]
    fn test_write_after_primary_deleted_restores_earlier_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let coordinator = coordinator(&config);

        coordinator.write(record("before", "c1"), &[]).unwrap();
        std::fs::remove_file(coordinator.primary_path()).unwrap();

        let outcome = coordinator.write(record("after", "c1"), &[]).unwrap();
        assert!(!outcome.is_degraded());
        assert_eq!(rows_on_disk(coordinator.primary_path()), 2);
    }

    #[test]
    fn test_backup_only_record_is_still_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.storage.busy_timeout_ms = 50;
        config.retry.backoff_ms = 10;
        let coordinator = coordinator(&config);

        let other = rusqlite::Connection::open(coordinator.primary_path()).unwrap();
        other.execute_batch("BEGIN EXCLUSIVE;").unwrap();
        let first = record("retry me", "conv-x");
        let first_id = first.id.clone();
        assert!(coordinator.write(first.clone(), &[]).unwrap().is_degraded());
        other.execute_batch("COMMIT;").unwrap();
        drop(other);

        let mut retry = record("retry me", "conv-x");
        retry.timestamp = first.timestamp + chrono::Duration::seconds(1);
        let retry_id = retry.id.clone();
        assert_eq!(
            coordinator.write(retry, &[]).unwrap(),
            WriteOutcome::Duplicate {
                dropped_id: retry_id,
                existing_id: first_id.clone(),
            }
        );

        assert_eq!(coordinator.reconcile().unwrap().restored, vec![first_id]);
        assert_eq!(coordinator.list_recent(10).unwrap().len(), 1);
        assert_eq!(coordinator.backup().load().unwrap().len(), 1);
    }

    #[test]
    fn test_backup_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blocked"), "").unwrap();
        let mut config = config_in(dir.path());
        config.storage.backup_path = dir.path().join("blocked/prompts.json").display().to_string();
        let coordinator = coordinator(&config);

        for _ in 0..2 {
            let err = coordinator.write(record("nowhere to log", "c1"), &[]).unwrap_err();
            assert!(matches!(err, RecorderError::BackupStore { .. }), "got {:?}", err);
        }

        assert!(coordinator.primary_available());
        assert_eq!(rows_on_disk(coordinator.primary_path()), 0);
    }

    #[test]
    fn test_attempt_budget() {
        let mut attempts = Attempts::new(2);
        assert_eq!(attempts.take(), Some(1));
        attempts.refund();
        assert_eq!(attempts.take(), Some(1));
        assert_eq!(attempts.take(), Some(2));
        assert_eq!(attempts.take(), None);
        assert_eq!(attempts.used, 2);
    }
}
