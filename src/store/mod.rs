//! Prompt storage
//!
//! - `PromptStore`: the primary SQLite store, queryable and indexed
//! - `BackupStore`: the JSON array document every write lands in first

mod backup;
mod schema;

pub use backup::{BackupEntry, BackupStore};
pub use schema::SCHEMA;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::record::{format_timestamp, parse_timestamp, FileAssociation, PromptFilter, PromptRecord, Source};

const PROMPT_COLUMNS: &str = "p.id, p.timestamp, p.source, p.llm_name, p.model_name, p.prompt_text, \
                              p.description, p.url, p.conversation_id, p.metadata";

pub struct PromptStore {
    conn: Connection,
    path: PathBuf,
}

impl PromptStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let store = Self {
            conn,
            path: path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ============================================
    // WRITES
    // ============================================

    /// Insert a record and its associations in one transaction.
    ///
    /// Returns false when the id was already present; associations are still
    /// merged in, so replaying a write is a no-op rather than an error.
    pub fn insert_record(&mut self, record: &PromptRecord, files: &[FileAssociation]) -> Result<bool> {
        let tx = self.conn.transaction()?;

        let metadata = if record.metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&record.metadata)?)
        };

        let inserted = tx.execute(
            r#"INSERT OR IGNORE INTO prompts
               (id, timestamp, source, llm_name, model_name, prompt_text, description, url,
                conversation_id, metadata)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                record.id,
                format_timestamp(&record.timestamp),
                record.source.as_str(),
                record.llm_name,
                record.model_name,
                record.prompt_text,
                record.description,
                record.url,
                record.conversation_id,
                metadata,
            ],
        )? > 0;

        for file in files {
            upsert_association(&tx, &record.id, &file.file_path, file.token_change)?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Add (or refresh the token delta of) one file association.
    pub fn add_association(&self, association: &FileAssociation) -> Result<bool> {
        let changed = upsert_association(
            &self.conn,
            &association.prompt_id,
            &association.file_path,
            association.token_change,
        )?;
        Ok(changed > 0)
    }

    // ============================================
    // QUERIES
    // ============================================

    pub fn contains(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM prompts WHERE id = ?", params![id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get(&self, id: &str) -> Result<Option<PromptRecord>> {
        let sql = format!("SELECT {} FROM prompts p WHERE p.id = ?", PROMPT_COLUMNS);
        let record = self
            .conn
            .query_row(&sql, params![id], map_prompt)
            .optional()?;
        Ok(record)
    }

    pub fn all_ids(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT id FROM prompts")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Id of a record with the same (llm_name, prompt_text, conversation_id)
    /// whose timestamp falls in `[from, to]`.
    pub fn find_duplicate(
        &self,
        record: &PromptRecord,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let id = self
            .conn
            .query_row(
                r#"SELECT id FROM prompts
                   WHERE llm_name = ?1 AND prompt_text = ?2 AND COALESCE(conversation_id, '') = ?3
                     AND timestamp >= ?4 AND timestamp <= ?5 AND id != ?6
                   ORDER BY timestamp DESC
                   LIMIT 1"#,
                params![
                    record.llm_name,
                    record.prompt_text,
                    record.conversation_id,
                    format_timestamp(&from),
                    format_timestamp(&to),
                    record.id,
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Records matching the filter, newest first.
    pub fn query(&self, filter: &PromptFilter) -> Result<Vec<PromptRecord>> {
        let mut sql = format!("SELECT DISTINCT {} FROM prompts p", PROMPT_COLUMNS);
        let mut clauses: Vec<&str> = vec![];
        let mut values: Vec<SqlValue> = vec![];

        if let Some(ref path) = filter.file_path {
            sql.push_str(" JOIN file_associations fa ON fa.prompt_id = p.id");
            clauses.push("instr(fa.file_path, ?) > 0");
            values.push(SqlValue::Text(path.clone()));
        }
        if let Some(source) = filter.source {
            clauses.push("p.source = ?");
            values.push(SqlValue::Text(source.as_str().to_string()));
        }
        if let Some(ref llm) = filter.llm_name {
            clauses.push("p.llm_name = ?");
            values.push(SqlValue::Text(llm.clone()));
        }
        if let Some(since) = filter.since {
            clauses.push("p.timestamp >= ?");
            values.push(SqlValue::Text(format_timestamp(&since)));
        }
        if let Some(until) = filter.until {
            clauses.push("p.timestamp <= ?");
            values.push(SqlValue::Text(format_timestamp(&until)));
        }
        if let Some(ref text) = filter.text {
            clauses.push("instr(p.prompt_text, ?) > 0");
            values.push(SqlValue::Text(text.clone()));
        }
        if let Some(ref conversation) = filter.conversation_id {
            clauses.push("p.conversation_id = ?");
            values.push(SqlValue::Text(conversation.clone()));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY p.timestamp DESC, p.id");
        if filter.limit.is_some() || filter.offset.is_some() {
            // LIMIT -1 is unbounded, OFFSET needs a LIMIT clause
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(SqlValue::Integer(filter.limit.map_or(-1, |l| l as i64)));
            values.push(SqlValue::Integer(filter.offset.unwrap_or(0) as i64));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), map_prompt)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn associations(&self, prompt_id: &str) -> Result<Vec<FileAssociation>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT prompt_id, file_path, token_change
               FROM file_associations
               WHERE prompt_id = ?
               ORDER BY rowid"#,
        )?;
        let rows = stmt
            .query_map(params![prompt_id], |row| {
                Ok(FileAssociation {
                    prompt_id: row.get(0)?,
                    file_path: row.get(1)?,
                    token_change: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM prompts", [], |row| row.get(0))?;
        let associations: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM file_associations", [], |row| row.get(0))?;

        Ok(StoreStats {
            total,
            associations,
            by_llm: self.count_by("llm_name")?,
            by_source: self.count_by("source")?,
        })
    }

    fn count_by(&self, column: &str) -> Result<BTreeMap<String, i64>> {
        let sql = format!("SELECT {0}, COUNT(*) FROM prompts GROUP BY {0}", column);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(rows)
    }
}

fn upsert_association(
    conn: &Connection,
    prompt_id: &str,
    file_path: &str,
    token_change: Option<i64>,
) -> rusqlite::Result<usize> {
    conn.execute(
        r#"INSERT INTO file_associations (prompt_id, file_path, token_change)
           VALUES (?, ?, ?)
           ON CONFLICT(prompt_id, file_path) DO UPDATE SET
               token_change = COALESCE(excluded.token_change, file_associations.token_change)"#,
        params![prompt_id, file_path, token_change],
    )
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn map_prompt(row: &rusqlite::Row) -> rusqlite::Result<PromptRecord> {
    let raw_ts: String = row.get(1)?;
    let timestamp =
        parse_timestamp(&raw_ts).ok_or_else(|| conversion_error(1, format!("bad timestamp {}", raw_ts)))?;

    let raw_source: String = row.get(2)?;
    let source =
        Source::parse(&raw_source).ok_or_else(|| conversion_error(2, format!("bad source {}", raw_source)))?;

    let metadata = match row.get::<_, Option<String>>(9)? {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| conversion_error(9, e.to_string()))?,
        None => Default::default(),
    };

    Ok(PromptRecord {
        id: row.get(0)?,
        timestamp,
        source,
        llm_name: row.get(3)?,
        model_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        prompt_text: row.get(5)?,
        description: row.get(6)?,
        url: row.get(7)?,
        conversation_id: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        metadata,
    })
}

// ============================================
// ROW TYPES
// ============================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub associations: i64,
    pub by_llm: BTreeMap<String, i64>,
    pub by_source: BTreeMap<String, i64>,
}
