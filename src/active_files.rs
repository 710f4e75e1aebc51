//! Files currently in focus for automatic association
//!
//! Owned by whichever process hosts persistence and handed to the
//! coordinator by `Arc`; never persisted.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use walkdir::WalkDir;

use crate::error::{RecorderError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveFileSet {
    pub paths: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ActiveFileSet {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Default)]
pub struct ActiveFileRegistry {
    inner: Mutex<ActiveFileSet>,
}

impl ActiveFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active set. An empty list clears it.
    ///
    /// Paths are made absolute; duplicates collapse, order is kept.
    pub fn register<S: AsRef<str>>(&self, paths: &[S]) -> Result<Vec<String>> {
        let mut normalized: Vec<String> = Vec::with_capacity(paths.len());
        for path in paths {
            let path = normalize_path(path.as_ref())?;
            if !normalized.contains(&path) {
                normalized.push(path);
            }
        }

        let mut set = self.inner.lock().map_err(|_| RecorderError::Poisoned)?;
        set.paths = normalized.clone();
        set.updated_at = Some(Utc::now());
        info!(count = normalized.len(), "registered active files");
        Ok(normalized)
    }

    pub fn clear(&self) -> Result<()> {
        self.register::<&str>(&[]).map(|_| ())
    }

    /// Current set, unchanged.
    pub fn snapshot(&self) -> Result<ActiveFileSet> {
        let set = self.inner.lock().map_err(|_| RecorderError::Poisoned)?;
        Ok(set.clone())
    }
}

/// Validate a user-supplied file path and make it absolute.
pub fn normalize_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RecorderError::validation("file path is empty"));
    }
    if trimmed.contains('\0') {
        return Err(RecorderError::validation(format!(
            "file path contains a NUL byte: {:?}",
            trimmed
        )));
    }

    let expanded = PathBuf::from(shellexpand::tilde(trimmed).to_string());
    let absolute = std::path::absolute(&expanded)?;
    Ok(absolute.to_string_lossy().to_string())
}

/// Files under `root` whose name matches any of the glob patterns.
pub fn scan_project(root: &Path, patterns: &[String]) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Err(RecorderError::validation(format!(
            "project path {} is not a directory",
            root.display()
        )));
    }

    let compiled: Vec<glob::Pattern> = patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p)
                .map_err(|e| RecorderError::validation(format!("bad pattern {:?}: {}", p, e)))
        })
        .collect::<Result<_>>()?;

    let mut found = vec![];
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if compiled.iter().any(|p| p.matches(&name)) {
            found.push(normalize_path(&entry.path().to_string_lossy())?);
        }
    }
    found.sort();
    Ok(found)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    let name = name.to_string_lossy();
    name.len() > 1 && name.starts_with('.')
}
