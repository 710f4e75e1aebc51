//! Configuration management with YAML support

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub conversation: ConversationConfig,

    #[serde(default)]
    pub deduplication: DeduplicationConfig,

    #[serde(default)]
    pub vendors: HashMap<String, VendorConfig>,

    #[serde(default)]
    pub files: FilesConfig,

    #[serde(default)]
    pub recording: RecordingConfig,
}

/// Primary and backup store locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_backup_path")]
    pub backup_path: String,

    /// How long a single SQLite call waits on another process's lock
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Bounded retry for a busy primary store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,

    /// First backoff delay; doubled after every failed attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

/// Conversation grouping heuristic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_recency_window_secs")]
    pub recency_window_secs: u64,
}

/// Duplicate delivery suppression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_dedup_window_secs")]
    pub window_secs: u64,
}

/// Individual vendor schema configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub status: Option<String>, // 'active', 'frozen', 'deprecated'
}

/// Project file registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_file_patterns")]
    pub default_patterns: Vec<String>,
}

/// Whether prompts are recorded at startup; switchable at runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_database_path() -> String {
    "~/.local/share/prompt-recorder/prompts.db".to_string()
}

fn default_backup_path() -> String {
    "~/.local/share/prompt-recorder/prompts.json".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    250
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_recency_window_secs() -> u64 {
    30 * 60
}

fn default_dedup_window_secs() -> u64 {
    5
}

fn default_enabled() -> bool {
    true
}

fn default_file_patterns() -> Vec<String> {
    [
        "*.py", "*.js", "*.ts", "*.html", "*.css", "*.cpp", "*.c", "*.h", "*.java", "*.kt",
        "*.xml", "*.json", "*.md", "*.rs", "*.go",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            backup_path: default_backup_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            recency_window_secs: default_recency_window_secs(),
        }
    }
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_dedup_window_secs(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            default_patterns: default_file_patterns(),
        }
    }
}

/// Retry settings resolved into durations
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub busy_timeout: Duration,
}

impl RetryPolicy {
    /// Delay to sleep after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Config::default().retry_policy()
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./prompt-recorder.yaml (current directory)
    /// 3. ~/.config/prompt-recorder/prompt-recorder.yaml
    /// 4. the platform config directory (e.g. ~/Library/Application Support on macOS)
    pub fn load(path: &str) -> Result<Self> {
        let mut search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "prompt-recorder.yaml".to_string(),
            shellexpand::tilde("~/.config/prompt-recorder/prompt-recorder.yaml").to_string(),
        ];
        if let Some(dir) = dirs::config_dir() {
            search_paths.push(
                dir.join("prompt-recorder")
                    .join("prompt-recorder.yaml")
                    .to_string_lossy()
                    .to_string(),
            );
        }

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)
                    .with_context(|| format!("Failed to read config {}", search_path))?;
                let config: Config = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config {}", search_path))?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Get the primary database path, expanding ~ to home directory
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.database_path).to_string())
    }

    /// Get the backup JSON path, expanding ~ to home directory
    pub fn backup_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.backup_path).to_string())
    }

    /// Check if a vendor schema is enabled
    /// Returns false if:
    /// - Vendor is explicitly disabled
    /// - Vendor status is 'frozen' or 'deprecated'
    pub fn is_vendor_enabled(&self, vendor_id: &str) -> bool {
        self.vendors.get(vendor_id).map_or(true, |v| {
            if !v.enabled {
                return false;
            }
            !matches!(v.status.as_deref(), Some("frozen") | Some("deprecated"))
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts.max(1),
            backoff: Duration::from_millis(self.retry.backoff_ms),
            busy_timeout: Duration::from_millis(self.storage.busy_timeout_ms),
        }
    }

    pub fn recency_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.conversation.recency_window_secs as i64)
    }

    /// Dedup window, or `None` when deduplication is switched off
    pub fn dedup_window(&self) -> Option<chrono::Duration> {
        self.deduplication
            .enabled
            .then(|| chrono::Duration::seconds(self.deduplication.window_secs as i64))
    }
}
