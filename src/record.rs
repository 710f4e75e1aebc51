//! Normalized prompt records and the types that travel with them

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

use crate::error::{RecorderError, Result};

/// Where a prompt entered the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    /// Extracted from intercepted HTTP traffic
    #[serde(alias = "Web Browser")]
    Proxy,
    /// Submitted by an assistant integration over the stdio channel
    #[serde(alias = "Claude Desktop", alias = "mcp", alias = "assistant")]
    AssistantIntegration,
    /// Submitted through the REST front door (browser extensions)
    #[serde(alias = "browser_extension", alias = "json_import", alias = "rest")]
    RestApi,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Proxy => "proxy",
            Source::AssistantIntegration => "assistant-integration",
            Source::RestApi => "rest-api",
        }
    }

    /// Parse a stored or user-supplied label, including the legacy desktop labels.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim() {
            "proxy" | "Web Browser" => Some(Source::Proxy),
            "assistant-integration" | "assistant" | "mcp" | "Claude Desktop" => {
                Some(Source::AssistantIntegration)
            }
            "rest-api" | "rest" | "browser_extension" | "json_import" => Some(Source::RestApi),
            _ => None,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    pub llm_name: String,
    /// Empty when the payload did not name a model
    #[serde(default)]
    pub model_name: String,
    pub prompt_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Empty until the conversation tracker assigns one
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl PromptRecord {
    /// Create a record with a fresh id and capture time.
    pub fn new(source: Source, llm_name: impl Into<String>, prompt_text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: capture_time(),
            source,
            llm_name: llm_name.into(),
            model_name: String::new(),
            prompt_text: prompt_text.into(),
            description: None,
            url: None,
            conversation_id: String::new(),
            metadata: Map::new(),
        }
    }

    /// Reject records that must never reach a store.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RecorderError::validation("record id is empty"));
        }
        if self.prompt_text.trim().is_empty() {
            return Err(RecorderError::validation("prompt text is empty"));
        }
        if self.llm_name.trim().is_empty() {
            return Err(RecorderError::validation("llm name is empty"));
        }
        Ok(())
    }

    /// Host of the origin URL, if any
    pub fn host(&self) -> Option<String> {
        self.url
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

/// Link between a prompt and a file believed relevant to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAssociation {
    pub prompt_id: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_change: Option<i64>,
}

/// Query filters; every set field narrows the result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptFilter {
    #[serde(default)]
    pub source: Option<Source>,
    #[serde(default)]
    pub llm_name: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    /// Substring of the prompt text
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Substring of an associated file path
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Rows to skip before `limit` applies
    #[serde(default)]
    pub offset: Option<usize>,
}

impl PromptFilter {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// One page of the newest-first listing
    pub fn page(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
            ..Self::default()
        }
    }

    /// In-memory form of the SQL filter, used when serving from the backup store.
    pub fn matches(&self, record: &PromptRecord, files: &[String]) -> bool {
        if let Some(source) = self.source {
            if record.source != source {
                return false;
            }
        }
        if let Some(ref llm) = self.llm_name {
            if &record.llm_name != llm {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        if let Some(ref text) = self.text {
            if !record.prompt_text.contains(text.as_str()) {
                return false;
            }
        }
        if let Some(ref conversation) = self.conversation_id {
            if &record.conversation_id != conversation {
                return false;
            }
        }
        if let Some(ref path) = self.file_path {
            if !files.iter().any(|f| f.contains(path.as_str())) {
                return false;
            }
        }
        true
    }
}

static LAST_CAPTURE_MICROS: AtomicI64 = AtomicI64::new(0);

/// Current time at microsecond precision, never earlier than a previous call in this process.
pub fn capture_time() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let previous = LAST_CAPTURE_MICROS.fetch_max(now, Ordering::SeqCst);
    let micros = now.max(previous);
    DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse RFC 3339, or the zone-less ISO form older desktop builds wrote (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Serde adapter keeping stored timestamps at microsecond precision.
pub(crate) mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_time_is_non_decreasing() {
        let mut last = capture_time();
        for _ in 0..1000 {
            let next = capture_time();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn test_validate_rejects_blank_prompt() {
        let record = PromptRecord::new(Source::RestApi, "ChatGPT", "   \n\t");
        assert!(matches!(record.validate(), Err(RecorderError::Validation(_))));

        let record = PromptRecord::new(Source::RestApi, "ChatGPT", "hello");
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_legacy_source_labels() {
        assert_eq!(Source::parse("Claude Desktop"), Some(Source::AssistantIntegration));
        assert_eq!(Source::parse("Web Browser"), Some(Source::Proxy));
        assert_eq!(Source::parse("json_import"), Some(Source::RestApi));
        assert_eq!(Source::parse("carrier pigeon"), None);

        let parsed: Source = serde_json::from_str("\"Claude Desktop\"").unwrap();
        assert_eq!(parsed, Source::AssistantIntegration);
    }

    #[test]
    fn test_parse_legacy_timestamp() {
        let ts = parse_timestamp("2024-03-01T10:15:30.123456").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-01T10:15:30.123456Z");
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_host_from_url() {
        let mut record = PromptRecord::new(Source::Proxy, "Claude", "hi");
        assert_eq!(record.host(), None);
        record.url = Some("https://api.anthropic.com/v1/messages".to_string());
        assert_eq!(record.host().as_deref(), Some("api.anthropic.com"));
    }
}
