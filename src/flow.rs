//! Observed HTTP exchanges as handed over by the interception transport
//!
//! The transport owns TLS and stream reassembly; by the time a `FlowEvent`
//! reaches us the request body is fully buffered cleartext (possibly still
//! content-encoded).

use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

/// One completed (or aborted) request/response exchange
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "RawFlowEvent")]
pub struct FlowEvent {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub response: Option<FlowResponse>,
    /// Set by the transport when the exchange was cut off before completion
    pub aborted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FlowResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl FlowEvent {
    pub fn new(method: &str, url: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_response(mut self, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.response = Some(FlowResponse {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        });
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Decoded view for vendor schemas, or `None` when there is nothing to inspect.
    pub fn payload(&self) -> Option<Payload<'_>> {
        if self.aborted || self.body.is_empty() {
            return None;
        }

        let url = Url::parse(&self.url).ok()?;
        let target = format!("{}{}", url.host_str()?, url.path());
        let body = decode_body(&self.body, self.header("content-encoding"))?;
        let response = self.response.as_ref().and_then(|r| {
            decode_body(&r.body, find_header(&r.headers, "content-encoding"))
        });

        Some(Payload {
            url,
            target,
            content_type: self.header("content-type").map(|v| v.to_ascii_lowercase()),
            body,
            response,
        })
    }
}

fn find_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn decode_body<'a>(raw: &'a [u8], encoding: Option<&str>) -> Option<Cow<'a, [u8]>> {
    match encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("identity") => Some(Cow::Borrowed(raw)),
        Some("zstd") => match zstd::decode_all(raw) {
            Ok(decoded) => Some(Cow::Owned(decoded)),
            Err(e) => {
                debug!(error = %e, "zstd body did not decode");
                None
            }
        },
        Some(other) => {
            debug!(encoding = other, "unsupported content-encoding");
            None
        }
    }
}

/// Decoded request (and response) body plus the URL it was sent to
#[derive(Debug)]
pub struct Payload<'a> {
    pub url: Url,
    /// Host and path, the string URL rules are matched against
    pub target: String,
    pub content_type: Option<String>,
    pub body: Cow<'a, [u8]>,
    pub response: Option<Cow<'a, [u8]>>,
}

impl<'a> Payload<'a> {
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// The request body as a single JSON document.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// The request body as a sequence of events (SSE or concatenated JSON).
    pub fn events(&self) -> Vec<Value> {
        parse_events(&self.body)
    }

    /// The response body as a sequence of events.
    pub fn response_events(&self) -> Vec<Value> {
        self.response
            .as_deref()
            .map(parse_events)
            .unwrap_or_default()
    }

    pub fn is_form(&self) -> bool {
        self.content_type
            .as_deref()
            .map_or(false, |ct| ct.contains("application/x-www-form-urlencoded"))
    }

    /// The request body decoded as `application/x-www-form-urlencoded` pairs.
    pub fn form(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(&self.body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}

/// Parse a streamed body into JSON events.
///
/// Server-sent events (`data:` lines) are tried first; otherwise the body is
/// read as back-to-back JSON documents. Anything unparseable is skipped.
pub fn parse_events(raw: &[u8]) -> Vec<Value> {
    let text = String::from_utf8_lossy(raw);

    let sse: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty() && *data != "[DONE]")
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect();
    if !sse.is_empty() {
        return sse;
    }

    serde_json::Deserializer::from_slice(raw)
        .into_iter::<Value>()
        .map_while(Result::ok)
        .collect()
}

#[derive(Deserialize)]
struct RawFlowEvent {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    body_base64: Option<String>,
    #[serde(default)]
    response: Option<RawFlowResponse>,
    #[serde(default)]
    aborted: bool,
}

#[derive(Deserialize)]
struct RawFlowResponse {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    body_base64: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn raw_body(text: Option<String>, encoded: Option<String>) -> Result<Vec<u8>, String> {
    match (text, encoded) {
        (_, Some(encoded)) => base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("invalid body_base64: {}", e)),
        (Some(text), None) => Ok(text.into_bytes()),
        (None, None) => Ok(Vec::new()),
    }
}

impl TryFrom<RawFlowEvent> for FlowEvent {
    type Error = String;

    fn try_from(raw: RawFlowEvent) -> Result<Self, Self::Error> {
        let response = match raw.response {
            Some(r) => Some(FlowResponse {
                status: r.status,
                headers: r.headers,
                body: raw_body(r.body, r.body_base64)?,
            }),
            None => None,
        };

        Ok(FlowEvent {
            method: raw.method,
            url: raw.url,
            headers: raw.headers,
            body: raw_body(raw.body, raw.body_base64)?,
            response,
            aborted: raw.aborted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aborted_or_empty_flow_has_no_payload() {
        let mut flow = FlowEvent::new("POST", "https://api.openai.com/v1/chat/completions", "{}");
        flow.aborted = true;
        assert!(flow.payload().is_none());

        let flow = FlowEvent::new("GET", "https://api.openai.com/v1/models", "");
        assert!(flow.payload().is_none());
    }

    #[test]
    fn test_target_strips_scheme_and_query() {
        let flow = FlowEvent::new(
            "POST",
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent?key=abc",
            "{}",
        );
        let payload = flow.payload().unwrap();
        assert_eq!(
            payload.target,
            "generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
        );
    }

    #[test]
    fn test_zstd_body_is_decoded() {
        let compressed = zstd::encode_all(&br#"{"prompt":"hello"}"#[..], 0).unwrap();
        let flow = FlowEvent::new("POST", "https://api.groq.com/v1/completions", compressed)
            .with_header("Content-Encoding", "zstd");
        let payload = flow.payload().unwrap();
        assert_eq!(payload.json().unwrap()["prompt"], "hello");
    }

    #[test]
    fn test_unknown_encoding_declines() {
        let flow = FlowEvent::new("POST", "https://api.groq.com/v1/completions", vec![0x1f_u8, 0x8b])
            .with_header("content-encoding", "br");
        assert!(flow.payload().is_none());
    }

    #[test]
    fn test_parse_sse_events() {
        let raw = b"event: delta\ndata: {\"a\":1}\n\ndata: {\"a\":2}\n\ndata: [DONE]\n\n";
        let events = parse_events(raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["a"], 2);
    }

    #[test]
    fn test_parse_concatenated_json_events() {
        let raw = br#"{"a":1}{"a":2}
{"a":3}"#;
        assert_eq!(parse_events(raw).len(), 3);
        assert!(parse_events(b"not json at all").is_empty());
    }

    #[test]
    fn test_deserialize_flow_event() {
        let json = r#"{
            "url": "https://api.anthropic.com/v1/messages",
            "headers": {"Content-Type": "application/json"},
            "body_base64": "eyJwcm9tcHQiOiJoaSJ9",
            "response": {"status": 200, "body": "data: {}"}
        }"#;
        let flow: FlowEvent = serde_json::from_str(json).unwrap();
        assert_eq!(flow.method, "POST");
        assert_eq!(flow.body, br#"{"prompt":"hi"}"#.to_vec());
        assert_eq!(flow.header("content-type"), Some("application/json"));
        assert_eq!(flow.response.unwrap().status, 200);

        let bad = r#"{"url": "https://x", "body_base64": "%%%"}"#;
        assert!(serde_json::from_str::<FlowEvent>(bad).is_err());
    }
}
