//! Serve command: JSON-lines channel on stdin/stdout
//!
//! One request object per input line, one response per output line, in
//! order. Change events are interleaved on stdout as `{"event": {...}}`.
//!
//! ```text
//! {"op":"register_active_files","paths":["src/main.go"]}
//! {"op":"submit","prompt_text":"Summarize file main.go","llm_name":"ChatGPT"}
//! {"op":"list_recent","limit":5}
//! ```

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{stdin, stdout, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::flow::FlowEvent;
use crate::record::PromptFilter;
use crate::recorder::{Recorder, Submission};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Submit(Submission),
    Flow(FlowEvent),
    RegisterActiveFiles {
        paths: Vec<String>,
    },
    RegisterProject {
        path: PathBuf,
        #[serde(default)]
        patterns: Option<Vec<String>>,
    },
    ActiveFiles,
    AssociateFile {
        prompt_id: String,
        path: String,
        #[serde(default)]
        token_change: Option<i64>,
    },
    ListRecent {
        #[serde(default = "default_limit")]
        limit: usize,
        #[serde(default)]
        offset: usize,
    },
    Query(PromptFilter),
    Get {
        id: String,
    },
    Reconcile,
    Stats,
    SetRecording {
        enabled: bool,
    },
    RecordingStatus,
}

fn default_limit() -> usize {
    20
}

pub async fn run(recorder: Recorder) -> Result<()> {
    let recorder = Arc::new(recorder);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    // Single writer so responses and events never interleave mid-line
    let writer = tokio::spawn(async move {
        let mut out = stdout();
        while let Some(line) = out_rx.recv().await {
            if out.write_all(line.as_bytes()).await.is_err() || out.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = out.flush().await;
        }
    });

    let mut events = recorder.subscribe();
    let event_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if event_tx.send(json!({ "event": event }).to_string()).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!("serving JSON-lines requests on stdin");
    let mut lines = BufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let recorder = recorder.clone();
                match tokio::task::spawn_blocking(move || handle(&recorder, request)).await {
                    Ok(response) => response,
                    Err(e) => error_response(format!("request handler panicked: {}", e)),
                }
            }
            Err(e) => error_response(format!("invalid request: {}", e)),
        };

        if out_tx.send(response.to_string()).is_err() {
            break;
        }
    }

    info!("stdin closed, shutting down");
    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Execute one request against the recorder.
pub fn handle(recorder: &Recorder, request: Request) -> Value {
    let result = match request {
        Request::Submit(submission) => recorder.submit(submission).map(|o| json!(o)),
        Request::Flow(flow) => recorder.on_flow_observed(&flow).map(|o| json!(o)),
        Request::RegisterActiveFiles { paths } => recorder.register_active_files(paths.as_slice()).map(|p| json!(p)),
        Request::RegisterProject { path, patterns } => recorder
            .register_project_files(&path, patterns.as_deref())
            .map(|p| json!(p)),
        Request::ActiveFiles => recorder.active_files().map(|set| {
            json!({
                "paths": set.paths,
                "updated_at": set.updated_at,
            })
        }),
        Request::AssociateFile {
            prompt_id,
            path,
            token_change,
        } => recorder
            .associate_file(&prompt_id, &path, token_change)
            .map(|o| json!(o)),
        Request::ListRecent { limit, offset } => recorder.list_page(limit, offset).map(|r| json!(r)),
        Request::Query(filter) => recorder.query(&filter).map(|r| json!(r)),
        Request::Get { id } => recorder.get(&id).map(|r| json!(r)),
        Request::Reconcile => recorder.reconcile().map(|r| json!(r)),
        Request::Stats => recorder.stats().map(|s| json!(s)),
        Request::SetRecording { enabled } => recorder.set_recording(enabled).map(|s| json!(s)),
        Request::RecordingStatus => recorder.recording_status().map(|s| json!(s)),
    };

    match result {
        Ok(value) => json!({ "ok": true, "result": value }),
        Err(e) => error_response(e.to_string()),
    }
}

fn error_response(message: String) -> Value {
    json!({ "ok": false, "error": message })
}
