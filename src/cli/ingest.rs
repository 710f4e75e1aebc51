//! Ingest command implementation
//!
//! Reads flow events from a file (or stdin with `-`): either one JSON
//! document (object or array) or one event per line.

use anyhow::{Context, Result};
use std::io::Read;
use tracing::{debug, error};

use crate::cli::submit::print_outcome;
use crate::flow::FlowEvent;
use crate::recorder::Recorder;

pub fn run(recorder: &Recorder, input: &str) -> Result<()> {
    let content = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read flow events from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))?
    };

    let flows = parse_flows(&content)?;
    println!("Inspecting {} flows...\n", flows.len());

    let summary = record_flows(recorder, &flows);
    if summary.failed > 0 {
        println!(
            "\n✗ {} of {} flows recorded a prompt, {} failed",
            summary.recorded,
            flows.len(),
            summary.failed
        );
    } else {
        println!("\n✓ {} of {} flows recorded a prompt", summary.recorded, flows.len());
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct IngestSummary {
    recorded: usize,
    failed: usize,
}

/// Store errors are logged per flow; the rest of the batch still runs.
fn record_flows(recorder: &Recorder, flows: &[FlowEvent]) -> IngestSummary {
    let mut summary = IngestSummary::default();
    for flow in flows {
        match recorder.on_flow_observed(flow) {
            Ok(Some(outcome)) => {
                print_outcome(&outcome);
                if outcome.id().is_some() {
                    summary.recorded += 1;
                }
            }
            Ok(None) => debug!(url = %flow.url, "no prompt in flow"),
            Err(e) => {
                error!(url = %flow.url, error = %e, "failed to record flow");
                summary.failed += 1;
            }
        }
    }
    summary
}

fn parse_flows(content: &str) -> Result<Vec<FlowEvent>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("Failed to parse flow event array");
    }
    if let Ok(single) = serde_json::from_str::<FlowEvent>(trimmed) {
        return Ok(vec![single]);
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("Failed to parse flow event on line {}", n + 1))
        })
        .collect()
}
