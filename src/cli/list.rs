//! List and query command implementation

use anyhow::Result;

use crate::record::{PromptFilter, PromptRecord};
use crate::recorder::Recorder;

pub fn run(recorder: &Recorder, limit: usize, offset: usize) -> Result<()> {
    let records = recorder.query(&PromptFilter::page(limit, offset))?;
    print_table(&records);
    Ok(())
}

pub fn query(recorder: &Recorder, filter: &PromptFilter, json: bool) -> Result<()> {
    let records = recorder.query(filter)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_table(&records);
    }
    Ok(())
}

fn print_table(records: &[PromptRecord]) {
    if records.is_empty() {
        println!("No prompts found.");
        return;
    }

    println!(
        "{:<12} {:<10} {:<12} {:<22} {:<10} {}",
        "Timestamp", "ID", "LLM", "Source", "Conv", "Prompt"
    );
    println!("{}", "-".repeat(100));

    for record in records {
        let timestamp = record.timestamp.format("%m-%d %H:%M").to_string();

        // First line only, truncated on a char boundary
        let first_line = record.prompt_text.lines().next().unwrap_or_default();
        let prompt = if first_line.chars().count() > 40 {
            format!("{}...", first_line.chars().take(37).collect::<String>())
        } else {
            first_line.to_string()
        };

        println!(
            "{:<12} {:<10} {:<12} {:<22} {:<10} {}",
            timestamp,
            record.id.chars().take(8).collect::<String>(),
            record.llm_name,
            record.source,
            short(&record.conversation_id),
            prompt,
        );
    }
}

/// Distinguishing part of a conversation id, for display
fn short(id: &str) -> String {
    let tail = id.rsplit(['-', ':']).next().unwrap_or(id);
    let source = if tail.len() >= 8 { tail } else { id };
    source.chars().take(8).collect()
}
