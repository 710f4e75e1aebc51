//! Show command implementation

use anyhow::{bail, Result};

use crate::record::PromptFilter;
use crate::recorder::Recorder;

/// Print one prompt. `id` may be a unique prefix of the full id.
pub fn run(recorder: &Recorder, id: &str) -> Result<()> {
    let record = match recorder.get(id)? {
        Some(record) => record,
        None => {
            let mut matches: Vec<_> = recorder
                .query(&PromptFilter::default())?
                .into_iter()
                .filter(|r| r.id.starts_with(id))
                .collect();
            match matches.len() {
                0 => {
                    println!("Prompt '{}' not found.", id);
                    return Ok(());
                }
                1 => matches.remove(0),
                n => bail!("prefix '{}' matches {} prompts", id, n),
            }
        }
    };

    println!("\n{}", "=".repeat(80));
    println!("Prompt: {}", record.id);
    println!("LLM: {} | Source: {}", record.llm_name, record.source);
    if !record.model_name.is_empty() {
        println!("Model: {}", record.model_name);
    }
    println!("Conversation: {}", record.conversation_id);
    println!("Captured: {}", crate::record::format_timestamp(&record.timestamp));
    if let Some(url) = &record.url {
        println!("URL: {}", url);
    }
    if let Some(description) = &record.description {
        println!("Description: {}", description);
    }
    println!("{}", "=".repeat(80));

    println!("\n{}\n", record.prompt_text);

    let files = recorder.associations(&record.id)?;
    if !files.is_empty() {
        println!("Files:");
        for file in files {
            match file.token_change {
                Some(delta) => println!("  {} ({:+} tokens)", file.file_path, delta),
                None => println!("  {}", file.file_path),
            }
        }
    }

    if !record.metadata.is_empty() {
        println!("\nMetadata: {}", serde_json::to_string_pretty(&record.metadata)?);
    }

    Ok(())
}
