//! Stats command implementation

use anyhow::Result;

use crate::recorder::Recorder;

pub fn run(recorder: &Recorder) -> Result<()> {
    let stats = recorder.stats()?;

    if !stats.primary_available {
        println!("⚠ database unavailable, figures come from the backup store\n");
    }
    println!("Prompts:        {}", stats.total);
    println!("Associations:   {}", stats.associations);
    println!("Backup entries: {}", stats.backup_entries);

    if !stats.by_llm.is_empty() {
        println!("\nBy LLM:");
        for (llm, count) in &stats.by_llm {
            println!("  {:<16} {}", llm, count);
        }
    }
    if !stats.by_source.is_empty() {
        println!("\nBy source:");
        for (source, count) in &stats.by_source {
            println!("  {:<22} {}", source, count);
        }
    }
    Ok(())
}
