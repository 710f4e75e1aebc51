//! Associate command implementation

use anyhow::Result;

use crate::recorder::Recorder;

pub fn run(recorder: &Recorder, prompt_id: &str, path: &str, tokens: Option<i64>) -> Result<()> {
    let outcome = recorder.associate_file(prompt_id, path, tokens)?;
    println!("Linked {} -> {}", prompt_id, outcome.association.file_path);
    if let Some(reason) = outcome.degraded {
        println!("Database not updated ({}); run 'prompt-recorder reconcile' later.", reason);
    }
    Ok(())
}
