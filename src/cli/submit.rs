//! Submit command implementation

use anyhow::Result;

use crate::coordinator::WriteOutcome;
use crate::recorder::{Recorder, Submission};

pub fn run(recorder: &Recorder, submission: Submission) -> Result<()> {
    let outcome = recorder.submit(submission)?;
    print_outcome(&outcome);
    Ok(())
}

pub fn print_outcome(outcome: &WriteOutcome) {
    match outcome {
        WriteOutcome::Recorded { id, conversation_id } => {
            println!("Recorded {} (conversation {})", id, conversation_id);
        }
        WriteOutcome::Degraded {
            id,
            conversation_id,
            reason,
        } => {
            println!(
                "Recorded {} (conversation {}) in backup only: {}",
                id, conversation_id, reason
            );
            println!("Run 'prompt-recorder reconcile' once the database is reachable.");
        }
        WriteOutcome::Duplicate {
            dropped_id,
            existing_id,
        } => {
            println!("Dropped duplicate {} (already recorded as {})", dropped_id, existing_id);
        }
    }
}
