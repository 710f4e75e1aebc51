//! Reconcile command implementation

use anyhow::Result;

use crate::recorder::Recorder;

pub fn run(recorder: &Recorder) -> Result<()> {
    let report = recorder.reconcile()?;
    println!("Backup entries:         {}", report.backup_entries);
    println!("Prompts restored:       {}", report.restored.len());
    println!("Associations restored:  {}", report.associations_restored);
    Ok(())
}
