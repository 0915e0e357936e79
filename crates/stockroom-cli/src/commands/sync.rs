use stockroom_core::sync::{CycleOutcome, CycleReport, CycleSkip};

use crate::commands::common::Session;
use crate::error::CliError;

pub async fn run_sync(session: &Session) -> Result<(), CliError> {
    session.require_user()?;
    let engine = session.open_engine().await?;

    match engine.force_sync().await? {
        CycleOutcome::Completed(report) => {
            for error in &report.push.errors {
                eprintln!("Warning: {error}");
            }
            println!("{}", summarize_cycle(&report));
        }
        CycleOutcome::Skipped(CycleSkip::Offline) => println!("Sync skipped: offline"),
        CycleOutcome::Skipped(CycleSkip::AlreadyRunning) => {
            println!("Sync skipped: another cycle is running");
        }
    }
    Ok(())
}

pub fn summarize_cycle(report: &CycleReport) -> String {
    let pulled = report.pull.as_ref().map_or(0, |pull| pull.applied);
    let push = &report.push;
    let mut summary = format!("Sync completed: pulled {pulled}, pushed {}", push.pushed);
    if push.retried > 0 || push.deferred > 0 {
        summary.push_str(&format!(", {} waiting to retry", push.retried + push.deferred));
    }
    if push.failed > 0 {
        summary.push_str(&format!(", {} failed", push.failed));
    }
    summary
}
