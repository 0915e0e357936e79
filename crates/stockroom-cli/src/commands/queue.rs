use stockroom_core::Table;

use crate::commands::common::{format_operation_lines, Session};
use crate::error::CliError;

pub async fn run_queue(as_json: bool, session: &Session) -> Result<(), CliError> {
    let engine = session.open_engine().await?;
    let operations = engine.queue().all().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&operations)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for line in format_operation_lines(&operations) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_queue_retry(session: &Session) -> Result<(), CliError> {
    let engine = session.open_engine().await?;
    let reset = engine.retry_failed().await?;
    println!("{reset} failed operation(s) queued for retry");
    Ok(())
}

pub async fn run_queue_purge(table: Table, session: &Session) -> Result<(), CliError> {
    let engine = session.open_engine().await?;
    let purged = engine.purge_pending_creates(table).await?;
    println!("{purged} pending {table} create(s) removed");
    Ok(())
}
