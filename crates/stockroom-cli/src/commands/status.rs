use stockroom_core::SyncState;

use crate::commands::common::{format_status_lines, Session};
use crate::error::CliError;

pub async fn run_status(as_json: bool, session: &Session) -> Result<(), CliError> {
    let engine = session.open_engine().await?;
    let status = engine.sync_status().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("state:        {}", SyncState::from(&status));
    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}
