use stockroom_core::Table;

use crate::commands::common::{normalize_record_identifier, resolve_record, Session};
use crate::error::CliError;

pub async fn run_rm(table: Table, id: &str, session: &Session) -> Result<(), CliError> {
    let normalized_id = normalize_record_identifier(id)?;
    let engine = session.open_engine().await?;
    let record = resolve_record(table, &normalized_id, engine.local_store().as_ref()).await?;

    engine.delete_record(table, &record.local_id).await?;
    println!("{}", record.local_id);
    Ok(())
}
