use stockroom_core::Table;

use crate::commands::common::{
    normalize_record_identifier, resolve_record, resolve_record_fields, Session,
};
use crate::error::CliError;

pub async fn run_edit(
    table: Table,
    id: &str,
    json: Option<&str>,
    session: &Session,
) -> Result<(), CliError> {
    let normalized_id = normalize_record_identifier(id)?;
    let changes = resolve_record_fields(json)?;

    let engine = session.open_engine().await?;
    let record = resolve_record(table, &normalized_id, engine.local_store().as_ref()).await?;

    let unchanged = changes
        .iter()
        .all(|(key, value)| record.fields.get(key) == Some(value));
    if unchanged {
        println!("{}", record.local_id);
        return Ok(());
    }

    engine.update_record(table, &record.local_id, changes).await?;
    println!("{}", record.local_id);
    Ok(())
}
