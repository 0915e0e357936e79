use stockroom_core::Table;

use crate::commands::common::{resolve_record_fields, Session};
use crate::error::CliError;

pub async fn run_add(table: Table, json: Option<&str>, session: &Session) -> Result<(), CliError> {
    let fields = resolve_record_fields(json)?;
    session.require_user()?;

    let engine = session.open_engine().await?;
    let id = engine.create_record(table, fields).await?;

    println!("{id}");
    Ok(())
}
