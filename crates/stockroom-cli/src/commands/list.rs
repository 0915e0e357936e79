use stockroom_core::Table;

use crate::commands::common::{
    format_record_lines, list_records, record_to_list_item, RecordListItem, Session,
};
use crate::error::CliError;

pub async fn run_list(
    table: Table,
    limit: usize,
    as_json: bool,
    session: &Session,
) -> Result<(), CliError> {
    let engine = session.open_engine().await?;
    let records = list_records(table, limit, engine.local_store().as_ref()).await?;

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if records.is_empty() {
        println!("No {table} records.");
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}
