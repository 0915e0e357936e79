use std::time::Duration;

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use stockroom_core::db::{LibSqlLocalStore, LocalStore};
use stockroom_core::models::{Document, EntityRecord, SyncStatus};
use stockroom_core::sync::{CycleReport, PushReport, SyncEvent};
use stockroom_core::Table;
use tempfile::TempDir;

use crate::cli::{parse_table, CompletionShell};
use crate::commands::add::run_add;
use crate::commands::common::{
    format_relative_time, list_records, normalize_record_identifier, parse_fields,
    record_preview, resolve_record, Session,
};
use crate::commands::completions::render_completions;
use crate::commands::edit::run_edit;
use crate::commands::rm::run_rm;
use crate::commands::sync::{run_sync, summarize_cycle};
use crate::commands::watch::describe_event;
use crate::error::CliError;

fn document(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn record(value: serde_json::Value) -> EntityRecord {
    EntityRecord::try_from(document(value)).unwrap()
}

async fn seeded_store(documents: Vec<serde_json::Value>) -> LibSqlLocalStore {
    let store = LibSqlLocalStore::open_in_memory(Duration::ZERO).await.unwrap();
    for value in documents {
        store.insert("products", document(value)).await.unwrap();
    }
    store
}

fn device(dir: &TempDir, name: &str) -> Session {
    Session {
        db_path: dir.path().join(format!("{name}.db")),
        remote: dir.path().join("remote.db").to_string_lossy().into_owned(),
        config: None,
        user: Some("me".to_string()),
    }
}

#[test]
fn parse_table_accepts_known_names() {
    assert_eq!(parse_table("stock_movements").unwrap(), Table::StockMovements);
    let error = parse_table("notes").unwrap_err();
    assert!(error.contains("unknown table `notes`"));
    assert!(error.contains("products"));
}

#[test]
fn parse_fields_requires_a_non_empty_object() {
    let fields = parse_fields(r#"{ "name": "Ada" }"#).unwrap();
    assert_eq!(fields.get("name"), Some(&json!("Ada")));

    assert!(matches!(parse_fields("{}"), Err(CliError::EmptyFields)));
    assert!(matches!(parse_fields("[1, 2]"), Err(CliError::NotAnObject)));
    assert!(matches!(
        parse_fields("{ nope"),
        Err(CliError::Serialization(_))
    ));
}

#[test]
fn normalize_record_identifier_trims_and_rejects_empty() {
    assert_eq!(normalize_record_identifier("  abc ").unwrap(), "abc");
    assert!(matches!(
        normalize_record_identifier("   "),
        Err(CliError::EmptyRecordId)
    ));
}

#[test]
fn format_relative_time_units() {
    let now = Utc.timestamp_millis_opt(10_000_000_000).unwrap();
    let ago = |millis: i64| now - chrono::Duration::milliseconds(millis);
    assert_eq!(format_relative_time(ago(30_000), now), "just now");
    assert_eq!(format_relative_time(ago(120_000), now), "2m ago");
    assert_eq!(format_relative_time(ago(2 * 60 * 60_000), now), "2h ago");
    assert_eq!(format_relative_time(ago(3 * 24 * 60 * 60_000), now), "3d ago");
    // clock skew never yields negative ages
    assert_eq!(format_relative_time(ago(-5_000), now), "just now");
}

#[test]
fn record_preview_hides_owner_and_truncates() {
    let record = record(json!({
        "id": "id-1",
        "owner_id": "me",
        "name": "Cold brew concentrate, one litre bottle",
        "price": 12.5,
    }));
    let preview = record_preview(&record, 24);
    assert_eq!(preview.chars().count(), 24);
    assert!(preview.ends_with("..."));
    assert!(!preview.contains("owner_id"));

    let short = record_preview(&record, 200);
    assert!(short.contains("price=12.5"));
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_record_matches_ids_and_prefixes() {
    let store = seeded_store(vec![
        json!({ "id": "id-alpha-1", "remote_id": "r-one", "name": "Tea" }),
        json!({ "id": "id-alpha-2", "name": "Coffee" }),
        json!({ "id": "id-beta-1", "remote_id": "r-two", "name": "Milk" }),
    ])
    .await;

    let exact = resolve_record(Table::Products, "id-alpha-2", &store).await.unwrap();
    assert_eq!(exact.local_id, "id-alpha-2");

    let by_remote = resolve_record(Table::Products, "r-two", &store).await.unwrap();
    assert_eq!(by_remote.local_id, "id-beta-1");

    let by_prefix = resolve_record(Table::Products, "id-b", &store).await.unwrap();
    assert_eq!(by_prefix.local_id, "id-beta-1");

    let ambiguous = resolve_record(Table::Products, "id-alpha", &store)
        .await
        .unwrap_err();
    assert!(matches!(ambiguous, CliError::AmbiguousRecordId(_)));

    let missing = resolve_record(Table::Products, "zzz", &store).await.unwrap_err();
    assert!(matches!(missing, CliError::RecordNotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn list_records_shows_newest_first() {
    let store = seeded_store(vec![
        json!({ "id": "id-old", "name": "Old", "updated_at": "2024-01-01T00:00:00Z" }),
        json!({ "id": "id-new", "name": "New", "updated_at": "2024-03-01T00:00:00Z" }),
        json!({ "id": "id-mid", "name": "Mid", "updated_at": "2024-02-01T00:00:00Z" }),
    ])
    .await;

    let records = list_records(Table::Products, 2, &store).await.unwrap();
    let ids = records
        .iter()
        .map(|record| record.local_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["id-new", "id-mid"]);
}

#[test]
fn summarize_cycle_mentions_failures() {
    let report = CycleReport {
        pull: None,
        push: PushReport {
            pushed: 2,
            retried: 1,
            failed: 1,
            ..PushReport::default()
        },
        finished_at: Utc::now(),
    };
    assert_eq!(
        summarize_cycle(&report),
        "Sync completed: pulled 0, pushed 2, 1 waiting to retry, 1 failed"
    );
}

#[test]
fn describe_event_names_the_record() {
    let line = describe_event(&SyncEvent::OperationFailed {
        table: Table::Sales,
        record_id: "id-0123456789abcdef".to_string(),
        retry_count: 3,
        message: "timed out".to_string(),
        dead_lettered: true,
    });
    assert_eq!(line, "gave up on sales/id-012345678 after 3 attempt(s): timed out");
}

#[test]
fn completions_cover_every_shell() {
    for shell in [
        CompletionShell::Bash,
        CompletionShell::Zsh,
        CompletionShell::Fish,
        CompletionShell::PowerShell,
        CompletionShell::Elvish,
    ] {
        let script = String::from_utf8(render_completions(shell)).unwrap();
        assert!(script.contains("stockroom"), "{shell:?}");
        assert!(script.contains("purge"), "{shell:?}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn add_requires_a_user() {
    let dir = TempDir::new().unwrap();
    let session = Session {
        user: None,
        ..device(&dir, "solo")
    };
    let error = run_add(Table::Customers, Some(r#"{ "name": "Ada" }"#), &session)
        .await
        .unwrap_err();
    assert!(matches!(error, CliError::MissingUser));
}

#[tokio::test(flavor = "multi_thread")]
async fn two_devices_share_records_through_the_remote_store() {
    let dir = TempDir::new().unwrap();
    let laptop = device(&dir, "laptop");
    let till = device(&dir, "till");

    run_add(
        Table::Customers,
        Some(r#"{ "name": "Ada", "phone": "1" }"#),
        &laptop,
    )
    .await
    .unwrap();
    run_sync(&laptop).await.unwrap();
    run_sync(&till).await.unwrap();

    let engine = till.open_engine().await.unwrap();
    let records = list_records(Table::Customers, 10, engine.local_store().as_ref())
        .await
        .unwrap();
    drop(engine);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fields.get("name"), Some(&json!("Ada")));
    assert_eq!(records[0].sync_status, SyncStatus::Synced);
    let remote_id = records[0].remote_id.clone().unwrap();

    // edits made on the till reach the laptop
    run_edit(Table::Customers, &remote_id, Some(r#"{ "phone": "2" }"#), &till)
        .await
        .unwrap();
    run_sync(&till).await.unwrap();
    run_sync(&laptop).await.unwrap();

    let engine = laptop.open_engine().await.unwrap();
    let laptop_copy = resolve_record(Table::Customers, &remote_id, engine.local_store().as_ref())
        .await
        .unwrap();
    drop(engine);
    assert_eq!(laptop_copy.fields.get("phone"), Some(&json!("2")));

    tokio::time::sleep(Duration::from_millis(5)).await;
    run_rm(Table::Customers, &remote_id, &laptop).await.unwrap();
    run_sync(&laptop).await.unwrap();
    run_sync(&till).await.unwrap();

    let engine = till.open_engine().await.unwrap();
    let remaining = list_records(Table::Customers, 10, engine.local_store().as_ref())
        .await
        .unwrap();
    assert!(remaining.is_empty());
}
