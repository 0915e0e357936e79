use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use stockroom_core::db::{Database, DatabaseLocation, LibSqlLocalStore, LocalStore};
use stockroom_core::models::{Document, EntityRecord, Operation};
use stockroom_core::remote::LibSqlRemoteStore;
use stockroom_core::{
    CurrentUser, StaticIdentity, SyncContext, SyncEngine, SyncSettings, SyncStatusReport, Table,
};
use tokio::sync::Mutex;

use crate::error::CliError;

pub const ENV_DB_PATH: &str = "STOCKROOM_DB_PATH";
pub const ENV_REMOTE_PATH: &str = "STOCKROOM_REMOTE_PATH";
pub const ENV_REMOTE_AUTH_TOKEN: &str = "STOCKROOM_REMOTE_AUTH_TOKEN";
pub const ENV_USER: &str = "STOCKROOM_USER";

const SHORT_ID_LEN: usize = 12;

/// Where this invocation keeps its data and who it acts as.
#[derive(Debug, Clone)]
pub struct Session {
    pub db_path: PathBuf,
    pub remote: String,
    pub config: Option<PathBuf>,
    pub user: Option<String>,
}

impl Session {
    pub fn resolve(
        db_path: Option<PathBuf>,
        remote_path: Option<String>,
        config: Option<PathBuf>,
        user: Option<String>,
    ) -> Self {
        Self {
            db_path: resolve_db_path(db_path),
            remote: resolve_remote_path(remote_path),
            config,
            user: user
                .or_else(|| env::var(ENV_USER).ok())
                .map(|user| user.trim().to_string())
                .filter(|user| !user.is_empty()),
        }
    }

    pub fn require_user(&self) -> Result<&str, CliError> {
        self.user.as_deref().ok_or(CliError::MissingUser)
    }

    /// Open both stores and an initialized engine over them.
    pub async fn open_engine(&self) -> Result<SyncEngine, CliError> {
        let settings = SyncSettings::load(self.config.as_deref())?;

        let local_db = open_database(&self.db_path).await?;
        let local = LibSqlLocalStore::new(Arc::new(Mutex::new(local_db)), settings.cache_ttl);

        let location =
            DatabaseLocation::parse(&self.remote, env::var(ENV_REMOTE_AUTH_TOKEN).ok())?;
        if let DatabaseLocation::File(path) = &location {
            create_parent_dir(Path::new(path))?;
        }
        let remote_db = Database::open_location(&location).await?;
        let remote = LibSqlRemoteStore::new(Arc::new(Mutex::new(remote_db)));

        let identity = StaticIdentity::new(self.user.clone().map(CurrentUser::owner));
        let engine = SyncEngine::new(SyncContext {
            local: Arc::new(local),
            remote: Arc::new(remote),
            identity: Arc::new(identity),
            settings,
        })?;
        engine.init().await?;
        Ok(engine)
    }
}

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub remote_id: Option<String>,
    pub sync_status: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub relative_time: String,
    pub fields: Document,
}

pub fn record_to_list_item(record: &EntityRecord) -> RecordListItem {
    RecordListItem {
        id: record.local_id.clone(),
        remote_id: record.remote_id.clone(),
        sync_status: record.sync_status.as_str().to_string(),
        updated_at: record.updated_at,
        relative_time: record
            .updated_at
            .map(|at| format_relative_time(at, Utc::now()))
            .unwrap_or_default(),
        fields: record.fields.clone(),
    }
}

/// Local records of `table`, most recently updated first.
pub async fn list_records(
    table: Table,
    limit: usize,
    store: &dyn LocalStore,
) -> Result<Vec<EntityRecord>, CliError> {
    let mut records = store
        .get_all(table.as_str())
        .await?
        .into_iter()
        .map(EntityRecord::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    records.truncate(limit);
    Ok(records)
}

/// Find a record by local id, remote id, or a unique prefix of either.
pub async fn resolve_record(
    table: Table,
    query: &str,
    store: &dyn LocalStore,
) -> Result<EntityRecord, CliError> {
    if let Some(document) = store.get_by_id(table.as_str(), query).await? {
        return Ok(EntityRecord::try_from(document)?);
    }

    let mut matches = Vec::new();
    for document in store.get_all(table.as_str()).await? {
        let record = EntityRecord::try_from(document)?;
        if record.remote_id.as_deref() == Some(query) {
            return Ok(record);
        }
        let prefix_match = record.local_id.starts_with(query)
            || record
                .remote_id
                .as_deref()
                .is_some_and(|remote_id| remote_id.starts_with(query));
        if prefix_match {
            matches.push(record);
        }
    }

    match matches.len() {
        0 => Err(CliError::RecordNotFound(query.to_string())),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|record| short_id(&record.local_id))
                .collect::<Vec<_>>()
                .join(", ");

            Err(CliError::AmbiguousRecordId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn format_record_lines(records: &[EntityRecord]) -> Vec<String> {
    let now = Utc::now();
    records
        .iter()
        .map(|record| {
            let preview = record_preview(record, 48);
            let line = format!(
                "{:<12}  {:<7}  {preview}",
                short_id(&record.local_id),
                record.sync_status.as_str()
            );
            match record.updated_at {
                Some(updated_at) => format!("{line}  ({})", format_relative_time(updated_at, now)),
                None => line,
            }
        })
        .collect()
}

pub fn format_operation_lines(operations: &[Operation]) -> Vec<String> {
    operations
        .iter()
        .map(|operation| {
            let line = format!(
                "{:<12}  {:<6}  {}/{}  {:<7}  p{}  retries={}",
                short_id(&operation.id),
                operation.kind.as_str(),
                operation.table,
                short_id(&operation.record_id),
                operation.status.as_str(),
                operation.priority.get(),
                operation.retry_count
            );
            match operation.error_message.as_deref() {
                Some(message) => format!("{line}  {message}"),
                None => line,
            }
        })
        .collect()
}

pub fn format_status_lines(status: &SyncStatusReport) -> Vec<String> {
    let last_sync = status
        .last_sync
        .map_or_else(|| "never".to_string(), format_sync_timestamp);
    let mut lines = vec![
        format!("online:       {}", status.is_online),
        format!("syncing:      {}", status.sync_in_progress),
        format!("last sync:    {last_sync}"),
        format!("pending:      {}", status.pending_operations),
        format!("failed:       {}", status.failed_operations),
        format!(
            "listeners:    {}/{}",
            status.active_listeners,
            Table::ALL.len()
        ),
    ];
    lines.extend(status.errors.iter().map(|error| format!("error:        {error}")));
    lines
}

/// Single-line rendering of a record's domain fields.
pub fn record_preview(record: &EntityRecord, max_chars: usize) -> String {
    let collapsed = record
        .fields
        .iter()
        .filter(|(key, _)| key.as_str() != "owner_id")
        .map(|(key, value)| match value {
            Value::String(text) => format!("{key}={text}"),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

pub fn format_sync_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn format_relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = (now - timestamp).num_milliseconds().max(0);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

/// Record fields from `--json`, falling back to piped stdin.
pub fn resolve_record_fields(json: Option<&str>) -> Result<Document, CliError> {
    let payload = match json.and_then(normalize_payload) {
        Some(payload) => payload,
        None => read_piped_stdin()?.ok_or(CliError::EmptyFields)?,
    };
    parse_fields(&payload)
}

pub fn parse_fields(payload: &str) -> Result<Document, CliError> {
    match serde_json::from_str::<Value>(payload)? {
        Value::Object(fields) if fields.is_empty() => Err(CliError::EmptyFields),
        Value::Object(fields) => Ok(fields),
        _ => Err(CliError::NotAnObject),
    }
}

pub fn normalize_payload(payload: &str) -> Option<String> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_record_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyRecordId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_payload(&buffer))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(ENV_DB_PATH).map(PathBuf::from))
        .unwrap_or_else(|| default_data_dir().join("local.db"))
}

pub fn resolve_remote_path(cli_remote_path: Option<String>) -> String {
    cli_remote_path
        .or_else(|| env::var(ENV_REMOTE_PATH).ok())
        .unwrap_or_else(|| {
            default_data_dir()
                .join("remote.db")
                .to_string_lossy()
                .into_owned()
        })
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stockroom")
}

fn create_parent_dir(path: &Path) -> Result<(), CliError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub async fn open_database(path: &Path) -> Result<Database, CliError> {
    create_parent_dir(path)?;
    Ok(Database::open(path).await?)
}
