//! Entity records and the document boundary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::Table;
use crate::util::{format_timestamp, parse_timestamp};

/// A loosely typed document as stored by either store adapter.
pub type Document = Map<String, Value>;

pub const FIELD_ID: &str = "id";
pub const FIELD_REMOTE_ID: &str = "remote_id";
pub const FIELD_OWNER_ID: &str = "owner_id";
pub const FIELD_SYNC_STATUS: &str = "sync_status";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const FIELD_SCHEMA_VERSION: &str = "schema_version";

/// Highest record layout this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Bookkeeping fields that belong to the local copy only.
pub const LOCAL_ONLY_FIELDS: [&str; 4] = [
    FIELD_ID,
    FIELD_REMOTE_ID,
    FIELD_SYNC_STATUS,
    FIELD_SCHEMA_VERSION,
];

/// Sync state of a local entity record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "error" => Ok(Self::Error),
            other => Err(Error::InvalidInput(format!("unknown sync status `{other}`"))),
        }
    }
}

/// Typed view of a domain record (product, sale, stock line, ...).
///
/// `local_id` is stable for the record's lifetime; `remote_id` is attached once the
/// remote store has acknowledged the record.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub local_id: String,
    pub remote_id: Option<String>,
    pub owner_id: Option<String>,
    pub sync_status: SyncStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub schema_version: u32,
    /// Domain fields, bookkeeping excluded
    pub fields: Document,
}

impl EntityRecord {
    /// Domain field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|value| !value.is_null())
    }

    /// Value of the table's guarded quantity, when the table has one.
    pub fn quantity(&self, table: Table) -> Option<f64> {
        table
            .quantity_field()
            .and_then(|field| self.field(field))
            .and_then(Value::as_f64)
    }

    /// Fingerprint values for duplicate detection; `None` if any part is missing.
    pub fn fingerprint(&self, table: Table) -> Option<Vec<&Value>> {
        let fields = table.fingerprint_fields();
        if fields.is_empty() {
            return None;
        }
        fields.iter().map(|name| self.field(name)).collect()
    }

    /// Whether the record is linked to `remote_id`, directly or because its own id is that remote id.
    pub fn matches_remote(&self, remote_id: &str) -> bool {
        self.remote_id.as_deref() == Some(remote_id) || self.local_id == remote_id
    }

    /// Serialize back into a storable document.
    pub fn into_document(self) -> Document {
        let mut document = self.fields;
        document.insert(FIELD_ID.to_string(), Value::String(self.local_id));
        document.insert(
            FIELD_REMOTE_ID.to_string(),
            self.remote_id.map_or(Value::Null, Value::String),
        );
        if let Some(owner_id) = self.owner_id {
            document.insert(FIELD_OWNER_ID.to_string(), Value::String(owner_id));
        }
        document.insert(
            FIELD_SYNC_STATUS.to_string(),
            Value::String(self.sync_status.as_str().to_string()),
        );
        if let Some(created_at) = self.created_at {
            document.insert(
                FIELD_CREATED_AT.to_string(),
                Value::String(format_timestamp(created_at)),
            );
        }
        if let Some(updated_at) = self.updated_at {
            document.insert(
                FIELD_UPDATED_AT.to_string(),
                Value::String(format_timestamp(updated_at)),
            );
        }
        document.insert(
            FIELD_SCHEMA_VERSION.to_string(),
            Value::from(self.schema_version),
        );
        document
    }
}

impl TryFrom<Document> for EntityRecord {
    type Error = Error;

    fn try_from(mut document: Document) -> Result<Self> {
        let schema_version = match document.remove(FIELD_SCHEMA_VERSION) {
            None | Some(Value::Null) => CURRENT_SCHEMA_VERSION,
            Some(value) => value
                .as_u64()
                .and_then(|version| u32::try_from(version).ok())
                .ok_or_else(|| Error::InvalidInput("schema_version must be an integer".into()))?,
        };
        if schema_version > CURRENT_SCHEMA_VERSION {
            return Err(Error::SchemaVersion {
                found: schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }

        let local_id = take_string(&mut document, FIELD_ID)
            .ok_or_else(|| Error::InvalidInput("record is missing its id".into()))?;
        let remote_id = take_string(&mut document, FIELD_REMOTE_ID);
        let owner_id = take_string(&mut document, FIELD_OWNER_ID);
        let sync_status = take_string(&mut document, FIELD_SYNC_STATUS)
            .map(|status| status.parse())
            .transpose()?
            .unwrap_or_default();
        let created_at = document
            .remove(FIELD_CREATED_AT)
            .as_ref()
            .and_then(parse_timestamp);
        let updated_at = document
            .remove(FIELD_UPDATED_AT)
            .as_ref()
            .and_then(parse_timestamp);

        Ok(Self {
            local_id,
            remote_id,
            owner_id,
            sync_status,
            created_at,
            updated_at,
            schema_version,
            fields: document,
        })
    }
}

fn take_string(document: &mut Document, key: &str) -> Option<String> {
    match document.remove(key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Copy of `document` without local bookkeeping, as sent to the remote store.
pub fn outbound_fields(document: &Document) -> Document {
    document
        .iter()
        .filter(|(key, _)| !LOCAL_ONLY_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Read a string field from a raw document.
pub fn document_str<'a>(document: &'a Document, key: &str) -> Option<&'a str> {
    document
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
}
