//! Queued local mutations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::{Document, Table};

/// Kind of mutation carried by an operation (and by pulled remote updates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation `{other}`"))),
        }
    }
}

/// Queue entry lifecycle: `pending -> syncing -> (removed | pending | error)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Pending,
    Syncing,
    Error,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drain priority, 1 (high) to 3 (low).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGH: Self = Self(1);
    pub const NORMAL: Self = Self(2);
    pub const LOW: Self = Self(3);

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::HIGH
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        if (1..=3).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidInput(format!(
                "priority must be between 1 and 3, got {value}"
            )))
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

/// A durable queue entry awaiting remote application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(rename = "table_name")]
    pub table: Table,
    pub record_id: String,
    #[serde(rename = "operation")]
    pub kind: OperationKind,
    #[serde(rename = "data", default)]
    pub payload: Document,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Earliest time a retried entry may be attempted again
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Build the storable form of the entry.
    pub fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(document) => Ok(document),
            _ => Err(Error::Database("operation did not serialize to an object".into())),
        }
    }

    /// Parse a stored entry.
    pub fn from_document(document: Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(document))?)
    }

    /// Whether a pending entry may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !matches!(self.next_attempt_at, Some(at) if at > now)
    }

    /// Drain order: ascending priority, then creation order.
    pub fn drain_order(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}
