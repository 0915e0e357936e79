//! Error types for stockroom-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using stockroom-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in stockroom-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored document was written by a newer schema than this build understands
    #[error("Unsupported schema version {found} (supported up to {supported})")]
    SchemaVersion { found: u32, supported: u32 },

    /// Remote store failure
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Identity collaborator failure
    #[error("Identity error: {0}")]
    Identity(String),
}

impl Error {
    /// Whether retrying the same call later could succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Remote(remote) => remote.is_transient(),
            _ => false,
        }
    }
}
