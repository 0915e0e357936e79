//! Database connection management

use crate::error::{Error, Result};
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::path::Path;

use super::migrations;

/// Where a document database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// Local `SQLite` file, created if missing
    File(String),
    /// Private in-memory database (tests)
    Memory,
    /// Hosted libSQL server (e.g., `libsql://your-db.turso.io`)
    Remote { url: String, auth_token: String },
}

impl DatabaseLocation {
    /// Interpret a CLI/config value: `libsql://`, `http(s)://` and `wss://` URLs are
    /// hosted databases, `:memory:` is in-memory and anything else is a file path.
    pub fn parse(value: &str, auth_token: Option<String>) -> Result<Self> {
        let value = value.trim();
        if value == ":memory:" {
            return Ok(Self::Memory);
        }
        let hosted = ["libsql://", "http://", "https://", "wss://"]
            .iter()
            .any(|scheme| value.starts_with(scheme));
        if hosted {
            let auth_token = auth_token
                .filter(|token| !token.trim().is_empty())
                .ok_or_else(|| Error::InvalidInput("Auth token is required".into()))?;
            return Ok(Self::Remote {
                url: value.to_string(),
                auth_token,
            });
        }
        if value.is_empty() {
            return Err(Error::InvalidInput("Database path is required".into()));
        }
        Ok(Self::File(value.to_string()))
    }
}

/// Database wrapper for libSQL connections
pub struct Database {
    // Keeps the handle alive for as long as the connection is used
    _db: LibSqlDatabase,
    conn: Connection,
    hosted: bool,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        Self::from_handle(db, false).await
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::from_handle(db, false).await
    }

    /// Open a hosted libSQL database over the network
    pub async fn open_remote(url: impl Into<String>, auth_token: impl Into<String>) -> Result<Self> {
        let db = Builder::new_remote(url.into(), auth_token.into())
            .build()
            .await?;
        Self::from_handle(db, true).await
    }

    /// Open whatever `location` points at
    pub async fn open_location(location: &DatabaseLocation) -> Result<Self> {
        match location {
            DatabaseLocation::File(path) => {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Self::open(path).await
            }
            DatabaseLocation::Memory => Self::open_in_memory().await,
            DatabaseLocation::Remote { url, auth_token } => {
                Self::open_remote(url.clone(), auth_token.clone()).await
            }
        }
    }

    async fn from_handle(db: LibSqlDatabase, hosted: bool) -> Result<Self> {
        let conn = db.connect()?;
        let database = Self {
            _db: db,
            conn,
            hosted,
        };
        if !hosted {
            database.configure().await?;
        }
        database.migrate().await?;
        Ok(database)
    }

    /// Configure `SQLite` for optimal performance
    async fn configure(&self) -> Result<()> {
        // Not every pragma is honoured for in-memory databases
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA busy_timeout = 5000;", ())
            .await
            .ok();
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    /// Whether this database lives on a libSQL server
    pub const fn is_hosted(&self) -> bool {
        self.hosted
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}
