use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use stockroom_core::Table;

#[derive(Parser)]
#[command(name = "stockroom")]
#[command(about = "Inventory records that keep working offline and sync when connected")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Shared remote store: a database file or a libsql:// URL
    #[arg(long, global = true, value_name = "PATH_OR_URL")]
    pub remote_path: Option<String>,

    /// JSON file with sync settings
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Signed-in user id (defaults to STOCKROOM_USER)
    #[arg(long, global = true, value_name = "UID")]
    pub user: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a record locally and queue it for upload
    #[command(alias = "new")]
    Add {
        /// Target table
        #[arg(value_parser = parse_table)]
        table: Table,
        /// Record fields as a JSON object (read from stdin when omitted)
        #[arg(long, value_name = "JSON")]
        json: Option<String>,
    },
    /// Change fields of an existing record
    Edit {
        #[arg(value_parser = parse_table)]
        table: Table,
        /// Record ID, remote ID, or unique ID prefix
        id: String,
        /// Fields to change as a JSON object (read from stdin when omitted)
        #[arg(long, value_name = "JSON")]
        json: Option<String>,
    },
    /// Delete a record
    #[command(alias = "delete")]
    Rm {
        #[arg(value_parser = parse_table)]
        table: Table,
        /// Record ID, remote ID, or unique ID prefix
        id: String,
    },
    /// List local records of a table
    List {
        #[arg(value_parser = parse_table)]
        table: Table,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or manage queued operations
    Queue {
        #[command(subcommand)]
        command: Option<QueueCommands>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one pull-then-push cycle
    Sync,
    /// Show sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Listen for remote changes and sync periodically until interrupted
    Watch,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Give dead-lettered operations a fresh retry budget
    Retry,
    /// Drop pending creates of a table before re-adding its records
    Purge {
        #[arg(value_parser = parse_table)]
        table: Table,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    #[value(name = "powershell")]
    PowerShell,
    Elvish,
}

pub fn parse_table(value: &str) -> Result<Table, String> {
    value.parse::<Table>().map_err(|_| {
        let known = Table::ALL.map(Table::as_str).join(", ");
        format!("unknown table `{}` (expected one of: {known})", value.trim())
    })
}
