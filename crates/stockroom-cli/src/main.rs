//! Stockroom CLI - inventory records from the terminal
//!
//! Writes land in a local database first and are synced with the shared remote
//! store by `stockroom sync` or continuously by `stockroom watch`.

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands, QueueCommands};
use crate::commands::add::run_add;
use crate::commands::common::Session;
use crate::commands::completions::run_completions;
use crate::commands::edit::run_edit;
use crate::commands::list::run_list;
use crate::commands::queue::{run_queue, run_queue_purge, run_queue_retry};
use crate::commands::rm::run_rm;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::commands::watch::run_watch;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "stockroom=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let session = Session::resolve(cli.db_path, cli.remote_path, cli.config, cli.user);

    match cli.command {
        Commands::Add { table, json } => run_add(table, json.as_deref(), &session).await?,
        Commands::Edit { table, id, json } => {
            run_edit(table, &id, json.as_deref(), &session).await?;
        }
        Commands::Rm { table, id } => run_rm(table, &id, &session).await?,
        Commands::List { table, limit, json } => run_list(table, limit, json, &session).await?,
        Commands::Queue { command, json } => match command {
            None => run_queue(json, &session).await?,
            Some(QueueCommands::Retry) => run_queue_retry(&session).await?,
            Some(QueueCommands::Purge { table }) => run_queue_purge(table, &session).await?,
        },
        Commands::Sync => run_sync(&session).await?,
        Commands::Status { json } => run_status(json, &session).await?,
        Commands::Watch => run_watch(&session).await?,
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}
