use stockroom_core::sync::SyncEvent;
use tokio::sync::broadcast::error::RecvError;

use crate::commands::common::{short_id, Session};
use crate::error::CliError;

pub async fn run_watch(session: &Session) -> Result<(), CliError> {
    let user = session.require_user()?;
    let engine = session.open_engine().await?;
    let mut events = engine.events();

    engine.start(user).await?;
    println!(
        "Watching as {user} ({} listeners). Press Ctrl-C to stop.",
        engine.active_listener_count()
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", describe_event(&event)),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.stop();
    engine.destroy();
    Ok(())
}

pub fn describe_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::CycleStarted => "sync started".to_string(),
        SyncEvent::CycleFinished {
            pulled,
            pushed,
            retried,
            failed,
        } => format!("sync finished: pulled {pulled}, pushed {pushed}, retrying {retried}, failed {failed}"),
        SyncEvent::CycleFailed { message } => format!("sync failed: {message}"),
        SyncEvent::OperationSynced {
            table, record_id, ..
        } => format!("pushed {table}/{}", short_id(record_id)),
        SyncEvent::OperationFailed {
            table,
            record_id,
            retry_count,
            message,
            dead_lettered,
        } => {
            let outcome = if *dead_lettered { "gave up on" } else { "will retry" };
            format!(
                "{outcome} {table}/{} after {retry_count} attempt(s): {message}",
                short_id(record_id)
            )
        }
        SyncEvent::TableChanged { table, changes } => {
            format!("{changes} {table} record(s) changed remotely")
        }
        SyncEvent::ListenerStopped { table, message } => {
            format!("stopped listening to {table}: {message}")
        }
        SyncEvent::ConnectivityChanged { online } => {
            if *online {
                "back online".to_string()
            } else {
                "offline".to_string()
            }
        }
    }
}
