#![warn(clippy::pedantic)]
mod audit;
mod error;
mod history;
mod reader;
mod routes;
mod state;

use crate::audit::AuditLog;
use crate::error::{MainError, StorageError};
use crate::history::HistoryLog;
use crate::reader::{StreamReader, supervise};
use crate::state::AppState;
use chrono::Local;
use shared::error::InitializationError;
use shared::telemetry::TelemetryCache;
use shared::{ServerConfig, init_tracing, load_config, shutdown_listener};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), MainError> {
    init_tracing()?;

    let config = load_config().map_err(InitializationError::from)?;
    info!(name: "config.loaded", config = ?config, "config loaded");

    let audit = AuditLog::open(&config.audit, Local::now()).map_err(StorageError::Audit)?;
    info!(name: "audit.opened", path = %audit.path().display(), "appending raw gpsd messages to audit log");
    let history = HistoryLog::open(&config.history).map_err(StorageError::from)?;
    info!(name: "history.opened", path = %history.path().display(), "appending summary rows to history log");

    let telemetry = TelemetryCache::new();
    let reader = StreamReader::new(telemetry.clone(), Arc::new(audit), Arc::new(history));
    let state = AppState::new(&config, telemetry);

    // Cancellation token shared across tasks; listener cancels on SIGINT/SIGTERM.
    let shutdown_token = CancellationToken::new();
    let mut signal_handle = tokio::spawn(shutdown_listener(Some(shutdown_token.clone())));

    let mut axum_handle = tokio::spawn(run_server(
        config.server.clone(),
        state,
        shutdown_token.clone(),
    ));

    let mut supervisor_handle = tokio::spawn(supervise(
        config.gpsd.clone(),
        reader,
        shutdown_token.clone(),
    ));

    let mut first_err: Option<MainError> = None;
    let mut axum_done = false;
    let mut supervisor_done = false;

    tokio::select! {
        res = &mut axum_handle => {
            info!(name: "axum.completed", "axum task completed first, propagating cancellation token to other tasks");
            axum_done = true;
            shutdown_token.cancel();
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(name: "axum.completed", error = ?e, "axum task completed due to error");
                    first_err.get_or_insert(e.into());
                }
                Err(join) => {
                    warn!(name: "axum.completed", error = ?join, "axum task completed due to error");
                    first_err.get_or_insert(join.into());
                }
            }
        }
        res = &mut supervisor_handle => {
            info!(name: "supervisor.completed", "supervisor task completed first, propagating cancellation token to other tasks");
            supervisor_done = true;
            shutdown_token.cancel();
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(name: "supervisor.completed", error = ?e, "supervisor task completed due to error");
                    first_err.get_or_insert(e.into());
                }
                Err(join) => {
                    warn!(name: "supervisor.completed", error = ?join, "supervisor task completed due to error");
                    first_err.get_or_insert(join.into());
                }
            }
        }
        res = &mut signal_handle => {
            info!(name: "listener.completed", "SIGINT/SIGTERM listener task completed first, propagating cancellation token to other tasks");
            shutdown_token.cancel();
            if let Err(join) = res {
                warn!(name: "listener.completed", error = ?join, "error with SIGINT/SIGTERM listener task");
                first_err.get_or_insert(join.into());
            }
        }
    }

    if !axum_done {
        info!(name: "axum.completion.awaiting", "awaiting completion of axum task");
        match axum_handle.await {
            Ok(Ok(())) => info!(name: "axum.completed", "axum task completed successfully"),
            Ok(Err(e)) => {
                info!(name: "axum.completed", error = ?e, "axum task completed with error");
                first_err.get_or_insert(e.into());
            }
            Err(join) => {
                info!(name: "axum.completed", error = ?join, "axum task completed with error");
                first_err.get_or_insert(join.into());
            }
        }
    }
    if !supervisor_done {
        info!(name: "supervisor.completion.awaiting", "awaiting completion of supervisor task");
        match supervisor_handle.await {
            Ok(Ok(())) => info!(name: "supervisor.completed", "supervisor task completed successfully"),
            Ok(Err(e)) => {
                info!(name: "supervisor.completed", error = ?e, "supervisor task completed with error");
                first_err.get_or_insert(e.into());
            }
            Err(join) => {
                info!(name: "supervisor.completed", error = ?join, "supervisor task completed with error");
                first_err.get_or_insert(join.into());
            }
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn run_server(
    config: ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = routes::router(state);
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(name: "axum.initialized", listen_addr = %config.listen_addr, "starting http server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
