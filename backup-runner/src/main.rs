//! Backup Runner - host entry point
//!
//! Short-lived CLI around the backup engine: every invocation opens the
//! SQLite store, does one unit of work and prints JSON. System cron calls
//! `tick` and `advance --all`; admins use the rest.

mod cli;
mod commands;
mod config;
mod db;
mod error;
mod models;
mod services;
mod state;
mod store;

use crate::cli::{Cli, Command};
use crate::config::RunnerConfig;
use crate::error::{CliError, CliResult};
use crate::state::AppState;
use backup_engine::utils::logger;
use clap::Parser;
use serde_json::Value;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = RunnerConfig::from_env();
    cli.global.apply(&mut config);

    if let Err(e) = logger::init(&config.log_level, config.log_json) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match dispatch(cli.command, config).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string()));
            ExitCode::SUCCESS
        }
        Err(err) => {
            err.report();
            ExitCode::from(err.exit_code())
        }
    }
}

async fn dispatch(command: Command, config: RunnerConfig) -> CliResult<Value> {
    let state = Arc::new(AppState::open(config)?);

    match command {
        Command::Run { schedule, task, interval_ms } => {
            let shutdown = CancellationToken::new();
            let listener = tokio::spawn(shutdown_signal(shutdown.clone()));
            let result = commands::run(state, schedule, task, interval_ms, shutdown).await;
            listener.abort();
            result
        }
        other => tokio::task::spawn_blocking(move || commands::execute(other, &state))
            .await
            .map_err(|e| CliError::Internal(e.into()))?,
    }
}

/// Resolves on Ctrl-C or SIGTERM and cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, cancelling task"),
        _ = terminate => tracing::info!("Received SIGTERM, cancelling task"),
    }

    shutdown.cancel();
}
