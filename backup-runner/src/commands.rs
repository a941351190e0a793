//! Command handlers. Each returns the JSON document `main` prints.

use backup_engine::archive::list_archives;
use backup_engine::cron;
use backup_engine::envelope::{self, KeySource};
use backup_engine::forecast::ForecastSettings;
use backup_engine::keys::{self, ENCRYPTION_PASSPHRASE};
use backup_engine::schedule::Schedule;
use backup_engine::store::{ScheduleStore, SettingsRepository};
use backup_engine::task::{RestoreRequest, Task};
use backup_engine::EngineError;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cli::{parse_components, Command, CronCommand, PassphraseCommand, ScheduleCommand};
use crate::error::{CliError, CliResult};
use crate::services::task_runner::drive_task;
use crate::state::AppState;

fn to_json<T: Serialize>(value: &T) -> CliResult<Value> {
    serde_json::to_value(value).map_err(|e| CliError::Internal(e.into()))
}

fn join_error(err: tokio::task::JoinError) -> CliError {
    CliError::Internal(err.into())
}

/// Every command except `run`. Blocking; call from a blocking thread.
pub fn execute(command: Command, state: &AppState) -> CliResult<Value> {
    let orchestrator = &state.orchestrator;
    let owner = state.owner();

    match command {
        // `tick` and `advance --all` serve the whole installation; they are
        // what system cron invokes.
        Command::Tick => to_json(&orchestrator.tick(None)?),

        Command::Advance { task_id: Some(task_id), .. } => to_json(&orchestrator.advance(&task_id)?),

        Command::Advance { task_id: None, .. } => advance_all(state),

        Command::Run { .. } => Err(CliError::BadRequest("run is handled asynchronously".into())),

        Command::Status { task_id } => to_json(&orchestrator.owned_task(&task_id, owner)?.status()),

        Command::Tasks { limit } => {
            let tasks = orchestrator.list_tasks(Some(owner), limit)?;
            Ok(Value::Array(tasks.iter().map(task_summary).collect()))
        }

        Command::Cancel { task_id } => {
            orchestrator.owned_task(&task_id, owner)?;
            let accepted = orchestrator.request_cancel(&task_id)?;
            Ok(json!({ "task_id": task_id, "cancel_requested": accepted }))
        }

        Command::Schedule(command) => schedule_command(command, state),

        Command::Cron(CronCommand::Preview { expression, count, after }) => {
            let after = after.unwrap_or_else(Utc::now);
            match cron::preview(&expression, after, count, state.engine.reference_offset()) {
                Ok(occurrences) => Ok(json!({ "valid": true, "occurrences": occurrences })),
                Err(e) => Ok(json!({ "valid": false, "error": e })),
            }
        }

        Command::Forecast { days } => {
            let mut settings = ForecastSettings::from_config(&state.engine.forecast, state.engine.reference_offset());
            if let Some(days) = days {
                settings.horizon = Duration::days(i64::from(days.max(1)));
            }
            to_json(&orchestrator.forecast(Some(owner), settings)?)
        }

        Command::Event { name, detail } => to_json(&orchestrator.handle_event(&name, detail)?),

        Command::Archives => {
            let key = keys::archive_key(state.store())?;
            let listings = list_archives(&state.engine.archive_dir, Some(&key)).map_err(EngineError::from)?;
            to_json(&listings)
        }

        Command::Restore { archive, components, target } => {
            let task_id = orchestrator.restore(RestoreRequest {
                owner: owner.to_string(),
                archive,
                components: parse_components(&components)?,
                target_root: target,
            })?;
            Ok(json!({ "task_id": task_id }))
        }

        Command::Encrypt { input, output, passphrase_env } => {
            let key = envelope_key(state, passphrase_env.as_deref())?;
            let bytes = envelope::encrypt_file(&input, &output, &key).map_err(EngineError::from)?;
            Ok(json!({ "output": output, "bytes": bytes }))
        }

        Command::Decrypt { input, output, passphrase_env } => {
            let key = envelope_key(state, passphrase_env.as_deref())?;
            let bytes = envelope::decrypt_file(&input, &output, &key).map_err(EngineError::from)?;
            Ok(json!({ "output": output, "bytes": bytes }))
        }

        Command::Passphrase(PassphraseCommand::Set { from_env }) => {
            let passphrase = read_env_secret(&from_env)?;
            state.store().set_setting(ENCRYPTION_PASSPHRASE, &passphrase)?;
            tracing::info!("Archive passphrase updated");
            Ok(json!({ "passphrase": "set" }))
        }

        Command::Passphrase(PassphraseCommand::Clear) => {
            state.store().set_setting(ENCRYPTION_PASSPHRASE, "")?;
            // Make sure there is something to fall back to.
            keys::installation_key(state.store())?;
            tracing::info!("Archive passphrase cleared, using installation key");
            Ok(json!({ "passphrase": "cleared" }))
        }
    }
}

fn schedule_command(command: ScheduleCommand, state: &AppState) -> CliResult<Value> {
    let orchestrator = &state.orchestrator;
    let owner = state.owner();

    match command {
        ScheduleCommand::Add(args) => {
            let schedule = orchestrator.create_schedule(args.into_new_schedule(owner)?)?;
            schedule_view(&schedule, state)
        }
        ScheduleCommand::Edit { id, version, args } => {
            let schedule = orchestrator.update_schedule(&id, args.into_new_schedule(owner)?, version)?;
            schedule_view(&schedule, state)
        }
        ScheduleCommand::List => {
            let schedules = state.store().list_schedules(Some(owner))?;
            schedules
                .iter()
                .map(|s| schedule_view(s, state))
                .collect::<CliResult<Vec<_>>>()
                .map(Value::Array)
        }
        ScheduleCommand::Enable { id } => {
            schedule_view(&orchestrator.set_schedule_enabled(&id, owner, true)?, state)
        }
        ScheduleCommand::Disable { id } => {
            schedule_view(&orchestrator.set_schedule_enabled(&id, owner, false)?, state)
        }
        ScheduleCommand::Delete { id } => {
            orchestrator.delete_schedule(&id, owner)?;
            Ok(json!({ "deleted": id }))
        }
    }
}

/// The schedule plus its next occurrence, for listing screens.
fn schedule_view(schedule: &Schedule, state: &AppState) -> CliResult<Value> {
    let next_run = match schedule.next_occurrence(Utc::now(), state.engine.reference_offset()) {
        Ok(next) => json!(next),
        Err(e) => json!({ "unsatisfiable": e.to_string() }),
    };
    let mut view = to_json(schedule)?;
    if let Value::Object(fields) = &mut view {
        fields.insert("next_run".into(), next_run);
    }
    Ok(view)
}

fn task_summary(task: &Task) -> Value {
    json!({
        "task_id": task.id,
        "kind": task.kind,
        "schedule_id": task.schedule_id,
        "state": task.state.as_str(),
        "progress": task.status().progress,
        "status_text": task.status_text,
        "trigger": task.trigger,
        "started_at": task.started_at,
        "updated_at": task.updated_at,
    })
}

fn advance_all(state: &AppState) -> CliResult<Value> {
    let active = state.orchestrator.list_active_tasks()?;

    let mut results = Vec::with_capacity(active.len());
    for task in active {
        match state.orchestrator.advance(&task.id) {
            Ok(status) => results.push(to_json(&status)?),
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Advance failed");
                results.push(json!({ "task_id": task.id, "error": e.to_string() }));
            }
        }
    }
    Ok(Value::Array(results))
}

fn envelope_key(state: &AppState, passphrase_env: Option<&str>) -> CliResult<KeySource> {
    match passphrase_env {
        Some(var) => Ok(KeySource::Password(read_env_secret(var)?)),
        None => Ok(keys::archive_key(state.store())?),
    }
}

fn read_env_secret(var: &str) -> CliResult<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(CliError::BadRequest(format!("environment variable {var} is not set"))),
    }
}

/// Start or resume a task and drive it in the foreground. Each status is
/// printed as one JSON line; `shutdown` turns into a cancel request.
pub async fn run(
    state: Arc<AppState>,
    schedule: Option<String>,
    task: Option<String>,
    interval_ms: Option<u64>,
    shutdown: CancellationToken,
) -> CliResult<Value> {
    let task_id = match (task, schedule) {
        (Some(task_id), _) => {
            let orchestrator = state.orchestrator.clone();
            let owner = state.owner().to_string();
            tokio::task::spawn_blocking(move || orchestrator.owned_task(&task_id, &owner).map(|t| t.id))
                .await
                .map_err(join_error)??
        }
        (None, Some(schedule_id)) => {
            let orchestrator = state.orchestrator.clone();
            let owner = state.owner().to_string();
            tokio::task::spawn_blocking(move || orchestrator.run_now(&schedule_id, &owner))
                .await
                .map_err(join_error)??
        }
        (None, None) => return Err(CliError::BadRequest("either --schedule or --task is required".into())),
    };

    let interval = std::time::Duration::from_millis(interval_ms.unwrap_or(state.config.poll_interval_ms));
    tracing::info!(task_id = %task_id, "Driving task");

    let status = drive_task(state.orchestrator.clone(), task_id, interval, shutdown, |status| {
        if let Ok(line) = serde_json::to_string(status) {
            println!("{line}");
        }
    })
    .await?;

    to_json(&status)
}
