use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    plan_progress, BackupOptions, FailureKind, RestoreOptions, Step, Task, TaskId, TaskKind,
    TaskOptions, TaskResult, TaskState, TaskStatus, TaskTrigger,
};
use crate::archive::manifest::MANIFEST_FORMAT_VERSION;
use crate::archive::{
    self, encrypted_path, extract_component, read_manifest, verify_archive, walk_directory,
    ArchiveBuilder, ArchiveType, Manifest, WalkOptions,
};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::content::{ContentSource, DATABASE_FILE_NAME};
use crate::envelope;
use crate::forecast::{Forecast, ForecastSettings, Forecaster};
use crate::keys;
use crate::schedule::{ComponentKind, NewSchedule, PostCheckKind, Schedule, ScheduleId};
use crate::sink::{DestinationSink, LocalDirectorySink, SinkRegistry};
use crate::store::{
    schedule_lock_key, task_lock_key, LockGuard, ScheduleStore, Store, TaskStore, TriggerStore,
};
use crate::trigger::{
    EventTriggerReconciler, IgnoreReason, TriggerConfig, TriggerDecision, TriggerState,
};
use crate::utils::pulse::Pulse;
use crate::utils::{EngineError, Result};

/// What one call to [`TaskOrchestrator::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub created: Vec<TaskId>,
    /// Due, but an earlier task for the schedule is still active.
    pub skipped_active: Vec<ScheduleId>,
    /// Due, but another invocation holds the schedule lock.
    pub skipped_locked: Vec<ScheduleId>,
    pub unsatisfiable: Vec<ScheduleId>,
    pub triggers_fired: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Ignored { reason: IgnoreReason },
    Buffered { pending: usize, fire_at: DateTime<Utc> },
    Fired { task_id: TaskId },
    /// The batch is complete but the schedule is busy; a later tick retries.
    Deferred { pending: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub owner: String,
    pub archive: PathBuf,
    pub components: BTreeSet<ComponentKind>,
    pub target_root: Option<PathBuf>,
}

enum StepOutcome {
    Done,
    /// A chunked step has more work left.
    Partial,
}

/// Drives schedules and tasks. Every public operation is a short, complete
/// unit: state lives in the store, never in the orchestrator.
pub struct TaskOrchestrator<S: Store> {
    store: Arc<S>,
    content: Arc<dyn ContentSource>,
    sinks: SinkRegistry,
    builder: ArchiveBuilder,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    files_per_step: usize,
    lock_stale_after: chrono::Duration,
    triggers: EventTriggerReconciler,
    holder: String,
}

impl<S: Store> TaskOrchestrator<S> {
    pub fn new(store: Arc<S>, content: Arc<dyn ContentSource>, config: &EngineConfig) -> Self {
        let mut sinks = SinkRegistry::new();
        for destination in &config.destinations {
            sinks.register(Arc::new(LocalDirectorySink::new(
                destination.id.clone(),
                destination.path.clone(),
            )));
        }
        Self {
            store,
            content,
            sinks,
            builder: ArchiveBuilder::new(&config.work_dir, &config.archive_dir)
                .with_compression_level(config.compression_level),
            clock: Arc::new(SystemClock),
            offset: config.reference_offset(),
            files_per_step: config.files_per_step.max(1),
            lock_stale_after: config.lock_stale_after(),
            triggers: EventTriggerReconciler::new(config.triggers.iter().cloned()),
            holder: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DestinationSink>) -> Self {
        self.sinks.register(sink);
        self
    }

    pub fn with_triggers(mut self, configs: impl IntoIterator<Item = TriggerConfig>) -> Self {
        self.triggers = EventTriggerReconciler::new(configs);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn builder(&self) -> &ArchiveBuilder {
        &self.builder
    }

    // ── Schedules ──

    pub fn create_schedule(&self, input: NewSchedule) -> Result<Schedule> {
        self.check_destinations(&input)?;
        let schedule = input.into_schedule(Uuid::new_v4().to_string(), self.clock.now())?;
        self.store.insert_schedule(&schedule)?;
        tracing::info!(schedule_id = %schedule.id, label = %schedule.label, "Schedule created");
        Ok(schedule)
    }

    /// A schedule as seen by `owner`. Schedules of other owners do not exist
    /// for them.
    pub fn owned_schedule(&self, id: &str, owner: &str) -> Result<Schedule> {
        self.store
            .get_schedule(id)?
            .filter(|s| s.owner == owner)
            .ok_or_else(|| EngineError::NotFound(format!("schedule {id}")))
    }

    /// Replace a schedule's settings. `expected_version` is the version the
    /// caller last read; `input.owner` must own the schedule.
    pub fn update_schedule(&self, id: &str, input: NewSchedule, expected_version: u64) -> Result<Schedule> {
        self.check_destinations(&input)?;
        let existing = self.owned_schedule(id, &input.owner)?;
        let mut updated = input.apply_to(&existing)?;
        updated.version = expected_version;
        let saved = self.store.update_schedule(&updated)?;
        tracing::info!(schedule_id = %id, version = saved.version, "Schedule updated");
        Ok(saved)
    }

    pub fn set_schedule_enabled(&self, id: &str, owner: &str, enabled: bool) -> Result<Schedule> {
        self.owned_schedule(id, owner)?;
        let saved = self.store.set_schedule_enabled(id, enabled)?;
        tracing::info!(schedule_id = %id, enabled, "Schedule toggled");
        Ok(saved)
    }

    /// Remove a schedule. Its past tasks are kept.
    pub fn delete_schedule(&self, id: &str, owner: &str) -> Result<()> {
        self.owned_schedule(id, owner)?;
        if !self.store.delete_schedule(id)? {
            return Err(EngineError::NotFound(format!("schedule {id}")));
        }
        tracing::info!(schedule_id = %id, "Schedule deleted");
        Ok(())
    }

    fn check_destinations(&self, input: &NewSchedule) -> Result<()> {
        match input.secondary_destinations.iter().find(|d| !self.sinks.contains(d)) {
            Some(unknown) => Err(EngineError::Validation(format!(
                "destination '{unknown}' is not configured"
            ))),
            None => Ok(()),
        }
    }

    pub fn forecast(&self, owner: Option<&str>, settings: ForecastSettings) -> Result<Forecast> {
        let schedules = self.store.list_schedules(owner)?;
        Ok(Forecaster::new(settings).forecast(&schedules, self.clock.now()))
    }

    // ── Task creation ──

    /// Create a task for every schedule with a due occurrence, then flush
    /// trigger batches whose window has elapsed.
    pub fn tick(&self, owner: Option<&str>) -> Result<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for schedule in self.store.list_schedules(owner)? {
            if !schedule.is_active() {
                continue;
            }
            let cursor = self
                .store
                .latest_scheduled_for(&schedule.id)?
                .unwrap_or(schedule.created_at);
            let due = match schedule
                .recurrence
                .latest_due(cursor, now, schedule.created_at, self.offset)
            {
                Ok(Some(due)) => due,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(schedule_id = %schedule.id, error = %e, "Schedule can never run");
                    report.unsatisfiable.push(schedule.id.clone());
                    continue;
                }
            };

            let Some(_guard) = LockGuard::acquire(
                &*self.store,
                schedule_lock_key(&schedule.id),
                &self.holder,
                now,
                self.lock_stale_after,
            )?
            else {
                tracing::debug!(schedule_id = %schedule.id, "Schedule locked elsewhere");
                report.skipped_locked.push(schedule.id.clone());
                continue;
            };

            if let Some(active) = self.store.active_task_for_schedule(&schedule.id)? {
                tracing::warn!(
                    schedule_id = %schedule.id,
                    task_id = %active.id,
                    "Skipping scheduled run: previous task still active"
                );
                report.skipped_active.push(schedule.id.clone());
                continue;
            }

            let mut task = self.new_backup_task(&schedule, TaskTrigger::Schedule, now)?;
            task.scheduled_for = Some(due);
            self.store.insert_task(&task)?;
            tracing::info!(
                schedule_id = %schedule.id,
                task_id = %task.id,
                scheduled_for = %due,
                "Scheduled backup queued"
            );
            report.created.push(task.id);
        }

        for config in self.triggers.configs() {
            let Some(mut state) = self.store.load_trigger_state(&config.event)? else {
                continue;
            };
            let Some(TriggerDecision::Fire { schedule_id, .. }) = self.triggers.poll(&state, now) else {
                continue;
            };
            match self.fire_trigger(&mut state, &schedule_id, now) {
                Ok(Some(task_id)) => {
                    self.store.save_trigger_state(&state)?;
                    report.triggers_fired.push(task_id);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(event = %config.event, error = %e, "Failed to fire trigger batch");
                }
            }
        }

        Ok(report)
    }

    /// Queue a backup of `schedule_id` immediately.
    pub fn run_now(&self, schedule_id: &str, owner: &str) -> Result<TaskId> {
        let now = self.clock.now();
        let schedule = self.owned_schedule(schedule_id, owner)?;

        let _guard = LockGuard::acquire(
            &*self.store,
            schedule_lock_key(schedule_id),
            &self.holder,
            now,
            self.lock_stale_after,
        )?
        .ok_or_else(|| EngineError::Conflict(format!("schedule {schedule_id} is busy")))?;

        if let Some(active) = self.store.active_task_for_schedule(schedule_id)? {
            return Err(EngineError::Conflict(format!(
                "schedule {schedule_id} already has active task {}",
                active.id
            )));
        }

        let task = self.new_backup_task(&schedule, TaskTrigger::Manual, now)?;
        self.store.insert_task(&task)?;
        tracing::info!(schedule_id, task_id = %task.id, "Manual backup queued");
        Ok(task.id)
    }

    pub fn restore(&self, request: RestoreRequest) -> Result<TaskId> {
        if request.owner.trim().is_empty() {
            return Err(EngineError::Validation("owner must not be empty".into()));
        }
        if !request.archive.is_file() {
            return Err(EngineError::NotFound(format!(
                "archive {}",
                request.archive.display()
            )));
        }
        let options = RestoreOptions {
            archive: request.archive,
            components: request.components,
            target_root: request.target_root,
        };
        let task = Task::new(
            Uuid::new_v4().to_string(),
            &request.owner,
            None,
            TaskOptions::Restore(options),
            TaskTrigger::Manual,
            self.clock.now(),
        );
        self.store.insert_task(&task)?;
        tracing::info!(task_id = %task.id, "Restore queued");
        Ok(task.id)
    }

    /// Feed one domain event through its trigger.
    pub fn handle_event(&self, event: &str, detail: Option<String>) -> Result<TriggerOutcome> {
        let now = self.clock.now();
        let mut state = self
            .store
            .load_trigger_state(event)?
            .unwrap_or_else(|| TriggerState::new(event));

        let outcome = match self.triggers.on_event(&mut state, detail, now) {
            TriggerDecision::Ignored(reason) => {
                tracing::debug!(event, ?reason, "Event ignored");
                return Ok(TriggerOutcome::Ignored { reason });
            }
            TriggerDecision::Buffered { pending, fire_at } => TriggerOutcome::Buffered { pending, fire_at },
            TriggerDecision::Fire { schedule_id, .. } => {
                match self.fire_trigger(&mut state, &schedule_id, now)? {
                    Some(task_id) => TriggerOutcome::Fired { task_id },
                    None => TriggerOutcome::Deferred {
                        pending: state.event_count(),
                    },
                }
            }
        };
        self.store.save_trigger_state(&state)?;
        Ok(outcome)
    }

    /// Create the task for a completed batch. `None` leaves the batch
    /// buffered because the schedule is busy.
    fn fire_trigger(&self, state: &mut TriggerState, schedule_id: &str, now: DateTime<Utc>) -> Result<Option<TaskId>> {
        let schedule = self
            .store
            .get_schedule(schedule_id)?
            .ok_or_else(|| EngineError::NotFound(format!("schedule {schedule_id}")))?;

        let Some(_guard) = LockGuard::acquire(
            &*self.store,
            schedule_lock_key(schedule_id),
            &self.holder,
            now,
            self.lock_stale_after,
        )?
        else {
            return Ok(None);
        };
        if self.store.active_task_for_schedule(schedule_id)?.is_some() {
            tracing::info!(event = %state.event, schedule_id, "Trigger batch deferred: schedule busy");
            return Ok(None);
        }

        let task = self.new_backup_task(&schedule, TaskTrigger::Event(state.event.clone()), now)?;
        self.store.insert_task(&task)?;
        tracing::info!(
            event = %state.event,
            events = state.event_count(),
            task_id = %task.id,
            "Trigger batch fired"
        );
        state.mark_fired(now);
        Ok(Some(task.id))
    }

    fn new_backup_task(&self, schedule: &Schedule, trigger: TaskTrigger, now: DateTime<Utc>) -> Result<Task> {
        let (incremental_since, base) = if schedule.incremental {
            match self.store.last_completed(&schedule.id, TaskKind::Backup)? {
                Some(previous) => (
                    Some(previous.started_at),
                    previous.result.and_then(|r| r.manifest).map(|m| m.filename),
                ),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        let options = BackupOptions {
            label: schedule.label.clone(),
            components: schedule.selected_components.clone(),
            include_patterns: schedule.include_patterns.clone(),
            exclude_patterns: schedule.exclude_patterns.clone(),
            encrypt: schedule.encrypt,
            incremental_since,
            base,
            post_checks: schedule.post_checks.clone(),
            destinations: schedule.secondary_destinations.clone(),
        };
        Ok(Task::new(
            Uuid::new_v4().to_string(),
            &schedule.owner,
            Some(schedule.id.clone()),
            TaskOptions::Backup(options),
            trigger,
            now,
        ))
    }

    // ── Task execution ──

    pub fn status(&self, task_id: &str) -> Result<TaskStatus> {
        Ok(self.load_task(task_id)?.status())
    }

    /// A task as seen by `owner`; tasks of other owners are `NotFound`.
    pub fn owned_task(&self, task_id: &str, owner: &str) -> Result<Task> {
        self.store
            .get_task(task_id)?
            .filter(|t| t.owner == owner)
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))
    }

    pub fn list_tasks(&self, owner: Option<&str>, limit: usize) -> Result<Vec<Task>> {
        self.store.list_tasks(owner, limit)
    }

    pub fn list_active_tasks(&self) -> Result<Vec<Task>> {
        self.store.list_active_tasks()
    }

    /// Ask a task to stop at its next step boundary. Returns `false` when
    /// the task already finished.
    pub fn request_cancel(&self, task_id: &str) -> Result<bool> {
        let task = self.load_task(task_id)?;
        if task.state.is_terminal() {
            return Ok(false);
        }
        let marked = self.store.mark_cancel_requested(task_id)?;
        tracing::info!(task_id, "Cancellation requested");
        Ok(marked)
    }

    /// Run exactly one step of a task.
    pub fn advance(&self, task_id: &str) -> Result<TaskStatus> {
        let now = self.clock.now();
        let task = self.load_task(task_id)?;
        if task.state.is_terminal() {
            return Ok(task.status());
        }

        let Some(guard) = LockGuard::acquire(
            &*self.store,
            task_lock_key(task_id),
            &self.holder,
            now,
            self.lock_stale_after,
        )?
        else {
            tracing::debug!(task_id, "Task is being advanced elsewhere");
            return Ok(task.status());
        };

        // Reload under the lock; another invocation may have moved it on.
        let mut task = self.load_task(task_id)?;
        if task.state.is_terminal() {
            return Ok(task.status());
        }
        task.updated_at = now;

        if task.cancel_requested {
            self.abandon(&mut task);
            task.state = TaskState::Failed(FailureKind::Cancelled);
            task.status_text = "Cancelled".to_string();
            task.result = Some(self.partial_result(&task, Some("cancelled".to_string())));
            self.store.save_task(&task)?;
            tracing::info!(task_id, "Task cancelled");
            return Ok(task.status());
        }

        if task.state == TaskState::Queued {
            task.state = TaskState::Running;
            tracing::info!(task_id, kind = ?task.kind, "Task started");
        }

        if let Some(step) = task.current_step().cloned() {
            task.status_text = step.describe();
            let outcome = self.run_step(&mut task, &step, now, &guard);
            if let Err(lost) = guard.heartbeat(self.clock.now()) {
                tracing::warn!(task_id, step = ?step, error = %lost, "Task lock lost during step, discarding its work");
                return self.status(task_id);
            }
            match outcome {
                Ok(StepOutcome::Done) => {
                    tracing::debug!(task_id, step = ?step, "Step finished");
                    task.checkpoint.step_index += 1;
                    task.checkpoint.file_cursor = 0;
                    task.checkpoint.file_total = None;
                }
                Ok(StepOutcome::Partial) => {}
                Err(e) => {
                    tracing::error!(task_id, step = ?step, error = %e, "Task step failed");
                    self.abandon(&mut task);
                    task.state = TaskState::Failed(FailureKind::Execution);
                    task.status_text = format!("{} failed: {e}", step.describe());
                    task.result = Some(self.partial_result(&task, Some(e.to_string())));
                    self.store.save_task(&task)?;
                    return Ok(task.status());
                }
            }
        }

        if task.checkpoint.step_index >= task.plan.len() {
            self.complete(&mut task);
        } else {
            let progress = plan_progress(&task.plan, &task.checkpoint);
            task.raise_progress(progress);
        }

        self.store.save_task(&task)?;
        Ok(task.status())
    }

    fn load_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))
    }

    /// Drop everything an unfinished task produced. A backup that stops
    /// short of completion must not leave an archive behind, least of all
    /// the plaintext of one that was meant to be encrypted.
    fn abandon(&self, task: &mut Task) {
        self.builder.discard(&task.id);
        if let TaskOptions::Backup(backup) = &task.options {
            let filename = archive::archive_file_name(task.started_at, &backup.label, &task.id);
            self.builder.unpublish(&filename);
            task.checkpoint.archive_path = None;
            task.checkpoint.output_path = None;
        }
    }

    fn complete(&self, task: &mut Task) {
        task.state = TaskState::Completed;
        task.progress = 100.0;
        task.status_text = match task.kind {
            TaskKind::Backup => "Backup complete".to_string(),
            TaskKind::Restore => "Restore complete".to_string(),
        };
        task.result = Some(self.partial_result(task, None));
        tracing::info!(task_id = %task.id, kind = ?task.kind, "Task completed");
    }

    fn partial_result(&self, task: &Task, error: Option<String>) -> TaskResult {
        let checkpoint = &task.checkpoint;
        match &task.options {
            TaskOptions::Backup(_) => TaskResult {
                archive: checkpoint.output_path.clone(),
                manifest: checkpoint.manifest.clone(),
                delivered: checkpoint.delivered.clone(),
                restored: Default::default(),
                error,
            },
            TaskOptions::Restore(options) => TaskResult {
                archive: Some(options.archive.clone()),
                manifest: checkpoint.manifest.clone(),
                delivered: Vec::new(),
                restored: checkpoint.entries.clone(),
                error,
            },
        }
    }

    fn run_step(
        &self,
        task: &mut Task,
        step: &Step,
        now: DateTime<Utc>,
        guard: &LockGuard<'_, S>,
    ) -> Result<StepOutcome> {
        // Refresh the task lock while a long write is in progress so that
        // nobody reclaims it as stale.
        let clock = self.clock.clone();
        let every = self.lock_stale_after / 4;
        let mut last_beat = now;
        let mut pulse = move || -> io::Result<()> {
            let at = clock.now();
            if at - last_beat < every {
                return Ok(());
            }
            last_beat = at;
            guard.heartbeat(at).map_err(|e| io::Error::other(e.to_string()))
        };

        let options = task.options.clone();
        match (&options, step) {
            (TaskOptions::Backup(_), Step::Prepare) => {
                self.builder.discard(&task.id);
                fs::create_dir_all(self.builder.work_dir())?;
                task.checkpoint.staged_bytes = 0;
                task.checkpoint.entries.clear();
                Ok(StepOutcome::Done)
            }
            (TaskOptions::Backup(_), Step::Database) => {
                let staged = self.builder.append_database(
                    &task.id,
                    task.checkpoint.staged_bytes,
                    &*self.content,
                    &mut pulse,
                )?;
                task.checkpoint.staged_bytes = staged.staged_bytes;
                task.checkpoint
                    .entries
                    .entry(ComponentKind::Database)
                    .or_default()
                    .add(staged.files, staged.bytes);
                Ok(StepOutcome::Done)
            }
            (TaskOptions::Backup(backup), Step::Files(kind)) => {
                self.stage_files(task, backup, *kind, &mut pulse)
            }
            (TaskOptions::Backup(backup), Step::Finalize) => self.finalize(task, backup, now, &mut pulse),
            (TaskOptions::Backup(_), Step::PostCheck(check)) => self.post_check(task, *check),
            (TaskOptions::Backup(_), Step::Encrypt) => self.encrypt(task, &mut pulse),
            (TaskOptions::Backup(_), Step::Dispatch(destination)) => {
                if task.checkpoint.delivered.contains(destination) {
                    return Ok(StepOutcome::Done);
                }
                let output = output_path(task)?;
                self.sinks.get(destination)?.deliver(&output)?;
                task.checkpoint.delivered.push(destination.clone());
                Ok(StepOutcome::Done)
            }
            (TaskOptions::Restore(restore), Step::Unwrap) => self.unwrap_archive(task, restore),
            (TaskOptions::Restore(restore), Step::ReadManifest) => self.read_restore_manifest(task, restore),
            (TaskOptions::Restore(restore), Step::Extract(kind)) => self.extract(task, restore, *kind),
            (TaskOptions::Restore(_), Step::Cleanup) => {
                self.builder.discard(&task.id);
                Ok(StepOutcome::Done)
            }
            (_, step) => Err(EngineError::TaskExecution(format!(
                "step {step:?} does not apply to a {:?} task",
                task.kind
            ))),
        }
    }

    fn stage_files(
        &self,
        task: &mut Task,
        backup: &BackupOptions,
        kind: ComponentKind,
        pulse: &mut Pulse<'_>,
    ) -> Result<StepOutcome> {
        let Some(root) = self.content.component_root(kind) else {
            return Ok(StepOutcome::Done);
        };
        let walk = WalkOptions::from_patterns(&backup.include_patterns, &backup.exclude_patterns)?
            .modified_after(backup.incremental_since);
        let files = walk_directory(&root, &walk)?;

        let total = files.len();
        let start = task.checkpoint.file_cursor.min(total);
        let end = start.saturating_add(self.files_per_step).min(total);
        let staged = self
            .builder
            .append_files(&task.id, task.checkpoint.staged_bytes, kind, &files[start..end], pulse)?;

        task.checkpoint.staged_bytes = staged.staged_bytes;
        task.checkpoint
            .entries
            .entry(kind)
            .or_default()
            .add(staged.files, staged.bytes);
        task.checkpoint.file_cursor = end;
        task.checkpoint.file_total = Some(total);
        tracing::debug!(task_id = %task.id, component = %kind, done = end, total, "Files staged");

        if end >= total {
            Ok(StepOutcome::Done)
        } else {
            Ok(StepOutcome::Partial)
        }
    }

    fn finalize(
        &self,
        task: &mut Task,
        backup: &BackupOptions,
        now: DateTime<Utc>,
        pulse: &mut Pulse<'_>,
    ) -> Result<StepOutcome> {
        let filename = archive::archive_file_name(task.started_at, &backup.label, &task.id);
        let target = self.builder.archive_dir().join(&filename);

        // Published by an invocation that died before saving its checkpoint.
        if target.is_file() && !self.builder.staging_path(&task.id).exists() {
            if let Ok(manifest) = read_manifest(&target) {
                if manifest.task_id == task.id {
                    task.checkpoint.archive_path = Some(target.clone());
                    task.checkpoint.output_path = Some(target);
                    task.checkpoint.manifest = Some(manifest);
                    return Ok(StepOutcome::Done);
                }
            }
        }

        let manifest = Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            filename,
            created_at: now,
            contains: backup.components.clone(),
            archive_type: if backup.incremental_since.is_some() {
                ArchiveType::Incremental
            } else {
                ArchiveType::Full
            },
            size_bytes: task.checkpoint.entries.values().map(|e| e.bytes).sum(),
            destinations: backup.destinations.clone(),
            schedule_id: task.schedule_id.clone(),
            task_id: task.id.clone(),
            base: backup.base.clone(),
            entries: task.checkpoint.entries.clone(),
        };
        let path = self
            .builder
            .finalize(&task.id, task.checkpoint.staged_bytes, &manifest, pulse)?;

        task.checkpoint.archive_path = Some(path.clone());
        task.checkpoint.output_path = Some(path);
        task.checkpoint.manifest = Some(manifest);
        Ok(StepOutcome::Done)
    }

    fn post_check(&self, task: &mut Task, check: PostCheckKind) -> Result<StepOutcome> {
        let path = task
            .checkpoint
            .archive_path
            .clone()
            .ok_or_else(|| EngineError::TaskExecution("no archive to check".into()))?;
        match check {
            PostCheckKind::VerifyArchive => {
                let entries = verify_archive(&path)?;
                tracing::debug!(task_id = %task.id, entries, "Archive verified");
            }
            PostCheckKind::VerifyManifest => {
                let embedded = read_manifest(&path)?;
                if task.checkpoint.manifest.as_ref() != Some(&embedded) {
                    return Err(EngineError::TaskExecution(
                        "embedded manifest does not match the task".into(),
                    ));
                }
            }
        }
        Ok(StepOutcome::Done)
    }

    fn encrypt(&self, task: &mut Task, pulse: &mut Pulse<'_>) -> Result<StepOutcome> {
        let plain = task
            .checkpoint
            .archive_path
            .clone()
            .ok_or_else(|| EngineError::TaskExecution("no archive to encrypt".into()))?;
        let sealed = encrypted_path(&plain);

        if !(sealed.is_file() && !plain.exists()) {
            let key = keys::archive_key(&*self.store)?;
            envelope::encrypt_file_with(&plain, &sealed, &key, pulse)?;
            fs::remove_file(&plain)?;
        }

        task.checkpoint.archive_path = Some(sealed.clone());
        task.checkpoint.output_path = Some(sealed);
        Ok(StepOutcome::Done)
    }

    fn unwrap_archive(&self, task: &mut Task, restore: &RestoreOptions) -> Result<StepOutcome> {
        if !restore.archive.is_file() {
            return Err(EngineError::TaskExecution(format!(
                "archive {} no longer exists",
                restore.archive.display()
            )));
        }
        if envelope::is_envelope(&restore.archive)? {
            let scratch = self.builder.scratch_dir(&task.id);
            fs::create_dir_all(&scratch)?;
            let unwrapped = scratch.join(format!("archive.{}", archive::ARCHIVE_EXTENSION));
            let key = keys::archive_key(&*self.store)?;
            envelope::decrypt_file(&restore.archive, &unwrapped, &key)?;
            task.checkpoint.archive_path = Some(unwrapped);
        } else {
            task.checkpoint.archive_path = Some(restore.archive.clone());
        }
        Ok(StepOutcome::Done)
    }

    fn read_restore_manifest(&self, task: &mut Task, restore: &RestoreOptions) -> Result<StepOutcome> {
        let path = task
            .checkpoint
            .archive_path
            .clone()
            .ok_or_else(|| EngineError::TaskExecution("archive was not opened".into()))?;
        let manifest = match read_manifest(&path) {
            Ok(manifest) => manifest,
            Err(e) if path != restore.archive => {
                return Err(EngineError::Decryption(format!(
                    "decrypted content is not a valid archive: {e}"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(missing) = restore.components.iter().find(|k| !manifest.contains.contains(*k)) {
            return Err(EngineError::TaskExecution(format!(
                "archive does not contain {missing}"
            )));
        }

        let next = task.checkpoint.step_index + 1;
        let remaining: Vec<Step> = task.plan[next..]
            .iter()
            .filter(|step| match step {
                Step::Extract(kind) => manifest.contains.contains(kind),
                _ => true,
            })
            .cloned()
            .collect();
        task.plan.truncate(next);
        task.plan.extend(remaining);
        task.checkpoint.manifest = Some(manifest);
        Ok(StepOutcome::Done)
    }

    fn extract(&self, task: &mut Task, restore: &RestoreOptions, kind: ComponentKind) -> Result<StepOutcome> {
        let path = task
            .checkpoint
            .archive_path
            .clone()
            .ok_or_else(|| EngineError::TaskExecution("archive was not opened".into()))?;

        let extracted = match kind.dir_name() {
            None => {
                let scratch = self.builder.scratch_dir(&task.id);
                fs::create_dir_all(&scratch)?;
                let extracted = extract_component(&path, kind, &scratch)?;
                let dump = scratch.join(DATABASE_FILE_NAME);
                if extracted.files > 0 {
                    self.content.restore_database(&dump)?;
                }
                let _ = fs::remove_file(&dump);
                extracted
            }
            Some(dir) => {
                let dest = match &restore.target_root {
                    Some(root) => root.join(dir),
                    None => self.content.component_root(kind).ok_or_else(|| {
                        EngineError::TaskExecution(format!("no restore location for {kind}"))
                    })?,
                };
                extract_component(&path, kind, &dest)?
            }
        };

        tracing::info!(task_id = %task.id, component = %kind, files = extracted.files, "Component restored");
        task.checkpoint.entries.insert(kind, extracted);
        Ok(StepOutcome::Done)
    }
}

fn output_path(task: &Task) -> Result<PathBuf> {
    task.checkpoint
        .output_path
        .clone()
        .ok_or_else(|| EngineError::TaskExecution("no archive to deliver".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::content::DirectoryContentSource;
    use crate::recurrence::RecurrenceSpec;
    use crate::store::{LockStore, MemoryStore};
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        clock: Arc<ManualClock>,
        orchestrator: TaskOrchestrator<MemoryStore>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("site");
        fs::create_dir_all(root.join("uploads/2024")).unwrap();
        fs::create_dir_all(root.join("themes/classic")).unwrap();
        fs::write(root.join("uploads/2024/a.jpg"), b"aaaa").unwrap();
        fs::write(root.join("uploads/2024/b.jpg"), b"bbbb").unwrap();
        fs::write(root.join("uploads/c.txt"), b"cc").unwrap();
        fs::write(root.join("themes/classic/style.css"), b"body{}").unwrap();
        fs::write(root.join("database.sql"), b"CREATE TABLE posts;").unwrap();

        let config = EngineConfig {
            work_dir: dir.path().join("work"),
            archive_dir: dir.path().join("archives"),
            content_root: root.clone(),
            files_per_step: 2,
            destinations: vec![crate::config::DestinationConfig {
                id: "offsite".into(),
                path: dir.path().join("offsite"),
            }],
            ..EngineConfig::default()
        };
        let clock = Arc::new(ManualClock::new(t0()));
        let orchestrator = TaskOrchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DirectoryContentSource::new(&root)),
            &config,
        )
        .with_clock(clock.clone());
        Fixture {
            _dir: dir,
            root,
            clock,
            orchestrator,
        }
    }

    fn hourly(owner: &str) -> NewSchedule {
        let mut input = NewSchedule::new(owner, "hourly site", RecurrenceSpec::Fixed { interval_seconds: 3600 });
        input.selected_components = BTreeSet::from([ComponentKind::Database, ComponentKind::Uploads, ComponentKind::Themes]);
        input
    }

    fn drive(orchestrator: &TaskOrchestrator<MemoryStore>, task_id: &str) -> Vec<TaskStatus> {
        let mut seen = Vec::new();
        for _ in 0..50 {
            let status = orchestrator.advance(task_id).unwrap();
            let done = status.status != crate::task::StatusKind::Running;
            seen.push(status);
            if done {
                break;
            }
        }
        seen
    }

    #[test]
    fn test_tick_creates_due_task_once() {
        let f = fixture();
        let schedule = f.orchestrator.create_schedule(hourly("admin")).unwrap();

        let report = f.orchestrator.tick(None).unwrap();
        assert!(report.created.is_empty(), "nothing due at creation time");

        f.clock.advance(Duration::minutes(61));
        let report = f.orchestrator.tick(None).unwrap();
        assert_eq!(report.created.len(), 1);
        let task = f.orchestrator.store().get_task(&report.created[0]).unwrap().unwrap();
        assert_eq!(task.scheduled_for, Some(t0() + Duration::hours(1)));
        assert_eq!(task.schedule_id.as_deref(), Some(schedule.id.as_str()));

        // Same occurrence again: not due.
        let report = f.orchestrator.tick(None).unwrap();
        assert!(report.created.is_empty());
        assert!(report.skipped_active.is_empty());
    }

    #[test]
    fn test_tick_skips_while_task_is_active() {
        let f = fixture();
        f.orchestrator.create_schedule(hourly("admin")).unwrap();
        f.clock.advance(Duration::minutes(61));
        let first = f.orchestrator.tick(None).unwrap();
        assert_eq!(first.created.len(), 1);

        f.clock.advance(Duration::hours(1));
        let second = f.orchestrator.tick(None).unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.skipped_active.len(), 1);
        assert!(matches!(
            f.orchestrator.run_now(&second.skipped_active[0], "admin"),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn test_missed_occurrences_coalesce() {
        let f = fixture();
        f.orchestrator.create_schedule(hourly("admin")).unwrap();
        f.clock.advance(Duration::hours(5) + Duration::minutes(10));
        let report = f.orchestrator.tick(None).unwrap();
        assert_eq!(report.created.len(), 1);
        let task = f.orchestrator.store().get_task(&report.created[0]).unwrap().unwrap();
        assert_eq!(task.scheduled_for, Some(t0() + Duration::hours(5)));
    }

    #[test]
    fn test_backup_runs_to_completion_with_monotonic_progress() {
        let f = fixture();
        let mut input = hourly("admin");
        input.post_checks = BTreeSet::from([PostCheckKind::VerifyArchive, PostCheckKind::VerifyManifest]);
        input.secondary_destinations = vec!["offsite".into()];
        let schedule = f.orchestrator.create_schedule(input).unwrap();
        let task_id = f.orchestrator.run_now(&schedule.id, "admin").unwrap();

        let statuses = drive(&f.orchestrator, &task_id);
        let last = statuses.last().unwrap();
        assert_eq!(last.status, crate::task::StatusKind::Complete);
        assert_eq!(last.progress, 100.0);
        for pair in statuses.windows(2) {
            assert!(pair[1].progress >= pair[0].progress);
        }
        assert!(statuses[..statuses.len() - 1].iter().all(|s| s.progress < 100.0));

        let task = f.orchestrator.store().get_task(&task_id).unwrap().unwrap();
        let result = task.result.unwrap();
        let manifest = result.manifest.unwrap();
        assert_eq!(manifest.entries[&ComponentKind::Uploads].files, 3);
        assert_eq!(manifest.entries[&ComponentKind::Themes].files, 1);
        assert_eq!(manifest.entries[&ComponentKind::Database].files, 1);
        assert_eq!(manifest.archive_type, ArchiveType::Full);
        assert_eq!(result.delivered, vec!["offsite".to_string()]);
        assert!(result.archive.unwrap().is_file());
        assert!(!f.orchestrator.builder().staging_path(&task_id).exists());

        // Terminal tasks are left alone.
        assert_eq!(f.orchestrator.advance(&task_id).unwrap().progress, 100.0);
    }

    #[test]
    fn test_cancel_between_steps() {
        let f = fixture();
        let schedule = f.orchestrator.create_schedule(hourly("admin")).unwrap();
        let task_id = f.orchestrator.run_now(&schedule.id, "admin").unwrap();

        f.orchestrator.advance(&task_id).unwrap();
        let before = f.orchestrator.advance(&task_id).unwrap().progress;
        assert!(f.orchestrator.request_cancel(&task_id).unwrap());

        let status = f.orchestrator.advance(&task_id).unwrap();
        assert_eq!(status.status, crate::task::StatusKind::Error);
        assert_eq!(status.status_text, "Cancelled");
        assert_eq!(status.progress, before);
        assert!(!f.orchestrator.builder().staging_path(&task_id).exists());

        let task = f.orchestrator.store().get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed(FailureKind::Cancelled));
        assert!(!f.orchestrator.request_cancel(&task_id).unwrap());
    }

    #[test]
    fn test_cancel_after_finalize_withdraws_archive() {
        let f = fixture();
        let mut input = hourly("admin");
        input.encrypt = true;
        let schedule = f.orchestrator.create_schedule(input).unwrap();
        let task_id = f.orchestrator.run_now(&schedule.id, "admin").unwrap();

        let mut published = None;
        for _ in 0..20 {
            f.orchestrator.advance(&task_id).unwrap();
            let task = f.orchestrator.store().get_task(&task_id).unwrap().unwrap();
            if let Some(path) = task.checkpoint.archive_path {
                published = Some(path);
                break;
            }
        }
        let plain = published.expect("archive finalized");
        assert!(plain.is_file());

        assert!(f.orchestrator.request_cancel(&task_id).unwrap());
        let status = f.orchestrator.advance(&task_id).unwrap();
        assert_eq!(status.status_text, "Cancelled");

        assert!(!plain.exists());
        assert!(!encrypted_path(&plain).exists());
        let listed = archive::list_archives(f.orchestrator.builder().archive_dir(), None).unwrap();
        assert!(listed.is_empty(), "{listed:?}");
        let task = f.orchestrator.store().get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.result.unwrap().archive, None);
    }

    #[test]
    fn test_failed_post_check_withdraws_archive() {
        let f = fixture();
        let mut input = hourly("admin");
        input.post_checks = BTreeSet::from([PostCheckKind::VerifyArchive]);
        let schedule = f.orchestrator.create_schedule(input).unwrap();
        let task_id = f.orchestrator.run_now(&schedule.id, "admin").unwrap();

        let plain = loop {
            f.orchestrator.advance(&task_id).unwrap();
            let task = f.orchestrator.store().get_task(&task_id).unwrap().unwrap();
            if let Some(path) = task.checkpoint.archive_path {
                break path;
            }
        };
        fs::write(&plain, b"not a zstd stream").unwrap();

        let status = f.orchestrator.advance(&task_id).unwrap();
        assert_eq!(status.status, crate::task::StatusKind::Error);
        assert!(!plain.exists());
    }

    #[test]
    fn test_locked_task_is_not_advanced() {
        let f = fixture();
        let schedule = f.orchestrator.create_schedule(hourly("admin")).unwrap();
        let task_id = f.orchestrator.run_now(&schedule.id, "admin").unwrap();

        f.orchestrator
            .store()
            .try_acquire(&task_lock_key(&task_id), "someone-else", t0(), Duration::minutes(10))
            .unwrap();
        let status = f.orchestrator.advance(&task_id).unwrap();
        assert_eq!(status.status_text, "Queued");

        // Once the other holder goes quiet the lock is reclaimed.
        f.clock.advance(Duration::minutes(11));
        let status = f.orchestrator.advance(&task_id).unwrap();
        assert_eq!(status.status_text, "Preparing backup");
    }

    /// Dump that takes twelve minutes of clock time. `beats_between` decides
    /// whether it writes (and so lets the lock heartbeat) along the way.
    struct SlowDump {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        lock_key: std::sync::Mutex<Option<String>>,
        beats_between: bool,
        intruder_won: std::sync::Mutex<Option<bool>>,
    }

    impl ContentSource for SlowDump {
        fn dump_database(&self, out: &mut dyn std::io::Write) -> std::result::Result<u64, crate::content::ContentError> {
            out.write_all(b"INSERT 1;\n")?;
            self.clock.advance(Duration::minutes(6));
            if self.beats_between {
                out.write_all(b"INSERT 2;\n")?;
            }
            self.clock.advance(Duration::minutes(6));

            let key = self.lock_key.lock().unwrap().clone().unwrap();
            let won = self
                .store
                .try_acquire(&key, "intruder", self.clock.now(), Duration::minutes(10))
                .unwrap();
            *self.intruder_won.lock().unwrap() = Some(won);

            out.write_all(b"INSERT 3;\n")?;
            Ok(30)
        }

        fn restore_database(&self, _dump: &std::path::Path) -> std::result::Result<(), crate::content::ContentError> {
            Ok(())
        }

        fn component_root(&self, _kind: ComponentKind) -> Option<PathBuf> {
            None
        }
    }

    fn slow_dump_run(beats_between: bool) -> (Arc<SlowDump>, TaskOrchestrator<MemoryStore>, TaskId, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            work_dir: dir.path().join("work"),
            archive_dir: dir.path().join("archives"),
            content_root: dir.path().join("site"),
            ..EngineConfig::default()
        };
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new());
        let dump = Arc::new(SlowDump {
            clock: clock.clone(),
            store: store.clone(),
            lock_key: std::sync::Mutex::new(None),
            beats_between,
            intruder_won: std::sync::Mutex::new(None),
        });
        let orchestrator = TaskOrchestrator::new(store, dump.clone(), &config).with_clock(clock);

        let mut input = hourly("admin");
        input.selected_components = BTreeSet::from([ComponentKind::Database]);
        let schedule = orchestrator.create_schedule(input).unwrap();
        let task_id = orchestrator.run_now(&schedule.id, "admin").unwrap();
        *dump.lock_key.lock().unwrap() = Some(task_lock_key(&task_id));
        assert_eq!(orchestrator.advance(&task_id).unwrap().status_text, "Preparing backup");
        (dump, orchestrator, task_id, dir)
    }

    #[test]
    fn test_heartbeat_keeps_task_lock_during_long_step() {
        let (dump, orchestrator, task_id, _dir) = slow_dump_run(true);

        let status = orchestrator.advance(&task_id).unwrap();
        assert_eq!(*dump.intruder_won.lock().unwrap(), Some(false));
        assert_eq!(status.status, crate::task::StatusKind::Running);
        let task = orchestrator.store().get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.checkpoint.step_index, 2);
        assert_eq!(task.checkpoint.entries[&ComponentKind::Database].files, 1);
    }

    #[test]
    fn test_reclaimed_lock_discards_step() {
        let (dump, orchestrator, task_id, _dir) = slow_dump_run(false);

        orchestrator.advance(&task_id).unwrap();
        assert_eq!(*dump.intruder_won.lock().unwrap(), Some(true));

        // The step's work was dropped and the task left for the new holder.
        let task = orchestrator.store().get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.checkpoint.step_index, 1);
        assert!(task.checkpoint.entries.is_empty());
    }

    #[test]
    fn test_failed_step_reports_cause() {
        let f = fixture();
        let schedule = f.orchestrator.create_schedule(hourly("admin")).unwrap();
        fs::remove_file(f.root.join("database.sql")).unwrap();
        let task_id = f.orchestrator.run_now(&schedule.id, "admin").unwrap();

        let statuses = drive(&f.orchestrator, &task_id);
        let last = statuses.last().unwrap();
        assert_eq!(last.status, crate::task::StatusKind::Error);
        assert!(last.status_text.starts_with("Backing up database failed"));
        let task = f.orchestrator.store().get_task(&task_id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed(FailureKind::Execution));
        assert!(task.result.unwrap().error.is_some());
    }

    #[test]
    fn test_unknown_destination_is_rejected_before_persisting() {
        let f = fixture();
        let mut input = hourly("admin");
        input.secondary_destinations = vec!["nowhere".into()];
        assert!(matches!(f.orchestrator.create_schedule(input), Err(EngineError::Validation(_))));
        assert!(f.orchestrator.store().list_schedules(None).unwrap().is_empty());
    }

    #[test]
    fn test_other_owners_cannot_touch_schedules_or_tasks() {
        let f = fixture();
        let schedule = f.orchestrator.create_schedule(hourly("site-a")).unwrap();
        let not_found = |r: Result<_>| matches!(r, Err(EngineError::NotFound(_)));

        assert!(not_found(f.orchestrator.update_schedule(&schedule.id, hourly("site-b"), 1).map(|_| ())));
        assert!(not_found(f.orchestrator.set_schedule_enabled(&schedule.id, "site-b", false).map(|_| ())));
        assert!(not_found(f.orchestrator.delete_schedule(&schedule.id, "site-b")));
        assert!(not_found(f.orchestrator.run_now(&schedule.id, "site-b").map(|_| ())));

        let task_id = f.orchestrator.run_now(&schedule.id, "site-a").unwrap();
        assert!(not_found(f.orchestrator.owned_task(&task_id, "site-b").map(|_| ())));
        assert_eq!(f.orchestrator.owned_task(&task_id, "site-a").unwrap().id, task_id);

        let disabled = f.orchestrator.set_schedule_enabled(&schedule.id, "site-a", false).unwrap();
        assert!(!disabled.enabled);
        f.orchestrator.delete_schedule(&schedule.id, "site-a").unwrap();
        assert!(not_found(f.orchestrator.delete_schedule(&schedule.id, "site-a")));
    }

    #[test]
    fn test_update_with_stale_version_conflicts() {
        let f = fixture();
        let schedule = f.orchestrator.create_schedule(hourly("admin")).unwrap();
        let mut input = hourly("admin");
        input.label = "renamed".into();
        let saved = f.orchestrator.update_schedule(&schedule.id, input.clone(), 1).unwrap();
        assert_eq!(saved.version, 2);
        assert_eq!(saved.label, "renamed");
        assert!(matches!(
            f.orchestrator.update_schedule(&schedule.id, input, 1),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn test_event_batch_fires_one_task() {
        let mut f = fixture();
        let schedule = f.orchestrator.create_schedule(hourly("admin")).unwrap();
        f.orchestrator = f.orchestrator.with_triggers([TriggerConfig {
            event: "plugin_updated".into(),
            schedule_id: schedule.id.clone(),
            enabled: true,
            cooldown_seconds: 3600,
            batch_window_seconds: 60,
            max_batch: 10,
        }]);

        for _ in 0..3 {
            let outcome = f.orchestrator.handle_event("plugin_updated", None).unwrap();
            assert!(matches!(outcome, TriggerOutcome::Buffered { .. }));
        }
        assert!(matches!(
            f.orchestrator.handle_event("unknown", None).unwrap(),
            TriggerOutcome::Ignored { reason: IgnoreReason::UnknownEvent }
        ));

        f.clock.advance(Duration::seconds(61));
        let report = f.orchestrator.tick(None).unwrap();
        assert_eq!(report.triggers_fired.len(), 1);
        let task = f.orchestrator.store().get_task(&report.triggers_fired[0]).unwrap().unwrap();
        assert_eq!(task.trigger, TaskTrigger::Event("plugin_updated".into()));

        // Inside the cooldown.
        assert!(matches!(
            f.orchestrator.handle_event("plugin_updated", None).unwrap(),
            TriggerOutcome::Ignored { reason: IgnoreReason::CoolingDown { .. } }
        ));
    }

    #[test]
    fn test_events_against_busy_schedule_stay_bounded() {
        let mut f = fixture();
        let schedule = f.orchestrator.create_schedule(hourly("admin")).unwrap();
        f.orchestrator = f.orchestrator.with_triggers([TriggerConfig {
            event: "theme_switched".into(),
            schedule_id: schedule.id.clone(),
            enabled: true,
            cooldown_seconds: 0,
            batch_window_seconds: 0,
            max_batch: 5,
        }]);
        f.orchestrator.run_now(&schedule.id, "admin").unwrap();

        for i in 0..200 {
            let outcome = f.orchestrator.handle_event("theme_switched", Some(format!("switch {i}"))).unwrap();
            assert_eq!(outcome, TriggerOutcome::Deferred { pending: i + 1 });
        }
        let state = f.orchestrator.store().load_trigger_state("theme_switched").unwrap().unwrap();
        assert_eq!(state.pending.len(), 5);
        assert_eq!(state.event_count(), 200);
    }
}
