//! Tasks: one concrete backup or restore, driven to completion one step per
//! invocation by the [`TaskOrchestrator`].

pub mod orchestrator;
pub mod progress;

pub use orchestrator::{RestoreRequest, TaskOrchestrator, TickReport, TriggerOutcome};
pub use progress::{clamp_progress, plan_progress};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::archive::{ComponentEntry, Manifest};
use crate::schedule::{ComponentKind, DestinationId, PostCheckKind, ScheduleId};

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Backup,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Cancelled,
    Execution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed(FailureKind),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed(_))
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed(FailureKind::Cancelled) => "cancelled",
            TaskState::Failed(FailureKind::Execution) => "failed",
        }
    }
}

/// What created a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "event", rename_all = "snake_case")]
pub enum TaskTrigger {
    Schedule,
    Manual,
    Event(String),
}

/// One unit of work. Backups run
/// `Prepare, Database?, Files*, Finalize, PostCheck*, Encrypt?, Dispatch*`;
/// restores run `Unwrap, ReadManifest, Extract*, Cleanup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", content = "target", rename_all = "snake_case")]
pub enum Step {
    Prepare,
    Database,
    Files(ComponentKind),
    Finalize,
    PostCheck(PostCheckKind),
    Encrypt,
    Dispatch(DestinationId),
    Unwrap,
    ReadManifest,
    Extract(ComponentKind),
    Cleanup,
}

impl Step {
    /// Relative cost used for progress reporting.
    pub fn weight(&self) -> u32 {
        match self {
            Step::Prepare | Step::ReadManifest | Step::Cleanup => 1,
            Step::PostCheck(_) => 4,
            Step::Dispatch(_) => 5,
            Step::Encrypt | Step::Unwrap => 8,
            Step::Database | Step::Finalize => 10,
            Step::Files(_) | Step::Extract(_) => 20,
        }
    }

    /// Whether the step may need several invocations.
    pub fn is_chunked(&self) -> bool {
        matches!(self, Step::Files(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Step::Prepare => "Preparing backup".to_string(),
            Step::Database => "Backing up database".to_string(),
            Step::Files(kind) => format!("Backing up {kind}"),
            Step::Finalize => "Creating archive".to_string(),
            Step::PostCheck(PostCheckKind::VerifyArchive) => "Verifying archive".to_string(),
            Step::PostCheck(PostCheckKind::VerifyManifest) => "Verifying manifest".to_string(),
            Step::Encrypt => "Encrypting archive".to_string(),
            Step::Dispatch(dest) => format!("Sending archive to {dest}"),
            Step::Unwrap => "Opening archive".to_string(),
            Step::ReadManifest => "Reading manifest".to_string(),
            Step::Extract(ComponentKind::Database) => "Restoring database".to_string(),
            Step::Extract(kind) => format!("Restoring {kind}"),
            Step::Cleanup => "Cleaning up".to_string(),
        }
    }
}

/// Snapshot of the schedule a backup was created from; later schedule edits
/// do not affect a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupOptions {
    pub label: String,
    pub components: BTreeSet<ComponentKind>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub encrypt: bool,
    /// Set for incremental backups: only files modified after this instant.
    pub incremental_since: Option<DateTime<Utc>>,
    /// File name of the archive an incremental builds on.
    pub base: Option<String>,
    pub post_checks: BTreeSet<PostCheckKind>,
    pub destinations: Vec<DestinationId>,
}

impl BackupOptions {
    pub fn plan(&self) -> Vec<Step> {
        let mut plan = vec![Step::Prepare];
        if self.components.contains(&ComponentKind::Database) {
            plan.push(Step::Database);
        }
        plan.extend(
            self.components
                .iter()
                .filter(|kind| kind.dir_name().is_some())
                .map(|kind| Step::Files(*kind)),
        );
        plan.push(Step::Finalize);
        plan.extend(self.post_checks.iter().map(|check| Step::PostCheck(*check)));
        if self.encrypt {
            plan.push(Step::Encrypt);
        }
        plan.extend(self.destinations.iter().cloned().map(Step::Dispatch));
        plan
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOptions {
    pub archive: PathBuf,
    /// Components to restore; empty restores everything the archive holds.
    pub components: BTreeSet<ComponentKind>,
    /// Restore files under this root instead of the live content root.
    pub target_root: Option<PathBuf>,
}

impl RestoreOptions {
    /// Extraction steps are narrowed to the manifest once it has been read.
    pub fn plan(&self) -> Vec<Step> {
        let wanted: Vec<ComponentKind> = if self.components.is_empty() {
            ComponentKind::ALL.to_vec()
        } else {
            self.components.iter().copied().collect()
        };
        let mut plan = vec![Step::Unwrap, Step::ReadManifest];
        plan.extend(wanted.into_iter().map(Step::Extract));
        plan.push(Step::Cleanup);
        plan
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOptions {
    Backup(BackupOptions),
    Restore(RestoreOptions),
}

/// Persisted resume point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Index into the plan of the next step to run.
    pub step_index: usize,
    /// Committed length of the staging tar.
    pub staged_bytes: u64,
    /// Files already handled by the current chunked step.
    pub file_cursor: usize,
    pub file_total: Option<usize>,
    pub entries: BTreeMap<ComponentKind, ComponentEntry>,
    /// Finalized archive (backup) or unwrapped archive (restore).
    pub archive_path: Option<PathBuf>,
    /// What destinations receive: the archive or its envelope.
    pub output_path: Option<PathBuf>,
    pub manifest: Option<Manifest>,
    pub delivered: Vec<DestinationId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub archive: Option<PathBuf>,
    pub manifest: Option<Manifest>,
    pub delivered: Vec<DestinationId>,
    pub restored: BTreeMap<ComponentKind, ComponentEntry>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner: String,
    pub schedule_id: Option<ScheduleId>,
    pub kind: TaskKind,
    pub state: TaskState,
    pub progress: f64,
    pub status_text: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Occurrence this task was created for, when created by the tick.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub trigger: TaskTrigger,
    pub cancel_requested: bool,
    pub options: TaskOptions,
    pub plan: Vec<Step>,
    pub checkpoint: Checkpoint,
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn new(
        id: TaskId,
        owner: &str,
        schedule_id: Option<ScheduleId>,
        options: TaskOptions,
        trigger: TaskTrigger,
        now: DateTime<Utc>,
    ) -> Self {
        let (kind, plan) = match &options {
            TaskOptions::Backup(backup) => (TaskKind::Backup, backup.plan()),
            TaskOptions::Restore(restore) => (TaskKind::Restore, restore.plan()),
        };
        Self {
            id,
            owner: owner.to_string(),
            schedule_id,
            kind,
            state: TaskState::Queued,
            progress: 0.0,
            status_text: "Queued".to_string(),
            started_at: now,
            updated_at: now,
            scheduled_for: None,
            trigger,
            cancel_requested: false,
            options,
            plan,
            checkpoint: Checkpoint::default(),
            result: None,
        }
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.plan.get(self.checkpoint.step_index)
    }

    /// Raise progress to `value`, never lowering it and never reaching 100
    /// before completion.
    pub fn raise_progress(&mut self, value: f64) {
        let value = clamp_progress(value).min(99.0);
        if value > self.progress {
            self.progress = value;
        }
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::of(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Running,
    Complete,
    Error,
}

/// Shape consumed by polling clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub status: StatusKind,
    #[serde(default)]
    pub status_text: String,
    #[serde(
        default,
        serialize_with = "serialize_progress",
        deserialize_with = "deserialize_progress"
    )]
    pub progress: f64,
}

impl TaskStatus {
    pub fn of(task: &Task) -> Self {
        let status = match task.state {
            TaskState::Queued | TaskState::Running => StatusKind::Running,
            TaskState::Completed => StatusKind::Complete,
            TaskState::Failed(_) => StatusKind::Error,
        };
        Self {
            task_id: task.id.clone(),
            status,
            status_text: task.status_text.clone(),
            progress: clamp_progress(task.progress),
        }
    }
}

fn serialize_progress<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(clamp_progress(*value))
}

fn deserialize_progress<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    let raw = match &value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(clamp_progress(raw.unwrap_or(0.0)))
}
