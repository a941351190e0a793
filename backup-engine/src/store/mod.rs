//! Persistence seams. The engine only talks to these traits; the runner
//! backs them with SQLite and tests use [`MemoryStore`].

mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Duration, Utc};

use crate::schedule::Schedule;
use crate::task::{Task, TaskKind};
use crate::trigger::TriggerState;
use crate::utils::{EngineError, Result};

pub trait ScheduleStore {
    fn list_schedules(&self, owner: Option<&str>) -> Result<Vec<Schedule>>;

    fn get_schedule(&self, id: &str) -> Result<Option<Schedule>>;

    fn insert_schedule(&self, schedule: &Schedule) -> Result<()>;

    /// Replace a schedule. `schedule.version` must equal the stored version,
    /// otherwise [`EngineError::Conflict`]. Returns the stored copy with its
    /// version incremented.
    fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule>;

    fn set_schedule_enabled(&self, id: &str, enabled: bool) -> Result<Schedule>;

    fn delete_schedule(&self, id: &str) -> Result<bool>;
}

pub trait TaskStore {
    fn insert_task(&self, task: &Task) -> Result<()>;

    fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Persist a task. A stored `cancel_requested` flag is never cleared.
    fn save_task(&self, task: &Task) -> Result<()>;

    /// Set the cancel flag without touching anything else.
    fn mark_cancel_requested(&self, id: &str) -> Result<bool>;

    /// Latest `scheduled_for` among the schedule's tasks.
    fn latest_scheduled_for(&self, schedule_id: &str) -> Result<Option<DateTime<Utc>>>;

    fn active_task_for_schedule(&self, schedule_id: &str) -> Result<Option<Task>>;

    fn last_completed(&self, schedule_id: &str, kind: TaskKind) -> Result<Option<Task>>;

    /// Newest first.
    fn list_tasks(&self, owner: Option<&str>, limit: usize) -> Result<Vec<Task>>;

    /// Every queued or running task, oldest first, regardless of how many
    /// finished tasks came after them.
    fn list_active_tasks(&self) -> Result<Vec<Task>>;
}

/// Named mutual-exclusion rows with a heartbeat.
pub trait LockStore {
    /// Take `key` for `holder`. Succeeds when the lock is free, already held
    /// by `holder`, or its heartbeat is older than `stale_after`.
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool>;

    fn heartbeat(&self, key: &str, holder: &str, now: DateTime<Utc>) -> Result<bool>;

    fn release(&self, key: &str, holder: &str) -> Result<()>;
}

pub trait TriggerStore {
    fn load_trigger_state(&self, event: &str) -> Result<Option<TriggerState>>;

    fn save_trigger_state(&self, state: &TriggerState) -> Result<()>;
}

/// Host-provided key/value settings.
pub trait SettingsRepository {
    fn get_setting(&self, key: &str) -> Result<Option<String>>;

    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Everything the orchestrator needs from persistence.
pub trait Store: ScheduleStore + TaskStore + LockStore + TriggerStore + SettingsRepository + Send + Sync {}

impl<T> Store for T where
    T: ScheduleStore + TaskStore + LockStore + TriggerStore + SettingsRepository + Send + Sync
{
}

pub fn schedule_lock_key(schedule_id: &str) -> String {
    format!("schedule:{schedule_id}")
}

pub fn task_lock_key(task_id: &str) -> String {
    format!("task:{task_id}")
}

/// Held lock, released on drop.
pub struct LockGuard<'a, L: LockStore + ?Sized> {
    store: &'a L,
    key: String,
    holder: String,
}

impl<'a, L: LockStore + ?Sized> LockGuard<'a, L> {
    /// `Ok(None)` when someone else holds a fresh lock.
    pub fn acquire(
        store: &'a L,
        key: String,
        holder: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Option<Self>> {
        if !store.try_acquire(&key, holder, now, stale_after)? {
            return Ok(None);
        }
        Ok(Some(Self {
            store,
            key,
            holder: holder.to_string(),
        }))
    }

    pub fn heartbeat(&self, now: DateTime<Utc>) -> Result<()> {
        if self.store.heartbeat(&self.key, &self.holder, now)? {
            Ok(())
        } else {
            Err(EngineError::Conflict(format!("lock {} was taken over", self.key)))
        }
    }
}

impl<L: LockStore + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if let Err(e) = self.store.release(&self.key, &self.holder) {
            tracing::warn!(key = %self.key, error = %e, "Failed to release lock");
        }
    }
}
