//! In-process store used by tests and embedders that do not persist.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{LockStore, ScheduleStore, SettingsRepository, TaskStore, TriggerStore};
use crate::schedule::Schedule;
use crate::task::{Task, TaskKind, TaskState};
use crate::trigger::TriggerState;
use crate::utils::{EngineError, Result};

#[derive(Debug, Clone)]
struct LockRow {
    holder: String,
    heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    schedules: BTreeMap<String, Schedule>,
    tasks: BTreeMap<String, Task>,
    locks: HashMap<String, LockRow>,
    triggers: BTreeMap<String, TriggerState>,
    settings: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Storage("memory store mutex poisoned".to_string()))
    }
}

impl ScheduleStore for MemoryStore {
    fn list_schedules(&self, owner: Option<&str>) -> Result<Vec<Schedule>> {
        let inner = self.lock()?;
        let mut schedules: Vec<Schedule> = inner
            .schedules
            .values()
            .filter(|s| owner.map_or(true, |o| s.owner == o))
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(schedules)
    }

    fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        Ok(self.lock()?.schedules.get(id).cloned())
    }

    fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.schedules.contains_key(&schedule.id) {
            return Err(EngineError::Conflict(format!("schedule {} already exists", schedule.id)));
        }
        inner.schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule> {
        let mut inner = self.lock()?;
        let stored = inner
            .schedules
            .get_mut(&schedule.id)
            .ok_or_else(|| EngineError::NotFound(format!("schedule {}", schedule.id)))?;
        if stored.version != schedule.version {
            return Err(EngineError::Conflict(format!(
                "schedule {} was modified (version {} != {})",
                schedule.id, schedule.version, stored.version
            )));
        }
        let mut next = schedule.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    fn set_schedule_enabled(&self, id: &str, enabled: bool) -> Result<Schedule> {
        let mut inner = self.lock()?;
        let stored = inner
            .schedules
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("schedule {id}")))?;
        stored.enabled = enabled;
        stored.version += 1;
        Ok(stored.clone())
    }

    fn delete_schedule(&self, id: &str) -> Result<bool> {
        Ok(self.lock()?.schedules.remove(id).is_some())
    }
}

impl TaskStore for MemoryStore {
    fn insert_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.tasks.contains_key(&task.id) {
            return Err(EngineError::Conflict(format!("task {} already exists", task.id)));
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.lock()?.tasks.get(id).cloned())
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.lock()?;
        let stored = inner
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task.id)))?;
        let cancel_requested = stored.cancel_requested || task.cancel_requested;
        *stored = task.clone();
        stored.cancel_requested = cancel_requested;
        Ok(())
    }

    fn mark_cancel_requested(&self, id: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.tasks.get_mut(id) {
            Some(task) => {
                task.cancel_requested = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn latest_scheduled_for(&self, schedule_id: &str) -> Result<Option<DateTime<Utc>>> {
        let inner = self.lock()?;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.schedule_id.as_deref() == Some(schedule_id))
            .filter_map(|t| t.scheduled_for)
            .max())
    }

    fn active_task_for_schedule(&self, schedule_id: &str) -> Result<Option<Task>> {
        let inner = self.lock()?;
        Ok(inner
            .tasks
            .values()
            .find(|t| t.schedule_id.as_deref() == Some(schedule_id) && t.state.is_active())
            .cloned())
    }

    fn last_completed(&self, schedule_id: &str, kind: TaskKind) -> Result<Option<Task>> {
        let inner = self.lock()?;
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                t.schedule_id.as_deref() == Some(schedule_id)
                    && t.kind == kind
                    && t.state == TaskState::Completed
            })
            .max_by_key(|t| t.started_at)
            .cloned())
    }

    fn list_tasks(&self, owner: Option<&str>, limit: usize) -> Result<Vec<Task>> {
        let inner = self.lock()?;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| owner.map_or(true, |o| t.owner == o))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn list_active_tasks(&self) -> Result<Vec<Task>> {
        let inner = self.lock()?;
        let mut tasks: Vec<Task> = inner.tasks.values().filter(|t| t.state.is_active()).cloned().collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }
}

impl LockStore for MemoryStore {
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        if let Some(row) = inner.locks.get(key) {
            if row.holder != holder && now - row.heartbeat_at < stale_after {
                return Ok(false);
            }
            if row.holder != holder {
                tracing::warn!(key, previous = %row.holder, "Reclaiming stale lock");
            }
        }
        inner.locks.insert(
            key.to_string(),
            LockRow {
                holder: holder.to_string(),
                heartbeat_at: now,
            },
        );
        Ok(true)
    }

    fn heartbeat(&self, key: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.locks.get_mut(key) {
            Some(row) if row.holder == holder => {
                row.heartbeat_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, key: &str, holder: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.locks.get(key).is_some_and(|row| row.holder == holder) {
            inner.locks.remove(key);
        }
        Ok(())
    }
}

impl TriggerStore for MemoryStore {
    fn load_trigger_state(&self, event: &str) -> Result<Option<TriggerState>> {
        Ok(self.lock()?.triggers.get(event).cloned())
    }

    fn save_trigger_state(&self, state: &TriggerState) -> Result<()> {
        self.lock()?.triggers.insert(state.event.clone(), state.clone());
        Ok(())
    }
}

impl SettingsRepository for MemoryStore {
    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.settings.get(key).cloned())
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
