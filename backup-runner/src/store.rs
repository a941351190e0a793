//! SQLite implementation of the engine's persistence traits.

use backup_engine::schedule::{Schedule, ScheduleRecord};
use backup_engine::store::{LockStore, ScheduleStore, SettingsRepository, TaskStore, TriggerStore};
use backup_engine::task::{Task, TaskKind};
use backup_engine::trigger::TriggerState;
use backup_engine::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::ErrorCode;

use crate::db::DbPool;
use crate::models::{lock, schedule, settings, task, trigger_state};

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| EngineError::Storage(format!("database connection unavailable: {e}")))
    }
}

fn storage(err: anyhow::Error) -> EngineError {
    EngineError::Storage(format!("{err:#}"))
}

fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
    )
}

fn to_schedule(record: ScheduleRecord) -> Result<Schedule> {
    Schedule::try_from(record)
}

// ── Schedules ──

impl ScheduleStore for SqliteStore {
    fn list_schedules(&self, owner: Option<&str>) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        schedule::find_all(&conn, owner)
            .map_err(storage)?
            .into_iter()
            .map(to_schedule)
            .collect()
    }

    fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let conn = self.conn()?;
        schedule::find_by_id(&conn, id)
            .map_err(storage)?
            .map(to_schedule)
            .transpose()
    }

    fn insert_schedule(&self, item: &Schedule) -> Result<()> {
        let record = ScheduleRecord::try_from(item)?;
        let conn = self.conn()?;
        schedule::insert(&conn, &record).map_err(|e| {
            if is_constraint_violation(&e) {
                EngineError::Conflict(format!("schedule {} already exists", item.id))
            } else {
                storage(e)
            }
        })
    }

    fn update_schedule(&self, item: &Schedule) -> Result<Schedule> {
        let record = ScheduleRecord::try_from(item)?;
        let conn = self.conn()?;
        if !schedule::update(&conn, &record).map_err(storage)? {
            return match schedule::find_by_id(&conn, &item.id).map_err(storage)? {
                None => Err(EngineError::NotFound(format!("schedule {}", item.id))),
                Some(stored) => Err(EngineError::Conflict(format!(
                    "schedule {} is at version {}, not {}",
                    item.id, stored.version, item.version
                ))),
            };
        }
        schedule::find_by_id(&conn, &item.id)
            .map_err(storage)?
            .map(to_schedule)
            .transpose()?
            .ok_or_else(|| EngineError::NotFound(format!("schedule {}", item.id)))
    }

    fn set_schedule_enabled(&self, id: &str, enabled: bool) -> Result<Schedule> {
        let conn = self.conn()?;
        if !schedule::set_enabled(&conn, id, enabled).map_err(storage)? {
            return Err(EngineError::NotFound(format!("schedule {id}")));
        }
        schedule::find_by_id(&conn, id)
            .map_err(storage)?
            .map(to_schedule)
            .transpose()?
            .ok_or_else(|| EngineError::NotFound(format!("schedule {id}")))
    }

    fn delete_schedule(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        schedule::delete(&conn, id).map_err(storage)
    }
}

// ── Tasks ──

impl TaskStore for SqliteStore {
    fn insert_task(&self, item: &Task) -> Result<()> {
        let conn = self.conn()?;
        task::insert(&conn, item).map_err(|e| {
            if is_constraint_violation(&e) {
                EngineError::Conflict(format!("task {} already exists", item.id))
            } else {
                storage(e)
            }
        })
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        task::find_by_id(&conn, id).map_err(storage)
    }

    fn save_task(&self, item: &Task) -> Result<()> {
        let conn = self.conn()?;
        if task::save(&conn, item).map_err(storage)? {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("task {}", item.id)))
        }
    }

    fn mark_cancel_requested(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        task::mark_cancel_requested(&conn, id).map_err(storage)
    }

    fn latest_scheduled_for(&self, schedule_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        task::latest_scheduled_for(&conn, schedule_id).map_err(storage)
    }

    fn active_task_for_schedule(&self, schedule_id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        task::find_active_for_schedule(&conn, schedule_id).map_err(storage)
    }

    fn last_completed(&self, schedule_id: &str, kind: TaskKind) -> Result<Option<Task>> {
        let conn = self.conn()?;
        task::find_last_completed(&conn, schedule_id, kind).map_err(storage)
    }

    fn list_tasks(&self, owner: Option<&str>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        task::find_recent(&conn, owner, limit).map_err(storage)
    }

    fn list_active_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        task::find_active(&conn).map_err(storage)
    }
}

// ── Locks, triggers, settings ──

impl LockStore for SqliteStore {
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        let conn = self.conn()?;
        lock::try_acquire(&conn, key, holder, now, stale_after).map_err(storage)
    }

    fn heartbeat(&self, key: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        lock::heartbeat(&conn, key, holder, now).map_err(storage)
    }

    fn release(&self, key: &str, holder: &str) -> Result<()> {
        let conn = self.conn()?;
        lock::release(&conn, key, holder).map_err(storage)
    }
}

impl TriggerStore for SqliteStore {
    fn load_trigger_state(&self, event: &str) -> Result<Option<TriggerState>> {
        let conn = self.conn()?;
        trigger_state::find(&conn, event).map_err(storage)
    }

    fn save_trigger_state(&self, state: &TriggerState) -> Result<()> {
        let conn = self.conn()?;
        trigger_state::save(&conn, state).map_err(storage)
    }
}

impl SettingsRepository for SqliteStore {
    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        settings::get(&conn, key).map_err(storage)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        settings::set(&conn, key, value).map_err(storage)
    }
}
