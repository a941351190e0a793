use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schedules (
  id TEXT PRIMARY KEY,
  owner TEXT NOT NULL,
  label TEXT NOT NULL,
  recurrence_kind TEXT NOT NULL CHECK(recurrence_kind IN ('disabled','fixed','weekly','monthly','cron')),
  interval_seconds INTEGER,
  weekday TEXT,
  time TEXT,
  day_of_month INTEGER CHECK(day_of_month IS NULL OR day_of_month BETWEEN 1 AND 31),
  cron TEXT,
  components TEXT NOT NULL DEFAULT '[]',
  encrypt INTEGER NOT NULL DEFAULT 0,
  incremental INTEGER NOT NULL DEFAULT 0,
  include_patterns TEXT NOT NULL DEFAULT '[]',
  exclude_patterns TEXT NOT NULL DEFAULT '[]',
  post_checks TEXT NOT NULL DEFAULT '[]',
  secondary_destinations TEXT NOT NULL DEFAULT '[]',
  enabled INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL,
  version INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_schedules_owner ON schedules(owner);

-- Tasks outlive their schedule, so schedule_id carries no foreign key.
CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  owner TEXT NOT NULL,
  schedule_id TEXT,
  kind TEXT NOT NULL CHECK(kind IN ('backup','restore')),
  state TEXT NOT NULL CHECK(state IN ('queued','running','completed','failed','cancelled')),
  progress REAL NOT NULL DEFAULT 0,
  status_text TEXT NOT NULL DEFAULT '',
  started_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  scheduled_for TEXT,
  cancel_requested INTEGER NOT NULL DEFAULT 0,
  data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_schedule_id ON tasks(schedule_id, state);
CREATE INDEX IF NOT EXISTS idx_tasks_started_at ON tasks(started_at DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state, started_at);

CREATE TABLE IF NOT EXISTS locks (
  key TEXT PRIMARY KEY,
  holder TEXT NOT NULL,
  heartbeat_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trigger_state (
  event TEXT PRIMARY KEY,
  data TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::debug!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::debug!("[DB] Migration complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_memory_pool;

    #[test]
    fn test_migrate_is_idempotent() {
        let pool = create_memory_pool().unwrap();
        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        for table in ["schedules", "tasks", "locks", "trigger_state", "settings"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
