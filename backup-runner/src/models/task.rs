use backup_engine::task::{Task, TaskKind};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_ts, parse_ts};

// ── Task ──
//
// The full task (plan, checkpoint, result) lives in the `data` JSON column.
// The other columns are copies used for filtering, except
// `cancel_requested`, which is authoritative: a save never clears it.

struct TaskRow {
    data: String,
    cancel_requested: bool,
}

impl TaskRow {
    fn into_task(self) -> anyhow::Result<Task> {
        let mut task: Task = serde_json::from_str(&self.data)?;
        task.cancel_requested |= self.cancel_requested;
        Ok(task)
    }
}

fn row_to_task(row: &Row) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        data: row.get("data")?,
        cancel_requested: row.get("cancel_requested")?,
    })
}

fn kind_str(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Backup => "backup",
        TaskKind::Restore => "restore",
    }
}

fn collect(rows: impl Iterator<Item = rusqlite::Result<TaskRow>>) -> anyhow::Result<Vec<Task>> {
    rows.map(|row| row.map_err(anyhow::Error::from).and_then(TaskRow::into_task))
        .collect()
}

pub fn insert(conn: &Connection, task: &Task) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO tasks (id, owner, schedule_id, kind, state, progress, status_text, started_at, updated_at,
                            scheduled_for, cancel_requested, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            task.id,
            task.owner,
            task.schedule_id,
            kind_str(task.kind),
            task.state.as_str(),
            task.progress,
            task.status_text,
            format_ts(task.started_at),
            format_ts(task.updated_at),
            task.scheduled_for.map(format_ts),
            task.cancel_requested,
            serde_json::to_string(task)?,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Task>> {
    conn.query_row(
        "SELECT data, cancel_requested FROM tasks WHERE id = ?",
        params![id],
        row_to_task,
    )
    .optional()?
    .map(TaskRow::into_task)
    .transpose()
}

/// Returns false when the task does not exist.
pub fn save(conn: &Connection, task: &Task) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE tasks SET state = ?1, progress = ?2, status_text = ?3, updated_at = ?4, scheduled_for = ?5,
                cancel_requested = MAX(cancel_requested, ?6), data = ?7
         WHERE id = ?8",
        params![
            task.state.as_str(),
            task.progress,
            task.status_text,
            format_ts(task.updated_at),
            task.scheduled_for.map(format_ts),
            task.cancel_requested,
            serde_json::to_string(task)?,
            task.id,
        ],
    )?;
    Ok(changes > 0)
}

pub fn mark_cancel_requested(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE tasks SET cancel_requested = 1 WHERE id = ?",
        params![id],
    )?;
    Ok(changes > 0)
}

pub fn latest_scheduled_for(conn: &Connection, schedule_id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
    let latest: Option<String> = conn.query_row(
        "SELECT MAX(scheduled_for) FROM tasks WHERE schedule_id = ?",
        params![schedule_id],
        |row| row.get(0),
    )?;
    latest.as_deref().map(parse_ts).transpose()
}

pub fn find_active_for_schedule(conn: &Connection, schedule_id: &str) -> anyhow::Result<Option<Task>> {
    conn.query_row(
        "SELECT data, cancel_requested FROM tasks
         WHERE schedule_id = ? AND state IN ('queued', 'running')
         ORDER BY started_at LIMIT 1",
        params![schedule_id],
        row_to_task,
    )
    .optional()?
    .map(TaskRow::into_task)
    .transpose()
}

pub fn find_last_completed(conn: &Connection, schedule_id: &str, kind: TaskKind) -> anyhow::Result<Option<Task>> {
    conn.query_row(
        "SELECT data, cancel_requested FROM tasks
         WHERE schedule_id = ?1 AND kind = ?2 AND state = 'completed'
         ORDER BY started_at DESC LIMIT 1",
        params![schedule_id, kind_str(kind)],
        row_to_task,
    )
    .optional()?
    .map(TaskRow::into_task)
    .transpose()
}

/// Newest first.
pub fn find_active(conn: &Connection) -> anyhow::Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT data, cancel_requested FROM tasks
         WHERE state IN ('queued', 'running')
         ORDER BY started_at, id",
    )?;
    let rows = stmt.query_map([], row_to_task)?;
    collect(rows)
}

pub fn find_recent(conn: &Connection, owner: Option<&str>, limit: usize) -> anyhow::Result<Vec<Task>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(
        "SELECT data, cancel_requested FROM tasks
         WHERE (?1 IS NULL OR owner = ?1)
         ORDER BY started_at DESC, id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![owner, limit], row_to_task)?;
    collect(rows)
}
