use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::format_ts;

/// Take `key` for `holder` in one statement: the upsert only overwrites a
/// row that `holder` already owns or whose heartbeat is at least
/// `stale_after` old.
pub fn try_acquire(
    conn: &Connection,
    key: &str,
    holder: &str,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> anyhow::Result<bool> {
    let previous: Option<String> = conn
        .query_row("SELECT holder FROM locks WHERE key = ?", params![key], |row| row.get(0))
        .optional()?;

    let stale_before = now.checked_sub_signed(stale_after).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let changes = conn.execute(
        "INSERT INTO locks (key, holder, heartbeat_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, heartbeat_at = excluded.heartbeat_at
         WHERE locks.holder = excluded.holder OR locks.heartbeat_at <= ?4",
        params![key, holder, format_ts(now), format_ts(stale_before)],
    )?;

    let acquired = changes > 0;
    if acquired {
        if let Some(previous) = previous.filter(|p| p != holder) {
            tracing::warn!(key, previous = %previous, "Reclaiming stale lock");
        }
    }
    Ok(acquired)
}

pub fn heartbeat(conn: &Connection, key: &str, holder: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE locks SET heartbeat_at = ?1 WHERE key = ?2 AND holder = ?3",
        params![format_ts(now), key, holder],
    )?;
    Ok(changes > 0)
}

pub fn release(conn: &Connection, key: &str, holder: &str) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM locks WHERE key = ?1 AND holder = ?2",
        params![key, holder],
    )?;
    Ok(())
}
