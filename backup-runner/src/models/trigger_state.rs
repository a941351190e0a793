use backup_engine::trigger::TriggerState;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::format_ts;

/// The whole state is one JSON document per event.
pub fn find(conn: &Connection, event: &str) -> anyhow::Result<Option<TriggerState>> {
    let data: Option<String> = conn
        .query_row("SELECT data FROM trigger_state WHERE event = ?", params![event], |row| row.get(0))
        .optional()?;
    data.map(|json| serde_json::from_str(&json).map_err(anyhow::Error::from))
        .transpose()
}

pub fn save(conn: &Connection, state: &TriggerState) -> anyhow::Result<()> {
    let data = serde_json::to_string(state)?;
    conn.execute(
        "INSERT INTO trigger_state (event, data, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(event) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        params![state.event, data, format_ts(Utc::now())],
    )?;
    Ok(())
}
