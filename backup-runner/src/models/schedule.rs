use backup_engine::schedule::ScheduleRecord;
use rusqlite::{params, Connection, OptionalExtension, Row};

// ── Schedule ──

fn row_to_record(row: &Row) -> rusqlite::Result<ScheduleRecord> {
    Ok(ScheduleRecord {
        id: row.get("id")?,
        owner: row.get("owner")?,
        label: row.get("label")?,
        recurrence_kind: row.get("recurrence_kind")?,
        interval_seconds: row.get("interval_seconds")?,
        weekday: row.get("weekday")?,
        time: row.get("time")?,
        day_of_month: row.get("day_of_month")?,
        cron: row.get("cron")?,
        components: row.get("components")?,
        encrypt: row.get("encrypt")?,
        incremental: row.get("incremental")?,
        include_patterns: row.get("include_patterns")?,
        exclude_patterns: row.get("exclude_patterns")?,
        post_checks: row.get("post_checks")?,
        secondary_destinations: row.get("secondary_destinations")?,
        enabled: row.get("enabled")?,
        created_at: row.get("created_at")?,
        version: row.get("version")?,
    })
}

pub fn find_all(conn: &Connection, owner: Option<&str>) -> anyhow::Result<Vec<ScheduleRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM schedules WHERE (?1 IS NULL OR owner = ?1) ORDER BY created_at, id",
    )?;
    let rows = stmt.query_map(params![owner], row_to_record)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<ScheduleRecord>> {
    let record = conn
        .query_row("SELECT * FROM schedules WHERE id = ?", params![id], row_to_record)
        .optional()?;
    Ok(record)
}

pub fn insert(conn: &Connection, record: &ScheduleRecord) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO schedules (id, owner, label, recurrence_kind, interval_seconds, weekday, time, day_of_month, cron,
                                components, encrypt, incremental, include_patterns, exclude_patterns, post_checks,
                                secondary_destinations, enabled, created_at, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            record.id,
            record.owner,
            record.label,
            record.recurrence_kind,
            record.interval_seconds,
            record.weekday,
            record.time,
            record.day_of_month,
            record.cron,
            record.components,
            record.encrypt,
            record.incremental,
            record.include_patterns,
            record.exclude_patterns,
            record.post_checks,
            record.secondary_destinations,
            record.enabled,
            record.created_at,
            record.version,
        ],
    )?;
    Ok(())
}

/// Replace the mutable columns when the stored version still equals
/// `record.version`; the stored version is bumped. Returns whether a row
/// was written.
pub fn update(conn: &Connection, record: &ScheduleRecord) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE schedules SET label = ?1, recurrence_kind = ?2, interval_seconds = ?3, weekday = ?4, time = ?5,
                day_of_month = ?6, cron = ?7, components = ?8, encrypt = ?9, incremental = ?10,
                include_patterns = ?11, exclude_patterns = ?12, post_checks = ?13, secondary_destinations = ?14,
                enabled = ?15, version = version + 1
         WHERE id = ?16 AND version = ?17",
        params![
            record.label,
            record.recurrence_kind,
            record.interval_seconds,
            record.weekday,
            record.time,
            record.day_of_month,
            record.cron,
            record.components,
            record.encrypt,
            record.incremental,
            record.include_patterns,
            record.exclude_patterns,
            record.post_checks,
            record.secondary_destinations,
            record.enabled,
            record.id,
            record.version,
        ],
    )?;
    Ok(changes > 0)
}

pub fn set_enabled(conn: &Connection, id: &str, enabled: bool) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE schedules SET enabled = ?1, version = version + 1 WHERE id = ?2",
        params![enabled, id],
    )?;
    Ok(changes > 0)
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM schedules WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
