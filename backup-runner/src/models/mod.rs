//! Row-level access to the runner database. Every function takes a plain
//! `&Connection`; [`crate::store::SqliteStore`] maps them onto the engine's
//! store traits.

pub mod lock;
pub mod schedule;
pub mod settings;
pub mod task;
pub mod trigger_state;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width UTC form so that text comparison in SQL orders chronologically.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(text: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{text}'"))
}
