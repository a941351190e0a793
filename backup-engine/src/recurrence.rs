//! Recurrence rules attached to schedules.
//!
//! A [`RecurrenceSpec`] is evaluated in the installation's reference offset.
//! `Fixed` intervals are anchored at the schedule's creation instant; the
//! other variants are calendar based.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::cron::{days_in_month, CronEvalError, CronExpression, CronParseError, MAX_SEARCH_DAYS};

/// Shortest accepted fixed interval.
pub const MIN_INTERVAL_SECONDS: u64 = 60;

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrenceSpec {
    /// Never fires, whatever the schedule's `enabled` flag says.
    Disabled,
    Fixed { interval_seconds: u64 },
    Weekly { weekday: Weekday, time: NaiveTime },
    /// Days past the end of a short month fire on that month's last day.
    Monthly { day_of_month: u32, time: NaiveTime },
    Cron { expression: CronExpression },
}

impl RecurrenceSpec {
    pub fn is_disabled(&self) -> bool {
        matches!(self, RecurrenceSpec::Disabled)
    }

    /// Copy with `day_of_month` clamped to 1..=31.
    pub fn normalized(&self) -> Self {
        match self {
            RecurrenceSpec::Monthly { day_of_month, time } => RecurrenceSpec::Monthly {
                day_of_month: (*day_of_month).clamp(1, 31),
                time: *time,
            },
            other => other.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            RecurrenceSpec::Fixed { interval_seconds } if *interval_seconds < MIN_INTERVAL_SECONDS => {
                Err(format!(
                    "fixed interval must be at least {MIN_INTERVAL_SECONDS} seconds, got {interval_seconds}"
                ))
            }
            RecurrenceSpec::Fixed { interval_seconds } if *interval_seconds > i64::MAX as u64 / 1000 => {
                Err(format!("fixed interval {interval_seconds} is too large"))
            }
            RecurrenceSpec::Weekly { time, .. } | RecurrenceSpec::Monthly { time, .. }
                if time.second() != 0 || time.nanosecond() != 0 =>
            {
                Err(format!("time of day must be whole minutes, got {time}"))
            }
            _ => Ok(()),
        }
    }

    /// First occurrence strictly after `after`. `anchor` is the origin of
    /// fixed intervals. `Ok(None)` means the rule never fires.
    pub fn next_occurrence(
        &self,
        after: DateTime<Utc>,
        anchor: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Result<Option<DateTime<Utc>>, CronEvalError> {
        match self {
            RecurrenceSpec::Disabled => Ok(None),
            RecurrenceSpec::Fixed { interval_seconds } => {
                Ok(next_fixed(after, anchor, *interval_seconds))
            }
            RecurrenceSpec::Weekly { weekday, time } => {
                Ok(next_weekly(after, *weekday, *time, offset))
            }
            RecurrenceSpec::Monthly { day_of_month, time } => {
                Ok(next_monthly(after, *day_of_month, *time, offset))
            }
            RecurrenceSpec::Cron { expression } => {
                expression.next_occurrence_in(after, offset).map(Some)
            }
        }
    }

    /// All occurrences in `(from, until]`, at most `cap` of them.
    pub fn occurrences_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        anchor: DateTime<Utc>,
        offset: FixedOffset,
        cap: usize,
    ) -> Result<Vec<DateTime<Utc>>, CronEvalError> {
        let mut found = Vec::new();
        let mut cursor = from;
        while found.len() < cap {
            match self.next_occurrence(cursor, anchor, offset)? {
                Some(next) if next <= until => {
                    found.push(next);
                    cursor = next;
                }
                _ => break,
            }
        }
        Ok(found)
    }

    /// Latest occurrence in `(after, now]`, used to coalesce missed runs.
    pub fn latest_due(
        &self,
        after: DateTime<Utc>,
        now: DateTime<Utc>,
        anchor: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Result<Option<DateTime<Utc>>, CronEvalError> {
        if let RecurrenceSpec::Fixed { interval_seconds } = self {
            // Closed form; walking a one-minute interval over a long gap is wasteful.
            let first = match next_fixed(after, anchor, *interval_seconds) {
                Some(first) if first <= now => first,
                _ => return Ok(None),
            };
            let step = *interval_seconds as i64;
            let skipped = (now - first).num_seconds() / step;
            return Ok(Some(first + Duration::seconds(skipped * step)));
        }

        let mut latest = None;
        let mut cursor = after;
        while let Some(next) = self.next_occurrence(cursor, anchor, offset)? {
            if next > now {
                break;
            }
            latest = Some(next);
            cursor = next;
        }
        Ok(latest)
    }
}

fn next_fixed(after: DateTime<Utc>, anchor: DateTime<Utc>, interval_seconds: u64) -> Option<DateTime<Utc>> {
    if interval_seconds == 0 {
        return None;
    }
    let step = interval_seconds as i64;
    if after < anchor {
        return Some(anchor);
    }
    let elapsed = (after - anchor).num_seconds();
    let periods = elapsed / step + 1;
    Some(anchor + Duration::seconds(periods * step))
}

fn next_weekly(
    after: DateTime<Utc>,
    weekday: Weekday,
    time: NaiveTime,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    let local = after.with_timezone(&offset).date_naive();
    let ahead = (7 + weekday.num_days_from_monday() as i64
        - local.weekday().num_days_from_monday() as i64)
        % 7;
    let mut date = local + Duration::days(ahead);
    loop {
        let candidate = at_local(date, time, offset)?;
        if candidate > after {
            return Some(candidate);
        }
        date += Duration::days(7);
    }
}

fn next_monthly(
    after: DateTime<Utc>,
    day_of_month: u32,
    time: NaiveTime,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    let local = after.with_timezone(&offset).date_naive();
    let (mut year, mut month) = (local.year(), local.month());
    let wanted = day_of_month.clamp(1, 31);
    // Two months always suffice; the bound keeps the loop obviously finite.
    for _ in 0..(MAX_SEARCH_DAYS / 28) {
        let day = wanted.min(days_in_month(year, month));
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let candidate = at_local(date, time, offset)?;
        if candidate > after {
            return Some(candidate);
        }
        (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    }
    None
}

fn at_local(date: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Named recurrence presets offered by admin screens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortcut {
    Hourly,
    EveryHours(u32),
    Daily,
    Weekly,
    Fortnightly,
    Monthly,
}

impl Shortcut {
    /// Expand the preset. `at` supplies the minute (hourly) or time of day.
    pub fn into_recurrence(self, at: NaiveTime) -> Result<RecurrenceSpec, CronParseError> {
        use chrono::Timelike;
        let spec = match self {
            Shortcut::Hourly => RecurrenceSpec::Cron {
                expression: CronExpression::parse(&format!("{} * * * *", at.minute()))?,
            },
            Shortcut::EveryHours(hours) => RecurrenceSpec::Fixed {
                interval_seconds: u64::from(hours.max(1)) * 3600,
            },
            Shortcut::Daily => RecurrenceSpec::Cron {
                expression: CronExpression::parse(&format!("{} {} * * *", at.minute(), at.hour()))?,
            },
            Shortcut::Weekly => RecurrenceSpec::Weekly {
                weekday: Weekday::Sun,
                time: at,
            },
            Shortcut::Fortnightly => RecurrenceSpec::Fixed {
                interval_seconds: 14 * 86_400,
            },
            Shortcut::Monthly => RecurrenceSpec::Monthly {
                day_of_month: 1,
                time: at,
            },
        };
        Ok(spec)
    }
}

impl FromStr for Shortcut {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "hourly" => Ok(Shortcut::Hourly),
            "daily" => Ok(Shortcut::Daily),
            "weekly" => Ok(Shortcut::Weekly),
            "fortnightly" => Ok(Shortcut::Fortnightly),
            "monthly" => Ok(Shortcut::Monthly),
            other => other
                .strip_prefix("every")
                .and_then(|rest| rest.strip_suffix("hours"))
                .and_then(|n| n.trim_matches(|c| c == '_' || c == ' ').parse::<u32>().ok())
                .filter(|n| *n > 0)
                .map(Shortcut::EveryHours)
                .ok_or_else(|| format!("unknown recurrence shortcut '{s}'")),
        }
    }
}
