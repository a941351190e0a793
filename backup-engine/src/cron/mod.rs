//! Cron expression parsing and evaluation.
//!
//! Supports standard 5-field cron expressions:
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31, L, L-n, nW, LW)
//! │ │ │ ┌───────────── month (1-12 or JAN-DEC)
//! │ │ │ │ ┌───────────── day of week (0-7 or SUN-SAT, 7 = Sunday, dL, d#k)
//! │ │ │ │ │
//! * * * * *
//! ```
//!
//! Expressions are evaluated against a fixed UTC offset (the installation's
//! reference time). When both day fields are restricted a day matches if
//! either of them does, as in POSIX cron.

mod field;

pub use field::{CronField, DayOfMonthMarkers, DayOfWeekMarkers};

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use field::{parse_field, FieldKind};

/// Longest stretch of calendar days searched for a match (four years covers
/// every leap-year and weekday alignment).
pub const MAX_SEARCH_DAYS: i64 = 4 * 366;

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];

fn field_name(index: &usize) -> &'static str {
    FIELD_NAMES.get(*index).copied().unwrap_or("unknown")
}

/// Errors that can occur when parsing cron expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("unsupported character '{0}'")]
    UnsupportedCharacter(char),

    #[error("value {1} is out of range for the {name} field", name = field_name(.0))]
    FieldOutOfRange(usize, u32),

    #[error("invalid step '{step}' in the {name} field (must be between 1 and the field maximum)", name = field_name(.field))]
    InvalidStep { field: usize, step: String },

    #[error("unknown token '{token}' in the {name} field", name = field_name(.field))]
    UnknownToken { field: usize, token: String },

    #[error("invalid {name} field: {reason}", name = field_name(.field))]
    InvalidSyntax { field: usize, reason: String },
}

impl CronParseError {
    /// Index of the offending field, when the error is tied to one.
    pub fn field_index(&self) -> Option<usize> {
        match self {
            CronParseError::FieldCount(_) | CronParseError::UnsupportedCharacter(_) => None,
            CronParseError::FieldOutOfRange(field, _) => Some(*field),
            CronParseError::InvalidStep { field, .. }
            | CronParseError::UnknownToken { field, .. }
            | CronParseError::InvalidSyntax { field, .. } => Some(*field),
        }
    }
}

/// Evaluation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronEvalError {
    #[error("no occurrence of '{0}' within {days} days", days = MAX_SEARCH_DAYS)]
    Unsatisfiable(String),
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpression {
    source: String,
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    /// Weekday values normalised to 0-6, Sunday = 0.
    pub day_of_week: CronField,
    pub dom_markers: DayOfMonthMarkers,
    pub dow_markers: DayOfWeekMarkers,
}

impl CronExpression {
    /// Parse a cron expression string.
    pub fn parse(text: &str) -> Result<Self, CronParseError> {
        if let Some(c) = text.chars().find(|c| !field::is_supported_char(*c)) {
            return Err(CronParseError::UnsupportedCharacter(c));
        }

        let parts: Vec<&str> = text.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronParseError::FieldCount(parts.len()));
        }

        let mut fields = Vec::with_capacity(5);
        for (kind, part) in FieldKind::ALL.iter().zip(&parts) {
            fields.push(parse_field(*kind, part)?);
        }
        let [minute, hour, dom, month, dow]: [_; 5] = fields
            .try_into()
            .map_err(|_| CronParseError::FieldCount(parts.len()))?;

        Ok(Self {
            source: parts.join(" "),
            minute: CronField { values: minute.values, restricted: minute.restricted },
            hour: CronField { values: hour.values, restricted: hour.restricted },
            day_of_month: CronField { values: dom.values, restricted: dom.restricted },
            month: CronField { values: month.values, restricted: month.restricted },
            day_of_week: CronField { values: dow.values, restricted: dow.restricted },
            dom_markers: dom.dom_markers,
            dow_markers: dow.dow_markers,
        })
    }

    /// The normalised source text (fields joined by single spaces).
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether a calendar date satisfies the day-of-month, month and
    /// day-of-week fields.
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.month.contains(date.month()) {
            return false;
        }
        let dom_restricted = self.day_of_month.restricted;
        let dow_restricted = self.day_of_week.restricted;
        match (dom_restricted, dow_restricted) {
            (true, true) => self.day_of_month_matches(date) || self.day_of_week_matches(date),
            (true, false) => self.day_of_month_matches(date),
            (false, true) => self.day_of_week_matches(date),
            (false, false) => true,
        }
    }

    /// Check whether an instant matches, in the given reference offset.
    pub fn matches(&self, instant: DateTime<Utc>, offset: FixedOffset) -> bool {
        let local = instant.with_timezone(&offset);
        self.minute.contains(local.minute())
            && self.hour.contains(local.hour())
            && self.matches_date(local.date_naive())
    }

    /// Smallest minute-aligned instant strictly after `after`, in UTC.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronEvalError> {
        self.next_occurrence_in(after, utc_offset())
    }

    /// Smallest minute-aligned instant strictly after `after`, matching the
    /// fields read in the `offset` reference time.
    pub fn next_occurrence_in(
        &self,
        after: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Result<DateTime<Utc>, CronEvalError> {
        let local = after.with_timezone(&offset).naive_local();
        let floor = local
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(local);
        let start = floor + Duration::minutes(1);

        let first_day = start.date();
        let mut date = first_day;
        for _ in 0..=MAX_SEARCH_DAYS {
            if self.matches_date(date) {
                let (from_hour, from_minute) = if date == first_day {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                for &hour in self.hour.values.range(from_hour..) {
                    let min_minute = if date == first_day && hour == from_hour {
                        from_minute
                    } else {
                        0
                    };
                    if let Some(&minute) = self.minute.values.range(min_minute..).next() {
                        if let Some(found) = date
                            .and_hms_opt(hour, minute, 0)
                            .and_then(|naive| offset.from_local_datetime(&naive).single())
                        {
                            return Ok(found.with_timezone(&Utc));
                        }
                    }
                }
            }
            date = match date.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }

        Err(CronEvalError::Unsatisfiable(self.source.clone()))
    }

    /// Lazily yield up to `n` consecutive occurrences after `after`.
    pub fn next_n_occurrences(
        &self,
        after: DateTime<Utc>,
        n: usize,
        offset: FixedOffset,
    ) -> Occurrences<'_> {
        Occurrences {
            expr: self,
            cursor: after,
            remaining: n,
            offset,
        }
    }

    fn day_of_month_matches(&self, date: NaiveDate) -> bool {
        let day = date.day();
        if self.day_of_month.contains(day) {
            return true;
        }
        let last = days_in_month(date.year(), date.month());
        let markers = &self.dom_markers;
        if markers
            .last_day_offsets
            .iter()
            .any(|offset| last.checked_sub(*offset) == Some(day))
        {
            return true;
        }
        if markers
            .nearest_weekday
            .iter()
            .any(|target| nearest_weekday(date.year(), date.month(), *target) == Some(day))
        {
            return true;
        }
        markers.last_weekday && last_weekday_of_month(date.year(), date.month()) == Some(day)
    }

    fn day_of_week_matches(&self, date: NaiveDate) -> bool {
        let weekday = date.weekday().num_days_from_sunday();
        if self.day_of_week.contains(weekday) {
            return true;
        }
        let day = date.day();
        let markers = &self.dow_markers;
        if markers.last_in_month.contains(&weekday)
            && day + 7 > days_in_month(date.year(), date.month())
        {
            return true;
        }
        markers.nth_in_month.contains(&(weekday, (day - 1) / 7 + 1))
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpression::parse(s)
    }
}

impl TryFrom<String> for CronExpression {
    type Error = CronParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CronExpression::parse(&value)
    }
}

impl From<CronExpression> for String {
    fn from(expr: CronExpression) -> Self {
        expr.source
    }
}

/// Iterator over successive occurrences; ends after `n` items or when the
/// expression cannot be satisfied any more.
#[derive(Debug, Clone)]
pub struct Occurrences<'a> {
    expr: &'a CronExpression,
    cursor: DateTime<Utc>,
    remaining: usize,
    offset: FixedOffset,
}

impl Iterator for Occurrences<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.expr.next_occurrence_in(self.cursor, self.offset) {
            Ok(next) => {
                self.remaining -= 1;
                self.cursor = next;
                Some(next)
            }
            Err(_) => {
                self.remaining = 0;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

/// Structured answer of the validate/preview call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronPreviewError {
    /// Human-readable reason.
    pub reason: String,
    /// Name of the offending field, if any.
    pub field: Option<String>,
}

/// Validate `text` and list its next `count` occurrences after `after`.
pub fn preview(
    text: &str,
    after: DateTime<Utc>,
    count: usize,
    offset: FixedOffset,
) -> Result<Vec<DateTime<Utc>>, CronPreviewError> {
    let expr = CronExpression::parse(text).map_err(|e| CronPreviewError {
        field: e.field_index().map(|i| field_name(&i).to_string()),
        reason: e.to_string(),
    })?;

    // The first lookup distinguishes "never fires" from "fires fewer times".
    expr.next_occurrence_in(after, offset).map_err(|e| CronPreviewError {
        reason: e.to_string(),
        field: None,
    })?;

    Ok(expr.next_n_occurrences(after, count, offset).collect())
}

pub fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// Number of days in the given month.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Weekday (Mon-Fri) closest to `target` without leaving the month.
fn nearest_weekday(year: i32, month: u32, target: u32) -> Option<u32> {
    let last = days_in_month(year, month);
    if target > last {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year, month, target)?;
    let day = match date.weekday().num_days_from_sunday() {
        6 if target == 1 => 3,
        6 => target - 1,
        0 if target == last => target - 2,
        0 => target + 1,
        _ => target,
    };
    Some(day)
}

fn last_weekday_of_month(year: i32, month: u32) -> Option<u32> {
    let last = days_in_month(year, month);
    let date = NaiveDate::from_ymd_opt(year, month, last)?;
    Some(match date.weekday().num_days_from_sunday() {
        6 => last - 1,
        0 => last - 2,
        _ => last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_wildcard() {
        let expr = CronExpression::parse("* * * * *").unwrap();
        assert_eq!(expr.minute.values.len(), 60);
        assert_eq!(expr.hour.values.len(), 24);
        assert_eq!(expr.day_of_week.values.len(), 7);
    }

    #[test]
    fn test_field_count_mismatch() {
        let err = CronExpression::parse("* * * *").unwrap_err();
        assert_eq!(err, CronParseError::FieldCount(4));
        assert!(err.to_string().contains("expected 5 fields"));
        assert_eq!(
            CronExpression::parse("* * * * * *").unwrap_err(),
            CronParseError::FieldCount(6)
        );
    }

    #[test]
    fn test_unsupported_character() {
        assert_eq!(
            CronExpression::parse("0 0 * * 1%2").unwrap_err(),
            CronParseError::UnsupportedCharacter('%')
        );
        assert_eq!(
            CronExpression::parse("@daily").unwrap_err(),
            CronParseError::UnsupportedCharacter('@')
        );
        assert_eq!(
            CronExpression::parse("x * * * *").unwrap_err(),
            CronParseError::UnsupportedCharacter('x')
        );
    }

    #[test]
    fn test_out_of_range_reports_field_index() {
        assert_eq!(
            CronExpression::parse("60 * * * *").unwrap_err(),
            CronParseError::FieldOutOfRange(0, 60)
        );
        assert_eq!(
            CronExpression::parse("0 0 0 * *").unwrap_err(),
            CronParseError::FieldOutOfRange(2, 0)
        );
        assert_eq!(
            CronExpression::parse("0 0 * * 8").unwrap_err(),
            CronParseError::FieldOutOfRange(4, 8)
        );
    }

    #[test]
    fn test_next_is_strictly_later_and_matches() {
        let exprs = ["* * * * *", "0 * * * *", "30 4 * * 1-5", "15 10 1,15 * *", "0 0 L * *"];
        let after = utc(2024, 2, 27, 23, 59);
        for text in exprs {
            let expr = CronExpression::parse(text).unwrap();
            let mut cursor = after;
            for next in expr.next_n_occurrences(after, 20, utc_offset()) {
                assert!(next > cursor, "{text}: {next} not after {cursor}");
                assert!(expr.matches(next, utc_offset()), "{text}: {next} does not match");
                cursor = next;
            }
        }
    }

    #[test]
    fn test_every_five_minutes() {
        let expr = CronExpression::parse("*/5 * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 14, 32, 17).unwrap();
        let all: Vec<_> = expr.next_n_occurrences(start, 50, utc_offset()).collect();
        assert_eq!(all.len(), 50);
        assert_eq!(all[0], utc(2024, 1, 15, 14, 35));
        assert!(all.iter().all(|t| t.minute() % 5 == 0 && t.second() == 0));
    }

    #[test]
    fn test_exact_match_is_skipped() {
        let expr = CronExpression::parse("0 3 * * *").unwrap();
        let next = expr.next_occurrence(utc(2024, 1, 15, 3, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 16, 3, 0));
    }

    #[test]
    fn test_posix_day_or_rule() {
        // 13th of the month OR any Friday.
        let expr = CronExpression::parse("0 0 13 * 5").unwrap();
        // 2024-01-01 is a Monday; first Friday is the 5th.
        assert_eq!(expr.next_occurrence(utc(2024, 1, 1, 0, 0)).unwrap(), utc(2024, 1, 5, 0, 0));
        assert_eq!(expr.next_occurrence(utc(2024, 1, 12, 0, 0)).unwrap(), utc(2024, 1, 13, 0, 0));

        // Wildcard weekday: only the day of month counts.
        let dom_only = CronExpression::parse("0 0 13 * *").unwrap();
        assert_eq!(
            dom_only.next_occurrence(utc(2024, 1, 1, 0, 0)).unwrap(),
            utc(2024, 1, 13, 0, 0)
        );
    }

    #[test]
    fn test_unsatisfiable() {
        let expr = CronExpression::parse("0 0 30 2 *").unwrap();
        assert!(matches!(
            expr.next_occurrence(utc(2024, 1, 1, 0, 0)),
            Err(CronEvalError::Unsatisfiable(_))
        ));
    }

    #[test]
    fn test_leap_day() {
        let expr = CronExpression::parse("0 12 29 2 *").unwrap();
        assert_eq!(expr.next_occurrence(utc(2025, 3, 1, 0, 0)).unwrap(), utc(2028, 2, 29, 12, 0));
    }

    #[test]
    fn test_last_day_and_nth_weekday() {
        let last = CronExpression::parse("0 0 L * *").unwrap();
        assert_eq!(last.next_occurrence(utc(2023, 2, 1, 0, 0)).unwrap(), utc(2023, 2, 28, 0, 0));

        // Second Monday of March 2024 is the 11th.
        let nth = CronExpression::parse("0 9 ? * MON#2").unwrap();
        assert_eq!(nth.next_occurrence(utc(2024, 3, 1, 0, 0)).unwrap(), utc(2024, 3, 11, 9, 0));

        // Last Friday of March 2024 is the 29th.
        let last_fri = CronExpression::parse("0 9 ? * 5L").unwrap();
        assert_eq!(last_fri.next_occurrence(utc(2024, 3, 1, 0, 0)).unwrap(), utc(2024, 3, 29, 9, 0));
    }

    #[test]
    fn test_nearest_weekday() {
        // 2024-06-15 is a Saturday; nearest weekday is Friday the 14th.
        let expr = CronExpression::parse("0 0 15W * *").unwrap();
        assert_eq!(expr.next_occurrence(utc(2024, 6, 1, 0, 0)).unwrap(), utc(2024, 6, 14, 0, 0));
        // 2024-06-01 is a Saturday; 1W must not cross into May.
        let first = CronExpression::parse("0 0 1W * *").unwrap();
        assert_eq!(first.next_occurrence(utc(2024, 5, 31, 1, 0)).unwrap(), utc(2024, 6, 3, 0, 0));
    }

    #[test]
    fn test_reference_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let expr = CronExpression::parse("0 22 * * *").unwrap();
        let next = expr.next_occurrence_in(utc(2024, 1, 1, 0, 0), offset).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 20, 0));
    }

    #[test]
    fn test_preview() {
        let after = utc(2024, 1, 1, 0, 0);
        let times = preview("0 6 * * *", after, 3, utc_offset()).unwrap();
        assert_eq!(times, vec![utc(2024, 1, 1, 6, 0), utc(2024, 1, 2, 6, 0), utc(2024, 1, 3, 6, 0)]);

        let err = preview("0 25 * * *", after, 3, utc_offset()).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("hour"));
        assert!(err.reason.contains("25"));

        let never = preview("0 0 31 4 *", after, 3, utc_offset()).unwrap_err();
        assert!(never.field.is_none());
    }

    #[test]
    fn test_serde_rejects_invalid() {
        let expr: CronExpression = serde_json::from_str("\"0  3 * * SUN\"").unwrap();
        assert_eq!(expr.as_str(), "0 3 * * SUN");
        assert_eq!(serde_json::to_string(&expr).unwrap(), "\"0 3 * * SUN\"");
        assert!(serde_json::from_str::<CronExpression>("\"* * * *\"").is_err());
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2024, 12), 31);
        assert_eq!(days_in_month(2024, 4), 30);
    }
}
