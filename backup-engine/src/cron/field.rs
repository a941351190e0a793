//! Per-field parsing of cron expressions.

use std::collections::BTreeSet;

use super::CronParseError;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Letters that can appear in a valid expression: the name vocabularies plus
/// the `L` and `W` markers. Anything else is an unsupported character.
const NAME_LETTERS: &str = "ABCDEFGHIJLMNOPRSTUVWY";

/// Position of a field in the expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    pub(crate) const ALL: [FieldKind; 5] = [
        FieldKind::Minute,
        FieldKind::Hour,
        FieldKind::DayOfMonth,
        FieldKind::Month,
        FieldKind::DayOfWeek,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Raw bounds accepted in the text. Weekday 7 is folded to 0 afterwards.
    fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            FieldKind::DayOfWeek => (0, 7),
        }
    }

    fn lookup_name(self, token: &str) -> Option<u32> {
        let upper = token.to_ascii_uppercase();
        match self {
            FieldKind::Month => MONTH_NAMES
                .iter()
                .position(|n| *n == upper)
                .map(|i| i as u32 + 1),
            FieldKind::DayOfWeek => WEEKDAY_NAMES
                .iter()
                .position(|n| *n == upper)
                .map(|i| i as u32),
            _ => None,
        }
    }
}

pub(crate) fn is_supported_char(c: char) -> bool {
    c.is_ascii_digit()
        || c.is_whitespace()
        || matches!(c, '*' | ',' | '-' | '/' | '?' | '#')
        || NAME_LETTERS.contains(c.to_ascii_uppercase())
}

/// The plain value set of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    /// Sorted, deduplicated allowed values.
    pub values: BTreeSet<u32>,
    /// False when the field was written as `*` or `?` (possibly with a step).
    pub restricted: bool,
}

impl CronField {
    pub fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

/// `L`, `L-n`, `nW` and `LW` markers of the day-of-month field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayOfMonthMarkers {
    /// Offsets back from the last day of the month (`L` is offset 0).
    pub last_day_offsets: BTreeSet<u32>,
    /// Days whose nearest weekday matches (`15W`).
    pub nearest_weekday: BTreeSet<u32>,
    /// Last weekday (Mon-Fri) of the month (`LW`).
    pub last_weekday: bool,
}

impl DayOfMonthMarkers {
    pub fn is_empty(&self) -> bool {
        self.last_day_offsets.is_empty() && self.nearest_weekday.is_empty() && !self.last_weekday
    }
}

/// `dL` and `d#k` markers of the day-of-week field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayOfWeekMarkers {
    /// Weekdays that match only on their last occurrence in the month.
    pub last_in_month: BTreeSet<u32>,
    /// (weekday, k) pairs matching the k-th occurrence in the month.
    pub nth_in_month: BTreeSet<(u32, u32)>,
}

impl DayOfWeekMarkers {
    pub fn is_empty(&self) -> bool {
        self.last_in_month.is_empty() && self.nth_in_month.is_empty()
    }
}

/// Result of parsing a single field.
#[derive(Debug, Default)]
pub(crate) struct ParsedField {
    pub values: BTreeSet<u32>,
    pub restricted: bool,
    pub dom_markers: DayOfMonthMarkers,
    pub dow_markers: DayOfWeekMarkers,
}

pub(crate) fn parse_field(kind: FieldKind, text: &str) -> Result<ParsedField, CronParseError> {
    let mut parsed = ParsedField {
        restricted: !(text.starts_with('*') || text.starts_with('?')),
        ..ParsedField::default()
    };

    for item in text.split(',') {
        if item.is_empty() {
            return Err(syntax(kind, "empty list item"));
        }
        parse_item(kind, item, &mut parsed)?;
    }

    if kind == FieldKind::DayOfWeek && parsed.values.remove(&7) {
        parsed.values.insert(0);
    }

    Ok(parsed)
}

fn parse_item(kind: FieldKind, item: &str, out: &mut ParsedField) -> Result<(), CronParseError> {
    let upper = item.to_ascii_uppercase();

    if item.contains('#') {
        return parse_nth_weekday(kind, item, out);
    }
    if kind == FieldKind::DayOfMonth && upper.starts_with('L') {
        return parse_last_day(kind, &upper, out);
    }
    if kind == FieldKind::DayOfMonth && upper.ends_with('W') {
        let day = parse_value(kind, &item[..item.len() - 1])?;
        check_bounds(kind, day)?;
        out.dom_markers.nearest_weekday.insert(day);
        return Ok(());
    }
    if kind == FieldKind::DayOfWeek && upper.len() > 1 && upper.ends_with('L') {
        let weekday = parse_value(kind, &item[..item.len() - 1])?;
        check_bounds(kind, weekday)?;
        out.dow_markers.last_in_month.insert(weekday % 7);
        return Ok(());
    }

    let (range_part, step) = match item.split_once('/') {
        Some((range, step_text)) => {
            let step = step_text
                .parse::<u32>()
                .ok()
                .filter(|s| *s >= 1 && *s <= kind.bounds().1)
                .ok_or_else(|| CronParseError::InvalidStep {
                    field: kind.index(),
                    step: step_text.to_string(),
                })?;
            (range, Some(step))
        }
        None => (item, None),
    };

    let (min, max) = kind.bounds();
    let (start, end) = if range_part == "*" || range_part == "?" {
        if range_part == "?" && !matches!(kind, FieldKind::DayOfMonth | FieldKind::DayOfWeek) {
            return Err(syntax(kind, "'?' is only valid for day-of-month and day-of-week"));
        }
        // `*` over the weekday domain means 0-6; 7 would only duplicate Sunday.
        let upper_bound = if kind == FieldKind::DayOfWeek { 6 } else { max };
        (min, upper_bound)
    } else if let Some((a, b)) = range_part.split_once('-') {
        let start = parse_value(kind, a)?;
        let end = parse_value(kind, b)?;
        check_bounds(kind, start)?;
        check_bounds(kind, end)?;
        if start > end {
            return Err(syntax(kind, &format!("range {start}-{end} runs backwards")));
        }
        (start, end)
    } else {
        let value = parse_value(kind, range_part)?;
        check_bounds(kind, value)?;
        match step {
            Some(_) => (value, max),
            None => (value, value),
        }
    };

    let step = step.unwrap_or(1);
    let mut value = start;
    while value <= end {
        out.values.insert(value);
        value = match value.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(())
}

fn parse_last_day(kind: FieldKind, upper: &str, out: &mut ParsedField) -> Result<(), CronParseError> {
    match upper {
        "L" => {
            out.dom_markers.last_day_offsets.insert(0);
        }
        "LW" => out.dom_markers.last_weekday = true,
        _ => {
            let offset_text = upper
                .strip_prefix("L-")
                .ok_or_else(|| syntax(kind, &format!("malformed last-day marker '{upper}'")))?;
            let offset = parse_value(kind, offset_text)?;
            if offset > 30 {
                return Err(CronParseError::FieldOutOfRange(kind.index(), offset));
            }
            out.dom_markers.last_day_offsets.insert(offset);
        }
    }
    Ok(())
}

fn parse_nth_weekday(kind: FieldKind, item: &str, out: &mut ParsedField) -> Result<(), CronParseError> {
    if kind != FieldKind::DayOfWeek {
        return Err(syntax(kind, "'#' is only valid for day-of-week"));
    }
    let (day_text, nth_text) = item
        .split_once('#')
        .ok_or_else(|| syntax(kind, "malformed '#' marker"))?;
    let weekday = parse_value(kind, day_text)?;
    check_bounds(kind, weekday)?;
    let nth = nth_text
        .parse::<u32>()
        .map_err(|_| syntax(kind, &format!("'{nth_text}' is not an occurrence number")))?;
    if !(1..=5).contains(&nth) {
        return Err(syntax(kind, "occurrence after '#' must be between 1 and 5"));
    }
    out.dow_markers.nth_in_month.insert((weekday % 7, nth));
    Ok(())
}

fn parse_value(kind: FieldKind, token: &str) -> Result<u32, CronParseError> {
    if token.is_empty() {
        return Err(syntax(kind, "missing value"));
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        // Digits that overflow u32 are certainly out of range.
        return Ok(token.parse::<u32>().unwrap_or(u32::MAX));
    }
    if token.chars().all(|c| c.is_ascii_alphabetic()) {
        return kind
            .lookup_name(token)
            .ok_or_else(|| CronParseError::UnknownToken {
                field: kind.index(),
                token: token.to_string(),
            });
    }
    Err(syntax(kind, &format!("'{token}' is not a value")))
}

fn check_bounds(kind: FieldKind, value: u32) -> Result<(), CronParseError> {
    let (min, max) = kind.bounds();
    if value < min || value > max {
        return Err(CronParseError::FieldOutOfRange(kind.index(), value));
    }
    Ok(())
}

fn syntax(kind: FieldKind, reason: &str) -> CronParseError {
    CronParseError::InvalidSyntax {
        field: kind.index(),
        reason: reason.to_string(),
    }
}
