//! Schedule entities and their flat persistence shape.

use chrono::{DateTime, FixedOffset, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::cron::{CronEvalError, CronExpression};
use crate::recurrence::RecurrenceSpec;
use crate::utils::{EngineError, Result};

pub type ScheduleId = String;
pub type DestinationId = String;

const MAX_LABEL_LEN: usize = 200;

/// A part of the managed content store that can be backed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Database,
    Plugins,
    Themes,
    Uploads,
    Others,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Database,
        ComponentKind::Plugins,
        ComponentKind::Themes,
        ComponentKind::Uploads,
        ComponentKind::Others,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Database => "database",
            ComponentKind::Plugins => "plugins",
            ComponentKind::Themes => "themes",
            ComponentKind::Uploads => "uploads",
            ComponentKind::Others => "others",
        }
    }

    /// Subdirectory of the content root holding this component's files.
    /// The database has none; it is produced by a dump.
    pub fn dir_name(&self) -> Option<&'static str> {
        match self {
            ComponentKind::Database => None,
            other => Some(other.as_str()),
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        ComponentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::Validation(format!("unknown component '{s}'")))
    }
}

/// Verification run after an archive is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostCheckKind {
    /// Re-read every tar entry of the compressed archive.
    VerifyArchive,
    /// Re-read the embedded manifest and compare it with the schedule.
    VerifyManifest,
}

impl PostCheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostCheckKind::VerifyArchive => "verify_archive",
            PostCheckKind::VerifyManifest => "verify_manifest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub owner: String,
    pub label: String,
    pub recurrence: RecurrenceSpec,
    pub selected_components: BTreeSet<ComponentKind>,
    pub encrypt: bool,
    pub incremental: bool,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub post_checks: BTreeSet<PostCheckKind>,
    pub secondary_destinations: Vec<DestinationId>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Schedule {
    /// Whether the schedule can produce occurrences at all.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.recurrence.is_disabled()
    }

    pub fn next_occurrence(
        &self,
        after: DateTime<Utc>,
        offset: FixedOffset,
    ) -> std::result::Result<Option<DateTime<Utc>>, CronEvalError> {
        if !self.is_active() {
            return Ok(None);
        }
        self.recurrence.next_occurrence(after, self.created_at, offset)
    }

    pub fn includes(&self, kind: ComponentKind) -> bool {
        self.selected_components.contains(&kind)
    }
}

/// Input for creating or replacing a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub owner: String,
    pub label: String,
    pub recurrence: RecurrenceSpec,
    pub selected_components: BTreeSet<ComponentKind>,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub post_checks: BTreeSet<PostCheckKind>,
    #[serde(default)]
    pub secondary_destinations: Vec<DestinationId>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewSchedule {
    pub fn new(owner: &str, label: &str, recurrence: RecurrenceSpec) -> Self {
        Self {
            owner: owner.to_string(),
            label: label.to_string(),
            recurrence,
            selected_components: ComponentKind::ALL.into_iter().collect(),
            encrypt: false,
            incremental: false,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            post_checks: BTreeSet::new(),
            secondary_destinations: Vec::new(),
            enabled: true,
        }
    }

    /// Reject anything that must never reach the store.
    pub fn validate(&self) -> Result<()> {
        let label = self.label.trim();
        if label.is_empty() {
            return Err(EngineError::Validation("label must not be empty".into()));
        }
        if label.chars().count() > MAX_LABEL_LEN {
            return Err(EngineError::Validation(format!(
                "label exceeds {MAX_LABEL_LEN} characters"
            )));
        }
        if self.owner.trim().is_empty() {
            return Err(EngineError::Validation("owner must not be empty".into()));
        }
        if self.selected_components.is_empty() {
            return Err(EngineError::Validation(
                "at least one component must be selected".into(),
            ));
        }
        self.recurrence.validate().map_err(EngineError::Validation)?;
        for pattern in self.include_patterns.iter().chain(&self.exclude_patterns) {
            glob::Pattern::new(pattern).map_err(|e| {
                EngineError::Validation(format!("invalid pattern '{pattern}': {e}"))
            })?;
        }
        if let Some(blank) = self.secondary_destinations.iter().find(|d| d.trim().is_empty()) {
            return Err(EngineError::Validation(format!(
                "invalid destination id '{blank}'"
            )));
        }
        Ok(())
    }

    pub fn into_schedule(self, id: ScheduleId, created_at: DateTime<Utc>) -> Result<Schedule> {
        self.validate()?;
        Ok(Schedule {
            id,
            owner: self.owner,
            label: self.label.trim().to_string(),
            recurrence: self.recurrence.normalized(),
            selected_components: self.selected_components,
            encrypt: self.encrypt,
            incremental: self.incremental,
            include_patterns: self.include_patterns,
            exclude_patterns: self.exclude_patterns,
            post_checks: self.post_checks,
            secondary_destinations: self.secondary_destinations,
            enabled: self.enabled,
            created_at,
            version: 1,
        })
    }

    /// Apply this input over an existing schedule, keeping identity fields.
    pub fn apply_to(self, existing: &Schedule) -> Result<Schedule> {
        let mut updated = self.into_schedule(existing.id.clone(), existing.created_at)?;
        updated.owner = existing.owner.clone();
        updated.version = existing.version;
        Ok(updated)
    }
}

/// Flat record used by row-oriented stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: String,
    pub owner: String,
    pub label: String,
    pub recurrence_kind: String,
    pub interval_seconds: Option<i64>,
    pub weekday: Option<String>,
    pub time: Option<String>,
    pub day_of_month: Option<u32>,
    pub cron: Option<String>,
    /// JSON array of component names.
    pub components: String,
    pub encrypt: bool,
    pub incremental: bool,
    pub include_patterns: String,
    pub exclude_patterns: String,
    pub post_checks: String,
    pub secondary_destinations: String,
    pub enabled: bool,
    pub created_at: String,
    pub version: i64,
}

const TIME_FORMAT: &str = "%H:%M";

impl TryFrom<&Schedule> for ScheduleRecord {
    type Error = EngineError;

    fn try_from(schedule: &Schedule) -> Result<Self> {
        let mut record = ScheduleRecord {
            id: schedule.id.clone(),
            owner: schedule.owner.clone(),
            label: schedule.label.clone(),
            recurrence_kind: String::new(),
            interval_seconds: None,
            weekday: None,
            time: None,
            day_of_month: None,
            cron: None,
            components: serde_json::to_string(&schedule.selected_components)?,
            encrypt: schedule.encrypt,
            incremental: schedule.incremental,
            include_patterns: serde_json::to_string(&schedule.include_patterns)?,
            exclude_patterns: serde_json::to_string(&schedule.exclude_patterns)?,
            post_checks: serde_json::to_string(&schedule.post_checks)?,
            secondary_destinations: serde_json::to_string(&schedule.secondary_destinations)?,
            enabled: schedule.enabled,
            created_at: schedule.created_at.to_rfc3339(),
            version: schedule.version as i64,
        };

        match &schedule.recurrence {
            RecurrenceSpec::Disabled => record.recurrence_kind = "disabled".into(),
            RecurrenceSpec::Fixed { interval_seconds } => {
                record.recurrence_kind = "fixed".into();
                record.interval_seconds = Some(*interval_seconds as i64);
            }
            RecurrenceSpec::Weekly { weekday, time } => {
                record.recurrence_kind = "weekly".into();
                record.weekday = Some(weekday.to_string());
                record.time = Some(format_time(*time));
            }
            RecurrenceSpec::Monthly { day_of_month, time } => {
                record.recurrence_kind = "monthly".into();
                record.day_of_month = Some((*day_of_month).clamp(1, 31));
                record.time = Some(format_time(*time));
            }
            RecurrenceSpec::Cron { expression } => {
                record.recurrence_kind = "cron".into();
                record.cron = Some(expression.to_string());
            }
        }
        Ok(record)
    }
}

impl TryFrom<ScheduleRecord> for Schedule {
    type Error = EngineError;

    fn try_from(record: ScheduleRecord) -> Result<Self> {
        let recurrence = match record.recurrence_kind.as_str() {
            "disabled" => RecurrenceSpec::Disabled,
            "fixed" => RecurrenceSpec::Fixed {
                interval_seconds: required(record.interval_seconds, "interval_seconds")?
                    .try_into()
                    .map_err(|_| EngineError::Storage("negative interval_seconds".into()))?,
            },
            "weekly" => RecurrenceSpec::Weekly {
                weekday: required(record.weekday.as_deref(), "weekday")?
                    .parse::<Weekday>()
                    .map_err(|_| EngineError::Storage("invalid weekday".into()))?,
                time: parse_time(record.time.as_deref())?,
            },
            "monthly" => RecurrenceSpec::Monthly {
                day_of_month: required(record.day_of_month, "day_of_month")?.clamp(1, 31),
                time: parse_time(record.time.as_deref())?,
            },
            "cron" => RecurrenceSpec::Cron {
                expression: CronExpression::parse(required(record.cron.as_deref(), "cron")?)?,
            },
            other => {
                return Err(EngineError::Storage(format!(
                    "unknown recurrence kind '{other}'"
                )))
            }
        };

        let created_at = DateTime::parse_from_rfc3339(&record.created_at)
            .map_err(|e| EngineError::Storage(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Schedule {
            id: record.id,
            owner: record.owner,
            label: record.label,
            recurrence,
            selected_components: serde_json::from_str(&record.components)?,
            encrypt: record.encrypt,
            incremental: record.incremental,
            include_patterns: serde_json::from_str(&record.include_patterns)?,
            exclude_patterns: serde_json::from_str(&record.exclude_patterns)?,
            post_checks: serde_json::from_str(&record.post_checks)?,
            secondary_destinations: serde_json::from_str(&record.secondary_destinations)?,
            enabled: record.enabled,
            created_at,
            version: record.version.max(1) as u64,
        })
    }
}

fn required<T>(value: Option<T>, column: &str) -> Result<T> {
    value.ok_or_else(|| EngineError::Storage(format!("missing column value: {column}")))
}

/// `HH:MM`, or `HH:MM:SS` for a time that is not on the minute.
fn format_time(time: NaiveTime) -> String {
    if time.second() == 0 {
        time.format(TIME_FORMAT).to_string()
    } else {
        time.format("%H:%M:%S").to_string()
    }
}

fn parse_time(value: Option<&str>) -> Result<NaiveTime> {
    let text = required(value, "time")?;
    NaiveTime::parse_from_str(text, TIME_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M:%S"))
        .map_err(|e| EngineError::Storage(format!("invalid time '{text}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Offset, TimeZone};

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn weekly() -> RecurrenceSpec {
        RecurrenceSpec::Weekly {
            weekday: Weekday::Sun,
            time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut input = NewSchedule::new("site-1", "  ", weekly());
        assert!(matches!(input.validate(), Err(EngineError::Validation(_))));

        input.label = "nightly".into();
        input.selected_components.clear();
        assert!(input.validate().is_err());

        input.selected_components.insert(ComponentKind::Uploads);
        input.exclude_patterns.push("[".into());
        assert!(input.validate().is_err());

        input.exclude_patterns = vec!["*.log".into()];
        assert!(input.validate().is_ok());

        input.recurrence = RecurrenceSpec::Fixed { interval_seconds: 0 };
        assert!(input.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_disabled_recurrence_never_occurs() {
        let mut schedule = NewSchedule::new("site-1", "off", RecurrenceSpec::Disabled)
            .into_schedule("s1".into(), created())
            .unwrap();
        schedule.enabled = true;
        assert!(!schedule.is_active());
        assert_eq!(schedule.next_occurrence(created(), Utc.fix()).unwrap(), None);
    }

    #[test]
    fn test_record_roundtrip_clamps_day() {
        let mut input = NewSchedule::new(
            "site-1",
            "monthly",
            RecurrenceSpec::Monthly {
                day_of_month: 40,
                time: NaiveTime::from_hms_opt(3, 15, 0).unwrap(),
            },
        );
        input.post_checks.insert(PostCheckKind::VerifyArchive);
        input.secondary_destinations.push("local".into());
        let schedule = input.into_schedule("s1".into(), created()).unwrap();

        let record = ScheduleRecord::try_from(&schedule).unwrap();
        assert_eq!(record.recurrence_kind, "monthly");
        assert_eq!(record.day_of_month, Some(31));
        assert_eq!(record.time.as_deref(), Some("03:15"));

        let mut tampered = record.clone();
        tampered.day_of_month = Some(0);
        let back = Schedule::try_from(tampered).unwrap();
        assert!(matches!(back.recurrence, RecurrenceSpec::Monthly { day_of_month: 1, .. }));

        let back = Schedule::try_from(record).unwrap();
        assert_eq!(back, schedule);
    }

    #[test]
    fn test_time_of_day_survives_the_record() {
        let at = |h, m, s| NaiveTime::from_hms_opt(h, m, s).unwrap();
        let input = NewSchedule::new(
            "site-1",
            "seconds",
            RecurrenceSpec::Weekly { weekday: Weekday::Tue, time: at(4, 30, 15) },
        );
        assert!(matches!(input.clone().into_schedule("s1".into(), created()), Err(EngineError::Validation(_))));

        // Schedules built without validation still round-trip exactly.
        let mut schedule = NewSchedule::new("site-1", "seconds", weekly())
            .into_schedule("s1".into(), created())
            .unwrap();
        schedule.recurrence = input.recurrence;
        let record = ScheduleRecord::try_from(&schedule).unwrap();
        assert_eq!(record.time.as_deref(), Some("04:30:15"));
        assert_eq!(Schedule::try_from(record).unwrap(), schedule);

        let on_the_minute = NewSchedule::new("site-1", "minutes", weekly())
            .into_schedule("s2".into(), created())
            .unwrap();
        let record = ScheduleRecord::try_from(&on_the_minute).unwrap();
        assert_eq!(record.time.as_deref(), Some("22:00"));
        assert_eq!(Schedule::try_from(record).unwrap(), on_the_minute);
    }

    #[test]
    fn test_record_rejects_bad_cron() {
        let schedule = NewSchedule::new("site-1", "w", weekly())
            .into_schedule("s1".into(), created())
            .unwrap();
        let mut record = ScheduleRecord::try_from(&schedule).unwrap();
        record.recurrence_kind = "cron".into();
        record.cron = Some("* * * *".into());
        assert!(matches!(Schedule::try_from(record), Err(EngineError::Cron(_))));
    }

    #[test]
    fn test_component_kind_parse() {
        assert_eq!("Uploads".parse::<ComponentKind>().unwrap(), ComponentKind::Uploads);
        assert_eq!(ComponentKind::Database.dir_name(), None);
        assert_eq!(ComponentKind::Themes.dir_name(), Some("themes"));
        assert!("cache".parse::<ComponentKind>().is_err());
    }
}
