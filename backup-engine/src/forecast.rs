//! Advisory load forecast for a set of schedules.
//!
//! Expands every active schedule over a horizon and reports how crowded the
//! resulting timeline is. Nothing here affects what the tick does.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Timelike, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ForecastConfig;
use crate::schedule::{Schedule, ScheduleId};

pub const MAX_OCCURRENCES_PER_SCHEDULE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastSettings {
    pub horizon: Duration,
    pub average_task_duration: Duration,
    pub window_hours: u32,
    pub reference_offset: FixedOffset,
}

impl ForecastSettings {
    pub fn from_config(config: &ForecastConfig, reference_offset: FixedOffset) -> Self {
        Self {
            horizon: Duration::days(i64::from(config.horizon_days)),
            average_task_duration: Duration::minutes(i64::from(config.average_task_minutes)),
            window_hours: config.window_hours,
            reference_offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Occurrence {
    pub schedule_id: ScheduleId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayBucket {
    pub date: NaiveDate,
    pub occurrences: usize,
    pub schedules: BTreeSet<ScheduleId>,
}

/// Hours of the reference day, `end_hour` exclusive and possibly wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdealWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    pub occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnsatisfiableSchedule {
    pub schedule_id: ScheduleId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub occurrences: Vec<Occurrence>,
    pub per_schedule: BTreeMap<ScheduleId, usize>,
    pub days: Vec<DayBucket>,
    pub peak_concurrency: usize,
    pub peak_at: Option<DateTime<Utc>>,
    pub density_score: u8,
    pub risk: RiskLevel,
    pub ideal_window: IdealWindow,
    pub unsatisfiable: Vec<UnsatisfiableSchedule>,
}

#[derive(Debug, Clone)]
pub struct Forecaster {
    settings: ForecastSettings,
}

impl Forecaster {
    pub fn new(mut settings: ForecastSettings) -> Self {
        settings.average_task_duration = settings.average_task_duration.max(Duration::seconds(60));
        settings.window_hours = settings.window_hours.clamp(1, 24);
        settings.horizon = settings.horizon.max(Duration::zero());
        Self { settings }
    }

    pub fn settings(&self) -> &ForecastSettings {
        &self.settings
    }

    pub fn forecast(&self, schedules: &[Schedule], from: DateTime<Utc>) -> Forecast {
        let until = from + self.settings.horizon;
        let offset = self.settings.reference_offset;

        let mut occurrences = Vec::new();
        let mut per_schedule = BTreeMap::new();
        let mut unsatisfiable = Vec::new();

        for schedule in schedules.iter().filter(|s| s.is_active()) {
            match schedule.recurrence.occurrences_between(
                from,
                until,
                schedule.created_at,
                offset,
                MAX_OCCURRENCES_PER_SCHEDULE,
            ) {
                Ok(found) => {
                    per_schedule.insert(schedule.id.clone(), found.len());
                    occurrences.extend(found.into_iter().map(|at| Occurrence {
                        schedule_id: schedule.id.clone(),
                        at,
                    }));
                }
                Err(e) => {
                    tracing::warn!(schedule_id = %schedule.id, error = %e, "Schedule can never run");
                    unsatisfiable.push(UnsatisfiableSchedule {
                        schedule_id: schedule.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        occurrences.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.schedule_id.cmp(&b.schedule_id)));

        let instants: Vec<DateTime<Utc>> = occurrences.iter().map(|o| o.at).collect();
        let sweep = sweep(&instants, self.settings.average_task_duration);
        let density_score = density(&sweep, instants.len(), self.settings.average_task_duration);
        let risk = risk_level(sweep.peak, density_score);

        Forecast {
            from,
            until,
            days: day_buckets(&occurrences, offset),
            ideal_window: ideal_window(&instants, offset, self.settings.window_hours),
            occurrences,
            per_schedule,
            peak_concurrency: sweep.peak,
            peak_at: sweep.peak_at,
            density_score,
            risk,
            unsatisfiable,
        }
    }
}

pub fn risk_level(peak: usize, density_score: u8) -> RiskLevel {
    if peak >= 3 || density_score >= 60 {
        RiskLevel::High
    } else if peak == 2 || density_score >= 25 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

struct Sweep {
    peak: usize,
    peak_at: Option<DateTime<Utc>>,
    /// Seconds spent at each concurrency level of two or more, weighted by
    /// that level.
    overlapping_seconds: i64,
}

/// Sweep over `[t, t + duration)` windows. Ends sort before starts at the
/// same instant so back-to-back runs do not count as overlapping.
fn sweep(instants: &[DateTime<Utc>], duration: Duration) -> Sweep {
    let mut events: Vec<(DateTime<Utc>, i32)> = instants
        .iter()
        .flat_map(|&t| [(t, 1), (t + duration, -1)])
        .collect();
    events.sort();

    let mut result = Sweep {
        peak: 0,
        peak_at: None,
        overlapping_seconds: 0,
    };
    let mut running: usize = 0;
    let mut previous: Option<DateTime<Utc>> = None;

    for (at, delta) in events {
        if let Some(prev) = previous {
            if running >= 2 {
                result.overlapping_seconds += running as i64 * (at - prev).num_seconds();
            }
        }
        running = if delta > 0 { running + 1 } else { running.saturating_sub(1) };
        if running > result.peak {
            result.peak = running;
            result.peak_at = Some(at);
        }
        previous = Some(at);
    }
    result
}

fn density(sweep: &Sweep, count: usize, duration: Duration) -> u8 {
    let total = count as i64 * duration.num_seconds();
    if total <= 0 {
        return 0;
    }
    let share = 100.0 * sweep.overlapping_seconds as f64 / total as f64;
    share.round().clamp(0.0, 100.0) as u8
}

fn day_buckets(occurrences: &[Occurrence], offset: FixedOffset) -> Vec<DayBucket> {
    let mut days: BTreeMap<NaiveDate, DayBucket> = BTreeMap::new();
    for occurrence in occurrences {
        let date = occurrence.at.with_timezone(&offset).date_naive();
        let bucket = days.entry(date).or_insert_with(|| DayBucket {
            date,
            occurrences: 0,
            schedules: BTreeSet::new(),
        });
        bucket.occurrences += 1;
        bucket.schedules.insert(occurrence.schedule_id.clone());
    }
    days.into_values().collect()
}

fn ideal_window(instants: &[DateTime<Utc>], offset: FixedOffset, window_hours: u32) -> IdealWindow {
    let mut histogram = [0usize; 24];
    for at in instants {
        histogram[at.with_timezone(&offset).hour() as usize] += 1;
    }

    let width = window_hours.clamp(1, 24);
    let mut best = IdealWindow {
        start_hour: 0,
        end_hour: width % 24,
        occurrences: usize::MAX,
    };
    for start in 0..24u32 {
        let load: usize = (0..width).map(|i| histogram[((start + i) % 24) as usize]).sum();
        // Strictly less keeps the earliest start on ties.
        if load < best.occurrences {
            best = IdealWindow {
                start_hour: start,
                end_hour: (start + width) % 24,
                occurrences: load,
            };
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::CronExpression;
    use crate::recurrence::RecurrenceSpec;
    use crate::schedule::NewSchedule;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap()
    }

    fn cron_schedule(id: &str, expression: &str) -> Schedule {
        NewSchedule::new(
            "admin",
            id,
            RecurrenceSpec::Cron {
                expression: CronExpression::parse(expression).unwrap(),
            },
        )
        .into_schedule(id.to_string(), t0() - Duration::days(30))
        .unwrap()
    }

    fn forecaster() -> Forecaster {
        Forecaster::new(ForecastSettings {
            horizon: Duration::days(7),
            average_task_duration: Duration::minutes(30),
            window_hours: 4,
            reference_offset: crate::cron::utc_offset(),
        })
    }

    #[test]
    fn test_single_daily_schedule_is_low_risk() {
        let forecast = forecaster().forecast(&[cron_schedule("a", "0 2 * * *")], t0());
        assert_eq!(forecast.occurrences.len(), 7);
        assert_eq!(forecast.per_schedule["a"], 7);
        assert_eq!(forecast.days.len(), 7);
        assert_eq!(forecast.peak_concurrency, 1);
        assert_eq!(forecast.density_score, 0);
        assert_eq!(forecast.risk, RiskLevel::Low);
        assert_eq!(
            forecast.ideal_window,
            IdealWindow { start_hour: 3, end_hour: 7, occurrences: 0 }
        );
    }

    #[test]
    fn test_colliding_schedules() {
        let schedules = [cron_schedule("a", "0 2 * * *"), cron_schedule("b", "0 2 * * *")];
        let forecast = forecaster().forecast(&schedules, t0());
        assert_eq!(forecast.peak_concurrency, 2);
        assert_eq!(forecast.peak_at, Some(t0() + Duration::hours(2)));
        assert_eq!(forecast.density_score, 100);
        assert_eq!(forecast.risk, RiskLevel::High);
        assert_eq!(forecast.days[0].schedules.len(), 2);
    }

    #[test]
    fn test_partial_overlap_scores_medium() {
        // 02:00 and 02:20 with 30 minute runs: two runs share 10 minutes, so 20
        // of the 60 execution minutes overlap.
        let schedules = [cron_schedule("a", "0 2 * * *"), cron_schedule("b", "20 2 * * *")];
        let forecast = forecaster().forecast(&schedules, t0());
        assert_eq!(forecast.peak_concurrency, 2);
        assert_eq!(forecast.density_score, 33);
        assert_eq!(forecast.risk, RiskLevel::Medium);
    }

    #[test]
    fn test_back_to_back_runs_do_not_overlap() {
        let schedule = NewSchedule::new("admin", "half-hourly", RecurrenceSpec::Fixed { interval_seconds: 1800 })
            .into_schedule("h".into(), t0())
            .unwrap();
        let forecast = forecaster().forecast(&[schedule], t0());
        assert_eq!(forecast.occurrences.len(), 7 * 48);
        assert_eq!(forecast.peak_concurrency, 1);
        assert_eq!(forecast.density_score, 0);
    }

    #[test]
    fn test_three_at_once_is_high_and_unsatisfiable_is_reported() {
        let mut schedules = vec![
            cron_schedule("a", "0 4 * * 1"),
            cron_schedule("b", "0 4 * * 1"),
            cron_schedule("c", "0 4 * * 1"),
            cron_schedule("never", "0 0 30 2 *"),
        ];
        let mut disabled = cron_schedule("off", "0 4 * * 1");
        disabled.enabled = false;
        schedules.push(disabled);

        let forecast = forecaster().forecast(&schedules, t0());
        assert_eq!(forecast.peak_concurrency, 3);
        assert_eq!(forecast.risk, RiskLevel::High);
        assert_eq!(forecast.unsatisfiable.len(), 1);
        assert_eq!(forecast.unsatisfiable[0].schedule_id, "never");
        assert!(!forecast.per_schedule.contains_key("off"));
    }

    #[test]
    fn test_ideal_window_wraps_midnight() {
        let instants: Vec<_> = (1..23).map(|h| t0() + Duration::hours(h)).collect();
        let window = ideal_window(&instants, crate::cron::utc_offset(), 2);
        assert_eq!(window, IdealWindow { start_hour: 23, end_hour: 1, occurrences: 0 });
    }

    #[test]
    fn test_risk_thresholds() {
        assert_eq!(risk_level(1, 24), RiskLevel::Low);
        assert_eq!(risk_level(1, 25), RiskLevel::Medium);
        assert_eq!(risk_level(2, 0), RiskLevel::Medium);
        assert_eq!(risk_level(1, 60), RiskLevel::High);
        assert_eq!(risk_level(3, 0), RiskLevel::High);
    }
}
