//! Event triggers: domain events ("plugin updated", "theme switched") mapped
//! to backups with a cooldown and a batch window, so a burst of events
//! produces one task instead of many.
//!
//! The reconciler only decides; creating the task and persisting the state
//! is left to the orchestrator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schedule::ScheduleId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub event: String,
    /// Schedule whose settings the triggered backup uses.
    pub schedule_id: ScheduleId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub batch_window_seconds: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_max_batch() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub received_at: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Persisted per-event state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerState {
    pub event: String,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub window_started_at: Option<DateTime<Utc>>,
    /// At most `max_batch` entries; further events fold into the last one.
    pub pending: Vec<PendingEvent>,
    /// Events folded into the last pending entry once the buffer was full.
    #[serde(default)]
    pub coalesced: u64,
}

impl TriggerState {
    pub fn new(event: &str) -> Self {
        Self {
            event: event.to_string(),
            ..Self::default()
        }
    }

    /// Record a fired batch: the buffer is emptied and the cooldown starts.
    pub fn mark_fired(&mut self, now: DateTime<Utc>) {
        self.last_fired_at = Some(now);
        self.window_started_at = None;
        self.pending.clear();
        self.coalesced = 0;
    }

    /// Every event received since the batch opened, folded ones included.
    pub fn event_count(&self) -> usize {
        self.pending
            .len()
            .saturating_add(usize::try_from(self.coalesced).unwrap_or(usize::MAX))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IgnoreReason {
    UnknownEvent,
    Disabled,
    CoolingDown { until: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    Ignored(IgnoreReason),
    Buffered {
        pending: usize,
        fire_at: DateTime<Utc>,
    },
    /// The batch is complete; one task should be created for it.
    Fire { schedule_id: ScheduleId, events: usize },
}

#[derive(Debug, Clone, Default)]
pub struct EventTriggerReconciler {
    configs: BTreeMap<String, TriggerConfig>,
}

impl EventTriggerReconciler {
    pub fn new(configs: impl IntoIterator<Item = TriggerConfig>) -> Self {
        Self {
            configs: configs
                .into_iter()
                .map(|config| (config.event.clone(), config))
                .collect(),
        }
    }

    pub fn config(&self, event: &str) -> Option<&TriggerConfig> {
        self.configs.get(event)
    }

    pub fn configs(&self) -> impl Iterator<Item = &TriggerConfig> {
        self.configs.values()
    }

    /// Buffer one event and decide whether its batch is ready.
    pub fn on_event(
        &self,
        state: &mut TriggerState,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> TriggerDecision {
        let Some(config) = self.configs.get(&state.event) else {
            return TriggerDecision::Ignored(IgnoreReason::UnknownEvent);
        };
        if !config.enabled {
            return TriggerDecision::Ignored(IgnoreReason::Disabled);
        }

        if state.pending.is_empty() {
            if let Some(last) = state.last_fired_at {
                let until = last + seconds(config.cooldown_seconds);
                if now < until {
                    return TriggerDecision::Ignored(IgnoreReason::CoolingDown { until });
                }
            }
            state.window_started_at = Some(now);
        }
        let event = PendingEvent {
            received_at: now,
            detail,
        };
        let cap = config.max_batch.max(1) as usize;
        let pending_len = state.pending.len();
        match state.pending.last_mut() {
            // A full batch that could not fire yet keeps only the latest event.
            Some(last) if pending_len >= cap => {
                *last = event;
                state.coalesced = state.coalesced.saturating_add(1);
            }
            _ => state.pending.push(event),
        }

        self.decide(config, state, now)
    }

    /// Re-evaluate a buffered batch without a new event (the tick's flush).
    pub fn poll(&self, state: &TriggerState, now: DateTime<Utc>) -> Option<TriggerDecision> {
        let config = self.configs.get(&state.event)?;
        if state.pending.is_empty() || !config.enabled {
            return None;
        }
        Some(self.decide(config, state, now))
    }

    fn decide(&self, config: &TriggerConfig, state: &TriggerState, now: DateTime<Utc>) -> TriggerDecision {
        let opened = state.window_started_at.unwrap_or(now);
        let fire_at = opened + seconds(config.batch_window_seconds);
        let full = state.pending.len() >= config.max_batch.max(1) as usize;
        if full || now >= fire_at {
            TriggerDecision::Fire {
                schedule_id: config.schedule_id.clone(),
                events: state.event_count(),
            }
        } else {
            TriggerDecision::Buffered {
                pending: state.event_count(),
                fire_at,
            }
        }
    }
}

fn seconds(value: u64) -> Duration {
    const CENTURY: i64 = 100 * 365 * 86_400;
    Duration::seconds(i64::try_from(value).unwrap_or(CENTURY).min(CENTURY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn reconciler(cooldown: u64, window: u64, max_batch: u32) -> EventTriggerReconciler {
        EventTriggerReconciler::new([TriggerConfig {
            event: "plugin_updated".into(),
            schedule_id: "s1".into(),
            enabled: true,
            cooldown_seconds: cooldown,
            batch_window_seconds: window,
            max_batch,
        }])
    }

    #[test]
    fn test_unknown_and_disabled_are_ignored() {
        let r = reconciler(0, 0, 1);
        let mut state = TriggerState::new("other");
        assert_eq!(
            r.on_event(&mut state, None, t0()),
            TriggerDecision::Ignored(IgnoreReason::UnknownEvent)
        );

        let mut config = r.config("plugin_updated").unwrap().clone();
        config.enabled = false;
        let r = EventTriggerReconciler::new([config]);
        let mut state = TriggerState::new("plugin_updated");
        assert_eq!(
            r.on_event(&mut state, None, t0()),
            TriggerDecision::Ignored(IgnoreReason::Disabled)
        );
        assert!(state.pending.is_empty());
    }

    #[test]
    fn test_burst_fires_once_per_window() {
        let r = reconciler(0, 60, 100);
        let mut state = TriggerState::new("plugin_updated");
        for i in 0..5 {
            let decision = r.on_event(&mut state, Some(format!("plugin-{i}")), t0() + Duration::seconds(i));
            assert!(matches!(decision, TriggerDecision::Buffered { .. }));
        }
        assert_eq!(r.poll(&state, t0() + Duration::seconds(30)).map(|d| matches!(d, TriggerDecision::Fire { .. })), Some(false));
        assert_eq!(
            r.poll(&state, t0() + Duration::seconds(60)),
            Some(TriggerDecision::Fire { schedule_id: "s1".into(), events: 5 })
        );
    }

    #[test]
    fn test_max_batch_fires_immediately() {
        let r = reconciler(0, 3600, 3);
        let mut state = TriggerState::new("plugin_updated");
        r.on_event(&mut state, None, t0());
        r.on_event(&mut state, None, t0());
        assert_eq!(
            r.on_event(&mut state, None, t0()),
            TriggerDecision::Fire { schedule_id: "s1".into(), events: 3 }
        );
    }

    #[test]
    fn test_cooldown_after_fire() {
        let r = reconciler(600, 0, 10);
        let mut state = TriggerState::new("plugin_updated");
        assert!(matches!(r.on_event(&mut state, None, t0()), TriggerDecision::Fire { .. }));
        state.mark_fired(t0());

        let during = r.on_event(&mut state, None, t0() + Duration::seconds(100));
        assert_eq!(
            during,
            TriggerDecision::Ignored(IgnoreReason::CoolingDown { until: t0() + Duration::seconds(600) })
        );
        assert!(state.pending.is_empty());

        assert!(matches!(
            r.on_event(&mut state, None, t0() + Duration::seconds(600)),
            TriggerDecision::Fire { events: 1, .. }
        ));
    }

    #[test]
    fn test_full_buffer_coalesces_while_blocked() {
        let r = reconciler(0, 3600, 3);
        let mut state = TriggerState::new("plugin_updated");
        // The schedule is busy, so every Fire is left unmarked.
        for i in 0..500 {
            r.on_event(&mut state, Some(format!("plugin-{i}")), t0() + Duration::seconds(i));
        }
        assert_eq!(state.pending.len(), 3);
        assert_eq!(state.coalesced, 497);
        assert_eq!(state.pending[2].detail.as_deref(), Some("plugin-499"));
        assert_eq!(
            r.poll(&state, t0() + Duration::seconds(500)),
            Some(TriggerDecision::Fire { schedule_id: "s1".into(), events: 500 })
        );

        state.mark_fired(t0() + Duration::seconds(500));
        assert_eq!(state.event_count(), 0);
    }

    #[test]
    fn test_poll_without_pending() {
        let r = reconciler(0, 10, 10);
        assert_eq!(r.poll(&TriggerState::new("plugin_updated"), t0()), None);
    }
}
