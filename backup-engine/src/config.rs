//! Engine configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file is a
//! valid configuration.

use chrono::{Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::trigger::TriggerConfig;
use crate::utils::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Staging files and restore scratch space
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Where finished archives are published
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Root of the managed content (plugins/, themes/, uploads/, others/)
    #[serde(default = "default_content_root")]
    pub content_root: PathBuf,

    /// Shell command writing a database dump to stdout
    #[serde(default)]
    pub database_dump_command: Option<String>,

    /// Shell command reading a database dump from stdin
    #[serde(default)]
    pub database_restore_command: Option<String>,

    /// Files archived per `advance` call
    #[serde(default = "default_files_per_step")]
    pub files_per_step: usize,

    #[serde(default = "default_lock_stale_after_secs")]
    pub lock_stale_after_secs: u64,

    /// Offset the calendar rules are evaluated in
    #[serde(default)]
    pub reference_utc_offset_minutes: i32,

    /// zstd level (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    #[serde(default)]
    pub forecast: ForecastConfig,

    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,

    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,

    #[serde(default = "default_average_task_minutes")]
    pub average_task_minutes: u32,

    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
}

/// A local directory registered as a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub id: String,
    pub path: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup/work")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup/archives")
}

fn default_content_root() -> PathBuf {
    PathBuf::from("/var/www/content")
}

fn default_files_per_step() -> usize {
    500
}

fn default_lock_stale_after_secs() -> u64 {
    600
}

fn default_compression_level() -> i32 {
    3
}

fn default_horizon_days() -> u32 {
    7
}

fn default_average_task_minutes() -> u32 {
    30
}

fn default_window_hours() -> u32 {
    4
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizon_days: default_horizon_days(),
            average_task_minutes: default_average_task_minutes(),
            window_hours: default_window_hours(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            archive_dir: default_archive_dir(),
            content_root: default_content_root(),
            database_dump_command: None,
            database_restore_command: None,
            files_per_step: default_files_per_step(),
            lock_stale_after_secs: default_lock_stale_after_secs(),
            reference_utc_offset_minutes: 0,
            compression_level: default_compression_level(),
            forecast: ForecastConfig::default(),
            triggers: Vec::new(),
            destinations: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// All data directories under one root, as the runner lays them out.
    pub fn with_data_dir(mut self, data_dir: &Path) -> Self {
        self.work_dir = data_dir.join("work");
        self.archive_dir = data_dir.join("archives");
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.files_per_step == 0 {
            return Err(EngineError::Config("files_per_step must be at least 1".into()));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(EngineError::Config(format!(
                "compression_level {} is outside 1-22",
                self.compression_level
            )));
        }
        if self.reference_utc_offset_minutes.abs() >= 24 * 60 {
            return Err(EngineError::Config(format!(
                "reference_utc_offset_minutes {} is out of range",
                self.reference_utc_offset_minutes
            )));
        }
        if !(1..=24).contains(&self.forecast.window_hours) {
            return Err(EngineError::Config("forecast.window_hours must be 1-24".into()));
        }
        if self.forecast.horizon_days == 0 {
            return Err(EngineError::Config("forecast.horizon_days must be at least 1".into()));
        }
        for trigger in &self.triggers {
            if trigger.event.trim().is_empty() || trigger.schedule_id.trim().is_empty() {
                return Err(EngineError::Config(
                    "triggers need an event and a schedule_id".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn reference_offset(&self) -> FixedOffset {
        // Range checked in `validate`; fall back to UTC for hand-built values.
        FixedOffset::east_opt(self.reference_utc_offset_minutes * 60)
            .unwrap_or_else(crate::cron::utc_offset)
    }

    pub fn lock_stale_after(&self) -> Duration {
        const CAP: i64 = 365 * 86_400;
        Duration::seconds(i64::try_from(self.lock_stale_after_secs).unwrap_or(CAP).min(CAP))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.files_per_step, 500);
        assert_eq!(config.lock_stale_after(), Duration::minutes(10));
        assert_eq!(config.reference_offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_parse_full_file() {
        let config = EngineConfig::from_toml_str(
            r#"
            work_dir = "/tmp/work"
            content_root = "/srv/site"
            database_dump_command = "mysqldump site"
            files_per_step = 50
            reference_utc_offset_minutes = 120

            [forecast]
            horizon_days = 14

            [[triggers]]
            event = "plugin_updated"
            schedule_id = "s1"
            batch_window_seconds = 300

            [[destinations]]
            id = "offsite"
            path = "/mnt/offsite"
            "#,
        )
        .unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/tmp/work"));
        assert_eq!(config.database_dump_command.as_deref(), Some("mysqldump site"));
        assert_eq!(config.reference_offset().local_minus_utc(), 7200);
        assert_eq!(config.forecast.horizon_days, 14);
        assert_eq!(config.forecast.window_hours, 4);
        assert_eq!(config.triggers[0].max_batch, 10);
        assert!(config.triggers[0].enabled);
        assert_eq!(config.destinations[0].id, "offsite");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("files_per_step = 0"),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("reference_utc_offset_minutes = 1440"),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("files_per_step = \"many\""),
            Err(EngineError::Config(_))
        ));
    }
}
