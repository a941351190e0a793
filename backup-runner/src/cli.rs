use backup_engine::cron::CronExpression;
use backup_engine::recurrence::{RecurrenceSpec, Shortcut};
use backup_engine::schedule::{ComponentKind, NewSchedule, PostCheckKind};
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::config::RunnerConfig;
use crate::error::{CliError, CliResult};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags that override the environment.
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Engine configuration file (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, value_name = "FILE", global = true)]
    pub db: Option<PathBuf>,

    /// Data directory (database, staging, archives)
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Owner whose schedules and tasks are addressed
    #[arg(long, global = true)]
    pub owner: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

impl GlobalArgs {
    pub fn apply(&self, config: &mut RunnerConfig) {
        if let Some(data_dir) = &self.data_dir {
            if self.db.is_none() && config.db_path.starts_with(&config.data_dir) {
                config.db_path = data_dir.join("backup.db");
            }
            config.data_dir = data_dir.clone();
        }
        if let Some(db) = &self.db {
            config.db_path = db.clone();
        }
        if let Some(path) = &self.config {
            config.engine_config = Some(path.clone());
        }
        if let Some(owner) = &self.owner {
            config.owner = owner.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if self.json_logs {
            config.log_json = true;
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create tasks for due schedules and flush buffered event batches
    Tick,

    /// Run one step of a task
    Advance {
        /// Task to advance
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        task_id: Option<String>,

        /// Advance every queued or running task of the owner once
        #[arg(long)]
        all: bool,
    },

    /// Drive a task to completion in the foreground; Ctrl-C cancels it
    Run {
        /// Start a new run of this schedule
        #[arg(long, conflicts_with = "task", required_unless_present = "task")]
        schedule: Option<String>,

        /// Drive an existing task
        #[arg(long)]
        task: Option<String>,

        /// Milliseconds between steps (overrides BACKUP_POLL_INTERVAL_MS)
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Show a task's status
    Status { task_id: String },

    /// List recent tasks
    Tasks {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Ask a task to stop at its next step boundary
    Cancel { task_id: String },

    /// Manage schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),

    /// Cron expression tools
    #[command(subcommand)]
    Cron(CronCommand),

    /// Forecast load for the owner's schedules
    Forecast {
        /// Days to look ahead (overrides the configured horizon)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Report a domain event to the trigger reconciler
    Event {
        name: String,

        #[arg(long)]
        detail: Option<String>,
    },

    /// List archives with their manifests
    Archives,

    /// Create a restore task for an archive
    Restore {
        archive: PathBuf,

        /// Components to restore (default: all in the archive)
        #[arg(long, value_delimiter = ',')]
        components: Vec<String>,

        /// Restore under this directory instead of the content root
        #[arg(long)]
        target: Option<PathBuf>,
    },

    /// Encrypt a file into an envelope
    Encrypt {
        input: PathBuf,
        output: PathBuf,

        /// Environment variable holding a passphrase (default: archive key)
        #[arg(long, value_name = "VAR")]
        passphrase_env: Option<String>,
    },

    /// Decrypt an envelope
    Decrypt {
        input: PathBuf,
        output: PathBuf,

        /// Environment variable holding a passphrase (default: archive key)
        #[arg(long, value_name = "VAR")]
        passphrase_env: Option<String>,
    },

    /// Set or clear the archive passphrase
    #[command(subcommand)]
    Passphrase(PassphraseCommand),
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    /// Create a schedule
    Add(ScheduleArgs),

    /// Replace a schedule's settings
    Edit {
        id: String,

        /// Version the edit was based on
        #[arg(long)]
        version: u64,

        #[command(flatten)]
        args: ScheduleArgs,
    },

    List,

    Enable { id: String },

    Disable { id: String },

    Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum CronCommand {
    /// Validate an expression and list its next occurrences
    Preview {
        expression: String,

        #[arg(long, default_value_t = 5)]
        count: usize,

        /// Start instant (RFC 3339, default: now)
        #[arg(long)]
        after: Option<DateTime<Utc>>,
    },
}

#[derive(Subcommand, Debug)]
pub enum PassphraseCommand {
    /// Read the passphrase from the given environment variable
    Set {
        #[arg(long, value_name = "VAR", default_value = "BACKUP_PASSPHRASE")]
        from_env: String,
    },

    /// Fall back to the installation key
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PostCheckArg {
    VerifyArchive,
    VerifyManifest,
}

impl From<PostCheckArg> for PostCheckKind {
    fn from(arg: PostCheckArg) -> Self {
        match arg {
            PostCheckArg::VerifyArchive => PostCheckKind::VerifyArchive,
            PostCheckArg::VerifyManifest => PostCheckKind::VerifyManifest,
        }
    }
}

/// Schedule settings. At most one recurrence flag; none means
/// the schedule only runs on demand.
#[derive(Args, Debug, Default)]
pub struct ScheduleArgs {
    #[arg(long)]
    pub label: String,

    /// Five-field cron expression
    #[arg(long, group = "recurrence")]
    pub cron: Option<String>,

    /// Fixed interval in seconds, anchored at creation
    #[arg(long, value_name = "SECONDS", group = "recurrence")]
    pub every: Option<u64>,

    /// Weekly, e.g. `sun@22:00`
    #[arg(long, value_name = "DAY@HH:MM", group = "recurrence")]
    pub weekly: Option<String>,

    /// Monthly, e.g. `31@03:00` (short months use their last day)
    #[arg(long, value_name = "DAY@HH:MM", group = "recurrence")]
    pub monthly: Option<String>,

    /// Preset: hourly, daily, weekly, fortnightly, monthly, every_<n>_hours
    #[arg(long, group = "recurrence")]
    pub preset: Option<String>,

    /// Time of day (or minute, for hourly) used by --preset
    #[arg(long, value_name = "HH:MM", requires = "preset")]
    pub at: Option<String>,

    /// Comma-separated components (default: all)
    #[arg(long, value_delimiter = ',')]
    pub components: Vec<String>,

    #[arg(long)]
    pub encrypt: bool,

    #[arg(long)]
    pub incremental: bool,

    #[arg(long = "include", value_name = "GLOB")]
    pub include_patterns: Vec<String>,

    #[arg(long = "exclude", value_name = "GLOB")]
    pub exclude_patterns: Vec<String>,

    #[arg(long = "post-check", value_enum)]
    pub post_checks: Vec<PostCheckArg>,

    /// Secondary destination id (repeatable)
    #[arg(long = "destination", value_name = "ID")]
    pub destinations: Vec<String>,

    /// Create the schedule disabled
    #[arg(long)]
    pub disabled: bool,
}

impl ScheduleArgs {
    pub fn into_new_schedule(self, owner: &str) -> CliResult<NewSchedule> {
        let recurrence = self.recurrence()?;
        let mut input = NewSchedule::new(owner, &self.label, recurrence);
        if !self.components.is_empty() {
            input.selected_components = parse_components(&self.components)?;
        }
        input.encrypt = self.encrypt;
        input.incremental = self.incremental;
        input.include_patterns = self.include_patterns;
        input.exclude_patterns = self.exclude_patterns;
        input.post_checks = self.post_checks.into_iter().map(PostCheckKind::from).collect();
        input.secondary_destinations = self.destinations;
        input.enabled = !self.disabled;
        Ok(input)
    }

    fn recurrence(&self) -> CliResult<RecurrenceSpec> {
        if let Some(text) = &self.cron {
            let expression: CronExpression = text.parse().map_err(|e| CliError::BadRequest(format!("{e}")))?;
            return Ok(RecurrenceSpec::Cron { expression });
        }
        if let Some(interval_seconds) = self.every {
            return Ok(RecurrenceSpec::Fixed { interval_seconds });
        }
        if let Some(text) = &self.weekly {
            let (day, time) = split_at_time(text)?;
            let weekday: Weekday = day
                .parse()
                .map_err(|_| CliError::BadRequest(format!("unknown weekday '{day}'")))?;
            return Ok(RecurrenceSpec::Weekly { weekday, time });
        }
        if let Some(text) = &self.monthly {
            let (day, time) = split_at_time(text)?;
            let day_of_month: u32 = day
                .parse()
                .map_err(|_| CliError::BadRequest(format!("invalid day of month '{day}'")))?;
            return Ok(RecurrenceSpec::Monthly { day_of_month, time });
        }
        if let Some(name) = &self.preset {
            let shortcut: Shortcut = name.parse().map_err(CliError::BadRequest)?;
            let at = self.at.as_deref().map(parse_time).transpose()?.unwrap_or_default();
            return shortcut
                .into_recurrence(at)
                .map_err(|e| CliError::BadRequest(e.to_string()));
        }
        Ok(RecurrenceSpec::Disabled)
    }
}

pub fn parse_components(names: &[String]) -> CliResult<BTreeSet<ComponentKind>> {
    names
        .iter()
        .map(|name| name.parse::<ComponentKind>().map_err(CliError::from))
        .collect()
}

fn split_at_time(text: &str) -> CliResult<(&str, NaiveTime)> {
    let (day, time) = text
        .split_once('@')
        .ok_or_else(|| CliError::BadRequest(format!("expected DAY@HH:MM, got '{text}'")))?;
    Ok((day.trim(), parse_time(time)?))
}

fn parse_time(text: &str) -> CliResult<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M")
        .map_err(|_| CliError::BadRequest(format!("invalid time '{text}', expected HH:MM")))
}
