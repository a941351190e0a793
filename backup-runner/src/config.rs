use anyhow::Context;
use backup_engine::EngineConfig;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Optional TOML file with the engine configuration.
    pub engine_config: Option<PathBuf>,
    /// Overrides the engine's `content_root` when set.
    pub content_root: Option<PathBuf>,
    pub owner: String,
    pub log_level: String,
    pub log_json: bool,
    /// Delay between `advance` calls in the `run` command.
    pub poll_interval_ms: u64,
}

impl RunnerConfig {
    /// Read the process environment, after loading `.env` if present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = PathBuf::from(lookup("BACKUP_DATA_DIR").unwrap_or_else(|| "/var/lib/backup".into()));

        Self {
            db_path: lookup("BACKUP_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("backup.db")),
            engine_config: lookup("BACKUP_CONFIG").map(PathBuf::from),
            content_root: lookup("BACKUP_CONTENT_ROOT").map(PathBuf::from),
            owner: lookup("BACKUP_OWNER").unwrap_or_else(|| "admin".into()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            log_json: lookup("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
            poll_interval_ms: lookup("BACKUP_POLL_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            data_dir,
        }
    }

    /// Engine settings: the TOML file when configured, otherwise defaults
    /// rooted under `data_dir`.
    pub fn load_engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.engine_config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("Failed to load engine config {}", path.display()))?,
            None => EngineConfig::default().with_data_dir(&self.data_dir),
        };
        if let Some(root) = &self.content_root {
            config.content_root = root.clone();
        }
        Ok(config)
    }
}
