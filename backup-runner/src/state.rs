use anyhow::Context;
use backup_engine::content::DirectoryContentSource;
use backup_engine::{EngineConfig, TaskOrchestrator};
use std::sync::Arc;

use crate::config::RunnerConfig;
use crate::db::{self, migrate::migrate};
use crate::store::SqliteStore;

/// Everything one invocation needs, opened once in `main`.
pub struct AppState {
    pub config: RunnerConfig,
    pub engine: EngineConfig,
    pub orchestrator: Arc<TaskOrchestrator<SqliteStore>>,
}

impl AppState {
    pub fn open(config: RunnerConfig) -> anyhow::Result<Self> {
        let engine = config.load_engine_config()?;

        let pool = db::create_pool(&config.db_path)?;
        migrate(&pool).context("Database migration failed")?;
        let store = Arc::new(SqliteStore::new(pool));

        let content = DirectoryContentSource::new(&engine.content_root)
            .with_dump_command(engine.database_dump_command.clone())
            .with_restore_command(engine.database_restore_command.clone());
        let orchestrator = TaskOrchestrator::new(store, Arc::new(content), &engine);

        tracing::debug!(
            db = %config.db_path.display(),
            content_root = %engine.content_root.display(),
            "Runner state opened"
        );

        Ok(Self {
            config,
            engine,
            orchestrator: Arc::new(orchestrator),
        })
    }

    pub fn store(&self) -> &SqliteStore {
        self.orchestrator.store()
    }

    pub fn owner(&self) -> &str {
        &self.config.owner
    }
}
