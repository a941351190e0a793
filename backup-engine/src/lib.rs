//! Backup Engine Library
//!
//! Cron-style scheduling, resumable backup and restore tasks, compressed
//! archives with an embedded manifest and an authenticated encryption
//! envelope. The engine keeps no state of its own between calls; everything
//! lives behind the traits in [`store`].

pub mod archive;
pub mod clock;
pub mod config;
pub mod content;
pub mod cron;
pub mod envelope;
pub mod forecast;
pub mod keys;
pub mod recurrence;
pub mod schedule;
pub mod sink;
pub mod store;
pub mod task;
pub mod trigger;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use schedule::{ComponentKind, NewSchedule, Schedule};
pub use task::{TaskOrchestrator, TaskStatus};
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
