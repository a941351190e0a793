//! Utility modules for the backup engine.

pub mod errors;
pub mod logger;
pub mod pulse;

pub use errors::{EngineError, Result};
