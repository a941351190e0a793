pub mod connection;
pub mod migrate;

pub use connection::{create_memory_pool, create_pool, DbPool};
