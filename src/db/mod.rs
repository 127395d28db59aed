// src/db/mod.rs
// Per-persona embedded database: pool, schema, and sync SQL modules

pub mod chronicle;
pub mod memopedia;
pub mod messages;
pub mod pool;
pub mod schema;

pub use pool::DatabasePool;
