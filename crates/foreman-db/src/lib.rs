//! Store adapter for the foreman orchestration engine.
//!
//! All persistent state lives in PostgreSQL behind this crate: models map
//! rows one-to-one, `queries::*` expose free async functions over an
//! executor (pool, connection, or open transaction), and `pool` handles
//! connection setup and migrations. Components above this crate never issue
//! SQL directly.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
