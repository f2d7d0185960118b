//! Fotiva shared infrastructure
//!
//! Database pool construction and the embedded schema migrations used by
//! both the API server and the background worker.

pub mod db;

pub use db::{create_pool, run_migrations};
