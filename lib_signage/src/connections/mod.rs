//! # Connections Module
//!
//! Persistent connections to external services.

/// PostgreSQL connection pooling and health checks.
pub mod db_postgres;

pub use db_postgres::{Database, DbError};
