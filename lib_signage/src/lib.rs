//! # lib_signage
//!
//! Schedule resolution and live delivery for digital signage monitors.
//!
//! The crate is split the same way the engine runs:
//!
//! - **`models`**: assignments, targets, devices and content descriptors.
//! - **`core`**: recurrence evaluation, conflict detection, the daily schedule
//!   cache, the connection registry and the two long-lived background tasks
//!   (daily refresh and reconciliation dispatch).
//! - **`protocol`**: the closed set of messages exchanged with monitors.
//! - **`store`**: the persistence seam, with an in-memory implementation and an
//!   optional PostgreSQL one (feature `postgres`).
//! - **`connections`**: the PostgreSQL connection pool (feature `postgres`).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod core;
pub mod models;
pub mod protocol;
pub mod store;

#[cfg(feature = "postgres")]
pub mod connections;

// Re-export the types most callers need.
pub use crate::core::{
    ConnectionRegistry, DailyRefresh, EngineError, ReconciliationDispatcher, ScheduleCache,
    ScheduleEngine,
};
pub use models::{Assignment, AssignmentRequest, ContentDescriptor, Device, Target};
