//! # Persistence Seam
//!
//! The engine never talks to a database directly. It consumes the two traits
//! below, which are implemented by [`memory::InMemoryStore`] and, with the
//! `postgres` feature, by `postgres::PgStore`.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

use crate::models::{Assignment, AssignmentId, Device, Target, TimeWindow};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schedule {0} not found")]
    NotFound(AssignmentId),

    #[error("backend unavailable: {0}")]
    Backend(String),

    #[error("corrupt row: {0}")]
    Decode(String),

    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
}

/// Assignment persistence together with its materialized occurrence dates.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Persists a new assignment and its occurrence dates in one unit.
    /// An id of `0` is replaced by a store-assigned one.
    async fn create(
        &self,
        assignment: &Assignment,
        days: &[NaiveDate],
    ) -> Result<Assignment, StoreError>;

    /// Existing assignments on `target` that occur on any of `days` with a
    /// window overlapping `window`, excluding the ids in `exclude`.
    ///
    /// Days past an assignment's last materialized day are decided by its
    /// recurrence rule, so open-ended rules keep protecting their slots.
    async fn find_conflicts(
        &self,
        target: &Target,
        days: &[NaiveDate],
        window: &TimeWindow,
        exclude: &[AssignmentId],
    ) -> Result<Vec<Assignment>, StoreError>;

    /// Assignments occurring on `date`, under the same rule as `find_conflicts`.
    async fn assignments_active_on(&self, date: NaiveDate) -> Result<Vec<Assignment>, StoreError>;

    async fn assignments_active_now(
        &self,
        now: NaiveDateTime,
    ) -> Result<Vec<Assignment>, StoreError>;

    /// Materializes the missing occurrence dates in `[from, through]` of every
    /// recurring assignment. Returns how many dates were added.
    async fn extend_days(&self, from: NaiveDate, through: NaiveDate) -> Result<usize, StoreError>;

    /// Replaces every assignment of the batch and its dates, all or nothing.
    async fn update_batch(
        &self,
        batch: &[(Assignment, Vec<NaiveDate>)],
    ) -> Result<Vec<Assignment>, StoreError>;

    /// Removes the assignment and its dates, returning what was removed.
    async fn delete(&self, id: AssignmentId) -> Result<Assignment, StoreError>;

    async fn get(&self, id: AssignmentId) -> Result<Option<Assignment>, StoreError>;
}

/// Resolves a monitor identity token to a device record.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn resolve_token(&self, token: &str) -> Result<Option<Device>, StoreError>;
}
