//! Error types of the engine.

use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;

use crate::models::Assignment;
use crate::store::StoreError;

/// Rejections raised before anything reaches persistence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("exactly one of monitor, group or location must be set (none given)")]
    MissingTarget,
    #[error("exactly one of monitor, group or location must be set (several given)")]
    MultipleTargets,
    #[error("start and end time are required")]
    MissingTimeRange,
    #[error("start time {start} must be before end time {end}")]
    InvalidTimeRange { start: NaiveTime, end: NaiveTime },
    #[error("a start date or explicit dates are required")]
    MissingStartDate,
    #[error("end date {end} is before start date {start}")]
    EndDateBeforeStart { start: NaiveDate, end: NaiveDate },
    #[error("weekly recurrence requires at least one weekday")]
    EmptyWeekdays,
    #[error("invalid weekday '{0}'")]
    InvalidWeekday(String),
    #[error("explicit dates are only allowed without recurrence")]
    DatesWithRecurrence,
    #[error("weekdays are only allowed with weekly recurrence")]
    WeekdaysWithoutWeekly,
    #[error("unrecognized recurrence '{0}'")]
    UnrecognizedRecurrence(String),
    #[error("unrecognized mode '{0}'")]
    UnrecognizedMode(String),
    #[error("an id is required to update a schedule")]
    MissingId,
    #[error("schedule {0} appears more than once in the batch")]
    DuplicateId(i64),
}

/// Errors returned by the write path of [`super::ScheduleEngine`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("schedule conflicts with {} existing schedule(s)", conflicts.len())]
    Conflict { conflicts: Vec<Assignment> },

    #[error("schedule {0} not found")]
    NotFound(i64),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Store(other),
        }
    }
}

/// Why a registration handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("token required")]
    TokenRequired,
    #[error("invalid token")]
    InvalidToken,
    #[error("monitor {0} already connected")]
    AlreadyConnected(i64),
    #[error("identity lookup failed: {0}")]
    Unavailable(String),
}
