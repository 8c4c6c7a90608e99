//! # Engine Core
//!
//! ## Core Responsibilities:
//! - **Evaluation:** recurrence rules and conflict detection (pure, no I/O).
//! - **State:** the daily [`ScheduleCache`] and the [`ConnectionRegistry`].
//! - **Write path:** [`ScheduleEngine`] sequences validation, the conflict
//!   gate, persistence, cache mutation and push.
//! - **Background tasks:** [`DailyRefresh`] and [`ReconciliationDispatcher`],
//!   both stopped through a `CancellationToken`.

pub mod clock;
pub mod conflict;
pub mod daily_refresh;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod recurrence;
pub mod registry;
pub mod schedule_cache;

pub use clock::{Clock, ManualClock, ZonedClock};
pub use conflict::ConflictDetector;
pub use daily_refresh::DailyRefresh;
pub use dispatcher::{ActiveSource, DispatchState, ReconciliationDispatcher, TickReport};
pub use engine::ScheduleEngine;
pub use error::{EngineError, RegistrationError, ValidationError};
pub use registry::{ConnectedDevice, ConnectionRegistry, SessionGuard, SessionId};
pub use schedule_cache::ScheduleCache;
