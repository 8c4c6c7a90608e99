//! # Domain Models
//!
//! Plain data shared by every layer of the engine. Nothing in here performs
//! I/O; the only behavior is validation of incoming requests and a few
//! helpers on targets and time windows.

/// Assignments (schedules), their targets, windows and recurrence rules.
pub mod assignment;
/// Monitors and the content they display.
pub mod device;

pub use assignment::{
    Assignment, AssignmentId, AssignmentRequest, ContentId, DispatchMode, GroupId, LocationId,
    Recurrence, Target, TimeWindow, WeekdaySpec,
};
pub use device::{ContentDescriptor, Device, DeviceId};
