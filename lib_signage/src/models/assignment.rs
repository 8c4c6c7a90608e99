use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use super::device::{ContentDescriptor, Device, DeviceId};
use crate::core::error::ValidationError;

pub type AssignmentId = i64;
pub type GroupId = i64;
pub type LocationId = i64;
pub type ContentId = i64;

/// Who an assignment is addressed to. Exactly one per assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Device(DeviceId),
    Group(GroupId),
    Location(LocationId),
}

impl Target {
    /// Returns true when the device is reached by this target.
    pub fn covers(&self, device: &Device) -> bool {
        match *self {
            Target::Device(id) => device.id == id,
            Target::Group(id) => device.group_id == Some(id),
            Target::Location(id) => device.location_id == Some(id),
        }
    }

    /// Higher is more specific: device > group > location.
    pub fn specificity(&self) -> u8 {
        match self {
            Target::Device(_) => 2,
            Target::Group(_) => 1,
            Target::Location(_) => 0,
        }
    }

    /// Raw id regardless of the target kind.
    pub fn id(&self) -> i64 {
        match *self {
            Target::Device(id) | Target::Group(id) | Target::Location(id) => id,
        }
    }
}

/// # Time Window
///
/// A half-open time-of-day interval `[start, end)`. Construction through
/// [`TimeWindow::new`] guarantees `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Strict intersection. Windows that only touch do not overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time < self.end
    }
}

/// Day selection rule of an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// Single day (the start date) or an explicit set of dates.
    #[serde(rename = "none")]
    Once,
    Daily,
    Weekly { weekdays: Vec<Weekday> },
    /// Same day of month as the start date.
    Monthly,
    /// Anything stored that this build does not understand. Never active.
    #[serde(other)]
    Unrecognized,
}

impl FromStr for Recurrence {
    type Err = ValidationError;

    /// Parses the kind only; weekly weekdays are attached by the caller.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Recurrence::Once),
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly { weekdays: Vec::new() }),
            "monthly" => Ok(Recurrence::Monthly),
            _ => Err(ValidationError::UnrecognizedRecurrence(s.to_string())),
        }
    }
}

impl Recurrence {
    pub fn kind(&self) -> &'static str {
        match self {
            Recurrence::Once => "none",
            Recurrence::Daily => "daily",
            Recurrence::Weekly { .. } => "weekly",
            Recurrence::Monthly => "monthly",
            Recurrence::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Rotation,
    Override,
}

impl FromStr for DispatchMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rotation" => Ok(DispatchMode::Rotation),
            "override" => Ok(DispatchMode::Override),
            _ => Err(ValidationError::UnrecognizedMode(s.to_string())),
        }
    }
}

/// # Assignment
///
/// A validated binding of one content item to one target for a daily time
/// window on the days selected by `recurrence`, bounded by
/// `[start_date, end_date]` and minus `exceptions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: AssignmentId,
    pub content_id: ContentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentDescriptor>,
    pub target: Target,
    pub window: TimeWindow,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    pub recurrence: Recurrence,
    /// Explicit occurrence dates, only meaningful with `Recurrence::Once`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dates: Vec<NaiveDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<NaiveDate>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub mode: DispatchMode,
}

/// A weekday as sent by clients: ISO number (1 = Monday) or a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WeekdaySpec {
    Iso(u8),
    Name(String),
}

impl WeekdaySpec {
    pub fn to_weekday(&self) -> Result<Weekday, ValidationError> {
        match self {
            WeekdaySpec::Iso(n @ 1..=7) => Ok(iso_weekday(*n)),
            WeekdaySpec::Iso(n) => Err(ValidationError::InvalidWeekday(n.to_string())),
            WeekdaySpec::Name(name) => Weekday::from_str(name.trim())
                .map_err(|_| ValidationError::InvalidWeekday(name.clone())),
        }
    }
}

fn iso_weekday(n: u8) -> Weekday {
    match n {
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        6 => Weekday::Sat,
        _ => Weekday::Sun,
    }
}

/// # Assignment Request
///
/// The unvalidated shape accepted from the HTTP surface. Targets arrive as
/// three optional ids, recurrence and mode as free strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRequest {
    #[serde(default)]
    pub id: Option<AssignmentId>,
    pub content_id: ContentId,
    #[serde(default, alias = "deviceId")]
    pub monitor_id: Option<DeviceId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub location_id: Option<LocationId>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub dates: Vec<NaiveDate>,
    #[serde(default)]
    pub recurrence: Option<String>,
    #[serde(default)]
    pub weekdays: Vec<WeekdaySpec>,
    #[serde(default)]
    pub exceptions: Vec<NaiveDate>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub mode: Option<String>,
}

impl AssignmentRequest {
    /// Validates a request for creation. A missing id becomes `0` and is
    /// assigned by the store.
    pub fn validate(&self) -> Result<Assignment, ValidationError> {
        let target = self.target()?;

        let (start, end) = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (start, end),
            _ => return Err(ValidationError::MissingTimeRange),
        };
        let window = TimeWindow::new(start, end)?;

        let mut recurrence = match &self.recurrence {
            Some(raw) => raw.parse::<Recurrence>()?,
            None => Recurrence::Once,
        };
        if let Recurrence::Weekly { weekdays } = &mut recurrence {
            for spec in &self.weekdays {
                let day = spec.to_weekday()?;
                if !weekdays.contains(&day) {
                    weekdays.push(day);
                }
            }
            if weekdays.is_empty() {
                return Err(ValidationError::EmptyWeekdays);
            }
        } else if !self.weekdays.is_empty() {
            return Err(ValidationError::WeekdaysWithoutWeekly);
        }

        let mut dates = self.dates.clone();
        dates.sort_unstable();
        dates.dedup();
        if !dates.is_empty() && recurrence != Recurrence::Once {
            return Err(ValidationError::DatesWithRecurrence);
        }

        let start_date = match (self.start_date, dates.first()) {
            (Some(date), _) => date,
            (None, Some(first)) => *first,
            (None, None) => return Err(ValidationError::MissingStartDate),
        };
        let end_date = self.end_date.or_else(|| dates.last().copied());
        if let Some(end_date) = end_date {
            if end_date < start_date {
                return Err(ValidationError::EndDateBeforeStart {
                    start: start_date,
                    end: end_date,
                });
            }
        }

        let mode = match &self.mode {
            Some(raw) => raw.parse::<DispatchMode>()?,
            None => DispatchMode::default(),
        };

        let mut exceptions = self.exceptions.clone();
        exceptions.sort_unstable();
        exceptions.dedup();

        Ok(Assignment {
            id: self.id.unwrap_or(0),
            content_id: self.content_id,
            content: None,
            target,
            window,
            start_date,
            end_date,
            recurrence,
            dates,
            exceptions,
            priority: self.priority,
            mode,
        })
    }

    /// Validates a request for an update, where the id is mandatory.
    pub fn validate_update(&self) -> Result<Assignment, ValidationError> {
        if self.id.is_none() {
            return Err(ValidationError::MissingId);
        }
        self.validate()
    }

    fn target(&self) -> Result<Target, ValidationError> {
        match (self.monitor_id, self.group_id, self.location_id) {
            (Some(id), None, None) => Ok(Target::Device(id)),
            (None, Some(id), None) => Ok(Target::Group(id)),
            (None, None, Some(id)) => Ok(Target::Location(id)),
            (None, None, None) => Err(ValidationError::MissingTarget),
            _ => Err(ValidationError::MultipleTargets),
        }
    }
}
