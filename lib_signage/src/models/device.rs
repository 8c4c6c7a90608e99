use serde::{Deserialize, Serialize};

use super::assignment::{ContentId, GroupId, LocationId};

/// Identifier of a physical monitor.
pub type DeviceId = i64;

/// # Device
///
/// A monitor as resolved from its identity token. The group and location
/// memberships decide which group- or location-wide assignments reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<LocationId>,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            group_id: None,
            location_id: None,
        }
    }

    pub fn in_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn at_location(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }
}

/// # Content Descriptor
///
/// What a monitor needs in order to render a content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentDescriptor {
    pub id: ContentId,
    pub title: String,
    /// Media kind as stored ("image", "video", ...).
    pub kind: String,
    pub url: String,
    /// Display duration for still images, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i32>,
}
