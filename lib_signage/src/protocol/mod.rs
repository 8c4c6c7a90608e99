//! # Monitor Wire Protocol
//!
//! JSON text frames shaped as `{"event": ..., "data": ...}`. Both directions
//! are closed enums: an inbound frame either decodes into a known event or
//! into a [`ProtocolError`] that the session answers explicitly.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::error::RegistrationError;
use crate::models::{Assignment, AssignmentId, ContentDescriptor, ContentId, DispatchMode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundMessage {
    RegisterMonitor {
        #[serde(default)]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    InitSchedules(Vec<Assignment>),
    ScheduleUpdate(Assignment),
    Show(ShowContent),
    Error(ErrorCode),
}

impl OutboundMessage {
    pub fn event(&self) -> &'static str {
        match self {
            OutboundMessage::InitSchedules(_) => "init_schedules",
            OutboundMessage::ScheduleUpdate(_) => "schedule_update",
            OutboundMessage::Show(_) => "show",
            OutboundMessage::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// What a monitor must render right now, with the window it is valid for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowContent {
    pub assignment_id: AssignmentId,
    pub content_id: ContentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentDescriptor>,
    pub starts_at: NaiveDateTime,
    pub ends_at: NaiveDateTime,
    pub priority: i32,
    pub mode: DispatchMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TokenRequired,
    InvalidToken,
    MonitorAlreadyConnected,
    MalformedMessage,
    RegistrationUnavailable,
}

impl From<&RegistrationError> for ErrorCode {
    fn from(err: &RegistrationError) -> Self {
        match err {
            RegistrationError::TokenRequired => ErrorCode::TokenRequired,
            RegistrationError::InvalidToken => ErrorCode::InvalidToken,
            RegistrationError::AlreadyConnected(_) => ErrorCode::MonitorAlreadyConnected,
            RegistrationError::Unavailable(_) => ErrorCode::RegistrationUnavailable,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Decodes an inbound text frame.
///
/// ## Logic:
/// 1. The frame must be a JSON object with a string `event`.
/// 2. Unknown events are reported as [`ProtocolError::UnknownEvent`].
/// 3. Known events with a bad payload are [`ProtocolError::Malformed`].
pub fn decode_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let mut value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let event = value
        .get("event")
        .and_then(|e| e.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ProtocolError::Malformed("missing 'event'".into()))?;

    match event.as_str() {
        "register_monitor" => {
            // A register frame without data still decodes, as a missing token.
            if value.get("data").is_none() {
                value["data"] = serde_json::json!({});
            }
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
        }
        other => Err(ProtocolError::UnknownEvent(other.to_string())),
    }
}
