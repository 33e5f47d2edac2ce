//! Wire protocol envelopes and core chat records.
//!
//! All hub traffic is JSON text frames in one of three shapes: a [`Request`]
//! (client → hub), a [`Response`] correlated to a request (hub → one client),
//! or an [`Event`] fanned out to a room's subscribers.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recipient sentinel for room-wide messages.
pub const ALL: &str = "all";

/// Sender name used for hub-generated messages.
pub const SYSTEM: &str = "SYSTEM";

/// Client-to-hub message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub data: Value,
}

impl Request {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind: kind.into(),
            room: String::new(),
            data: Value::Null,
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Hub-to-client reply for a specific request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub request_type: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Extract the prose `data.text` field, if present.
    pub fn text(&self) -> Option<&str> {
        self.data.as_ref()?.get("text")?.as_str()
    }
}

/// Hub-to-subscriber broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    pub room: String,
    #[serde(default)]
    pub data: Value,
}

/// Event names carried in [`Event::event`].
pub mod events {
    pub const MESSAGE_NEW: &str = "message_new";
    pub const AGENT_JOINED: &str = "agent_joined";
    pub const AGENT_LEFT: &str = "agent_left";
    pub const ROOM_CLEARED: &str = "room_cleared";
}

/// Message delivery class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Broadcast,
    Direct,
    System,
}

/// Message priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "urgent" => Some(Self::Urgent),
            "normal" | "" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// A chat message. Immutable once appended to a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub from: String,
    pub to: String,
    /// The requested recipient before manager interception rewrote `to`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub original_to: String,
    pub content: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub routed_by_manager: bool,
    #[serde(default)]
    pub expects_reply: bool,
    #[serde(default)]
    pub priority: Priority,
}

/// A room roster entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub role: String,
    pub joined_at: String,
    pub last_seen: f64,
}

/// Current time as fractional seconds since the unix epoch.
pub fn now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current local time as an ISO-8601 string with microseconds.
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Extract `HH:MM:SS` from an ISO timestamp, falling back to the raw string.
pub fn clock_time(ts: &str) -> String {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.6f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(ts, fmt) {
            return t.format("%H:%M:%S").to_string();
        }
    }
    ts.to_string()
}
