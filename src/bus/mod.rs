//! Observer messaging
//!
//! Every message leaving the player goes through the [`ConnectionBroadcaster`]
//! as a typed [`BusMessage`]. Observers register under a [`Category`] and only
//! receive what is sent to that category (or to all categories).

mod broadcaster;

pub use broadcaster::{
    create_broadcaster, ChannelConnection, Connection, ConnectionBroadcaster, ConnectionId,
    DeliveryError, SharedBroadcaster,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::TrackId;
use crate::player::PlaybackState;
use crate::upload::UploadStatus;

/// Observer category a connection registers under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Player,
    Signage,
    System,
    Upload,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Player,
        Category::Signage,
        Category::System,
        Category::Upload,
    ];

    /// Parse a category from its wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "player" => Some(Self::Player),
            "signage" => Some(Self::Signage),
            "system" => Some(Self::System),
            "upload" => Some(Self::Upload),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Player => "player",
            Self::Signage => "signage",
            Self::System => "system",
            Self::Upload => "upload",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transport event announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Playing,
    Paused,
    Stopped,
    QueueExhausted,
    /// Track played to the end on its own
    Finished,
    Error,
}

/// Message delivered to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BusMessage {
    /// Periodic playback snapshot
    Status {
        track_id: Option<TrackId>,
        state: PlaybackState,
        position_seconds: f64,
        timestamp: DateTime<Utc>,
    },
    /// Transport transition or failure
    Event { kind: EventKind, detail: String },
    /// Direct reply to a command sent over a connection
    Response { ok: bool, message: String },
    /// Chunked upload progress
    UploadProgress {
        upload_id: String,
        progress: f64,
        status: UploadStatus,
    },
    /// Operator alert fanned out to every category
    Alert { message: String, level: String },
}

impl BusMessage {
    pub fn event(kind: EventKind, detail: impl Into<String>) -> Self {
        Self::Event {
            kind,
            detail: detail.into(),
        }
    }

    pub fn response(ok: bool, message: impl Into<String>) -> Self {
        Self::Response {
            ok,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_message_wire_shape() {
        let timestamp = Utc::now();
        let msg = BusMessage::Status {
            track_id: Some(7),
            state: PlaybackState::Playing,
            position_seconds: 1.5,
            timestamp,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["trackId"], 7);
        assert_eq!(value["state"], "playing");
        assert_eq!(value["positionSeconds"], 1.5);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn event_message_wire_shape() {
        let msg = BusMessage::event(EventKind::QueueExhausted, "No more tracks in playlist");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "event", "kind": "queue_exhausted", "detail": "No more tracks in playlist"})
        );
    }

    #[test]
    fn upload_progress_uses_camel_case_fields() {
        let msg = BusMessage::UploadProgress {
            upload_id: "abc".to_string(),
            progress: 50.0,
            status: UploadStatus::Receiving,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "upload_progress");
        assert_eq!(value["uploadId"], "abc");
        assert_eq!(value["status"], "receiving");
    }

    #[test]
    fn category_parse_round_trips_names() {
        for category in Category::ALL {
            assert_eq!(Category::parse(category.as_str()), Some(category));
        }
        assert_eq!(Category::parse("admin"), None);
    }
}
