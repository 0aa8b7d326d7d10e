//! Coordination events, notices and errors

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::instance::SyncState;
use crate::model::{InstanceId, Message, Room, RoomId};

/// Sync progress reported by a producer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub room_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_state: Option<SyncState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<String>,
}

impl SyncReport {
    pub fn with_room_count(room_count: usize) -> Self {
        Self {
            room_count,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    Sync(SyncReport),
    Room { rooms: Vec<Room> },
    Message { room_id: RoomId, messages: Vec<Message> },
    Error { reason: String },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::Sync(_) => EventKind::Sync,
            EventData::Room { .. } => EventKind::Room,
            EventData::Message { .. } => EventKind::Message,
            EventData::Error { .. } => EventKind::Error,
        }
    }

    pub fn rooms(rooms: Vec<Room>) -> Self {
        EventData::Room { rooms }
    }

    pub fn messages(room_id: impl Into<RoomId>, messages: Vec<Message>) -> Self {
        EventData::Message {
            room_id: room_id.into(),
            messages,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        EventData::Error {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Sync,
    Room,
    Message,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Sync => write!(f, "sync"),
            EventKind::Room => write!(f, "room"),
            EventKind::Message => write!(f, "message"),
            EventKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinationEvent {
    pub id: Uuid,
    pub source: InstanceId,
    pub data: EventData,
    pub received_at: DateTime<Utc>,
}

impl CoordinationEvent {
    pub fn new(source: InstanceId, data: EventData) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            data,
            received_at: Utc::now(),
        }
    }
}

/// Queue entry; `ack` fires once the worker has processed the event
pub(super) struct QueuedEvent {
    pub event: CoordinationEvent,
    pub ack: Option<oneshot::Sender<()>>,
}

/// Broadcast to subscribed producers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum CoordinatorNotice {
    PrimaryChanged {
        previous: Option<InstanceId>,
        current: Option<InstanceId>,
    },
    /// A sync report from the primary; secondaries must not act on it
    SyncAdvisory { source: InstanceId, report: SyncReport },
    RoomsUpdated { source: InstanceId, rooms: Vec<Room> },
    MessagesMerged { room_id: RoomId, added: usize },
    InstanceDeactivated { id: InstanceId, reason: String },
    InstanceRecovered { id: InstanceId },
    RecoveryExhausted { id: InstanceId, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("instance {0} is inactive")]
    InstanceInactive(InstanceId),

    #[error("instance {0} is unhealthy")]
    InstanceUnhealthy(InstanceId),

    #[error("coordinator event queue is closed")]
    QueueClosed,

    #[error("coordinator event queue is full")]
    QueueFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind() {
        assert_eq!(EventData::Sync(SyncReport::default()).kind(), EventKind::Sync);
        assert_eq!(EventData::rooms(vec![]).kind(), EventKind::Room);
        assert_eq!(EventData::messages("!r", vec![]).kind(), EventKind::Message);
        assert_eq!(EventData::error("boom").kind().to_string(), "error");
    }

    #[test]
    fn test_event_data_serializes_with_type_tag() {
        let json = serde_json::to_value(EventData::error("sync failed")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["reason"], "sync failed");

        let json = serde_json::to_value(EventData::Sync(SyncReport::with_room_count(3))).unwrap();
        assert_eq!(json["type"], "sync");
        assert_eq!(json["room_count"], 3);
    }

    #[test]
    fn test_events_get_unique_ids() {
        let a = CoordinationEvent::new("a".into(), EventData::error("x"));
        let b = CoordinationEvent::new("a".into(), EventData::error("x"));
        assert_ne!(a.id, b.id);
    }
}
