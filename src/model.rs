//! Session data types shared by the freshness layer and the coordinator.
//!
//! Identifiers are string newtypes so that a producer id can never be passed
//! where a room id is expected. [`RoomKey`] is the composite key for
//! per-room message caches and [`CacheKey`] names any cache key together with
//! its fetch class.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifies a producer module and its cached room list
    ProducerId
);
string_id!(
    /// Backend room identifier
    RoomId
);
string_id!(
    /// Opaque message identifier; the only basis for de-duplication
    MessageId
);
string_id!(
    /// Identifies a registered coordinator instance
    InstanceId
);

impl From<&InstanceId> for ProducerId {
    fn from(id: &InstanceId) -> Self {
        ProducerId(id.0.clone())
    }
}

/// Composite key for a producer's view of one room
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    pub producer: ProducerId,
    pub room: RoomId,
}

impl RoomKey {
    pub fn new(producer: ProducerId, room: RoomId) -> Self {
        Self { producer, room }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.producer, self.room)
    }
}

/// The two independently governed kinds of backend fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchClass {
    RoomList,
    Messages,
}

impl fmt::Display for FetchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchClass::RoomList => write!(f, "room_list"),
            FetchClass::Messages => write!(f, "messages"),
        }
    }
}

/// Any cache key, tagged with its class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    RoomList(ProducerId),
    Messages(RoomKey),
}

impl CacheKey {
    pub fn class(&self) -> FetchClass {
        match self {
            CacheKey::RoomList(_) => FetchClass::RoomList,
            CacheKey::Messages(_) => FetchClass::Messages,
        }
    }

    pub fn producer(&self) -> &ProducerId {
        match self {
            CacheKey::RoomList(producer) => producer,
            CacheKey::Messages(key) => &key.producer,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::RoomList(producer) => write!(f, "rooms:{}", producer),
            CacheKey::Messages(key) => write!(f, "messages:{}", key),
        }
    }
}

/// Room metadata as seen by one producer.
///
/// Every field except `id` is optional so that partial updates can be merged
/// field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_space: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_encrypted: Option<bool>,
}

impl Room {
    pub fn new(id: impl Into<RoomId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overwrite every field that `other` carries; keep the rest
    pub fn merge_from(&mut self, other: &Room) {
        fn take<T: Clone>(field: &mut Option<T>, incoming: &Option<T>) {
            if incoming.is_some() {
                field.clone_from(incoming);
            }
        }
        take(&mut self.name, &other.name);
        take(&mut self.topic, &other.topic);
        take(&mut self.avatar_url, &other.avatar_url);
        take(&mut self.unread_count, &other.unread_count);
        take(&mut self.member_count, &other.member_count);
        take(&mut self.last_activity, &other.last_activity);
        take(&mut self.is_space, &other.is_space);
        take(&mut self.is_encrypted, &other.is_encrypted);
    }
}

/// Insert `room` if no room with its id exists, otherwise merge it field-wise.
/// Returns true when a new room was inserted.
pub fn upsert_room(rooms: &mut Vec<Room>, room: &Room) -> bool {
    match rooms.iter_mut().find(|r| r.id == room.id) {
        Some(existing) => {
            existing.merge_from(room);
            false
        }
        None => {
            rooms.push(room.clone());
            true
        }
    }
}

/// Insert `room` only if no room with its id exists.
/// Returns true when the room was added.
pub fn insert_room_if_absent(rooms: &mut Vec<Room>, room: &Room) -> bool {
    if rooms.iter().any(|r| r.id == room.id) {
        return false;
    }
    rooms.push(room.clone());
    true
}

/// A single timeline message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Merge `incoming` into `existing`, skipping ids already present, then sort
/// by timestamp ascending. Returns the number of messages added.
pub fn merge_messages(existing: &mut Vec<Message>, incoming: &[Message]) -> usize {
    let mut added = 0;
    for message in incoming {
        if existing.iter().any(|m| m.id == message.id) {
            continue;
        }
        existing.push(message.clone());
        added += 1;
    }
    if added > 0 {
        existing.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }
    added
}
