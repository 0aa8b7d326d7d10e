//! Registered producer instances, their health and primary election

use std::cmp::Reverse;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::model::{InstanceId, Message, Room, RoomId};

/// Sync loop state reported by a producer's client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Stopped,
    Prepared,
    Syncing,
    Running,
    Catchup,
    Reconnecting,
    Error,
}

impl SyncState {
    /// States in which the client can answer queries
    pub fn is_queryable(&self) -> bool {
        matches!(self, SyncState::Prepared | SyncState::Syncing | SyncState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub sync_state: SyncState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub homeserver: String,
}

/// A producer's view of the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    #[serde(default)]
    pub client: Option<ClientState>,
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub messages: HashMap<RoomId, Vec<Message>>,
    #[serde(default)]
    pub connection: Option<ConnectionInfo>,
}

impl InstanceSnapshot {
    /// A snapshot with a running client connected to `homeserver`
    pub fn connected(user_id: impl Into<String>, homeserver: impl Into<String>) -> Self {
        Self {
            client: Some(ClientState {
                user_id: user_id.into(),
                device_id: None,
                sync_state: SyncState::Running,
            }),
            connection: Some(ConnectionInfo {
                homeserver: homeserver.into(),
            }),
            ..Default::default()
        }
    }

    pub fn with_rooms(mut self, rooms: Vec<Room>) -> Self {
        self.rooms = rooms;
        self
    }

    pub fn with_sync_state(mut self, sync_state: SyncState) -> Self {
        if let Some(client) = self.client.as_mut() {
            client.sync_state = sync_state;
        }
        self
    }

    /// Client present and queryable, connected to a named homeserver
    pub fn is_healthy(&self) -> bool {
        let client_ok = self
            .client
            .as_ref()
            .is_some_and(|client| client.sync_state.is_queryable());
        let connection_ok = self
            .connection
            .as_ref()
            .is_some_and(|conn| !conn.homeserver.trim().is_empty());
        client_ok && connection_ok
    }

    pub fn message_count(&self) -> usize {
        self.messages.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct StoreInstance {
    pub id: InstanceId,
    pub priority: i32,
    pub is_active: bool,
    pub last_activity: Instant,
    /// Registration order; the election tie-break
    pub registered_seq: u64,
    pub recovery_attempts: u32,
    pub recovery_exhausted: bool,
    pub snapshot: InstanceSnapshot,
}

impl StoreInstance {
    pub fn new(id: InstanceId, snapshot: InstanceSnapshot, priority: i32, registered_seq: u64) -> Self {
        Self {
            id,
            priority,
            is_active: true,
            last_activity: Instant::now(),
            registered_seq,
            recovery_attempts: 0,
            recovery_exhausted: false,
            snapshot,
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.is_active && self.snapshot.is_healthy()
    }
}

/// Pick the primary: the eligible instance with the highest priority,
/// earliest registration on ties
pub fn elect(instances: &HashMap<InstanceId, StoreInstance>) -> Option<InstanceId> {
    instances
        .values()
        .filter(|instance| instance.is_eligible())
        .max_by_key(|instance| (instance.priority, Reverse(instance.registered_seq)))
        .map(|instance| instance.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, priority: i32, seq: u64, healthy: bool) -> StoreInstance {
        let snapshot = if healthy {
            InstanceSnapshot::connected("@u:example.org", "https://example.org")
        } else {
            InstanceSnapshot::default()
        };
        StoreInstance::new(InstanceId::from(id), snapshot, priority, seq)
    }

    fn registry(instances: Vec<StoreInstance>) -> HashMap<InstanceId, StoreInstance> {
        instances.into_iter().map(|i| (i.id.clone(), i)).collect()
    }

    #[test]
    fn test_health_requires_client_state_and_homeserver() {
        let healthy = InstanceSnapshot::connected("@u:example.org", "https://example.org");
        assert!(healthy.is_healthy());
        assert!(!healthy.clone().with_sync_state(SyncState::Error).is_healthy());
        assert!(!healthy.clone().with_sync_state(SyncState::Stopped).is_healthy());

        let mut no_homeserver = healthy.clone();
        no_homeserver.connection = Some(ConnectionInfo {
            homeserver: "  ".to_string(),
        });
        assert!(!no_homeserver.is_healthy());
        assert!(!InstanceSnapshot::default().is_healthy());
    }

    #[test]
    fn test_highest_priority_wins() {
        let instances = registry(vec![instance("a", 8, 1, true), instance("b", 3, 0, true)]);
        assert_eq!(elect(&instances), Some(InstanceId::from("a")));
    }

    #[test]
    fn test_tie_goes_to_earliest_registration() {
        let instances = registry(vec![instance("late", 5, 7, true), instance("early", 5, 2, true)]);
        assert_eq!(elect(&instances), Some(InstanceId::from("early")));
    }

    #[test]
    fn test_inactive_and_unhealthy_are_skipped() {
        let mut a = instance("a", 9, 0, true);
        a.is_active = false;
        let instances = registry(vec![a, instance("b", 7, 1, false), instance("c", 1, 2, true)]);
        assert_eq!(elect(&instances), Some(InstanceId::from("c")));
    }

    #[test]
    fn test_no_eligible_instance() {
        let instances = registry(vec![instance("a", 9, 0, false)]);
        assert_eq!(elect(&instances), None);
    }
}
