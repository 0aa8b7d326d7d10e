//! End-to-end scenarios for the freshness layer and the coordinator
//!
//! All tests run on a paused Tokio clock, so timing properties are exact.
//!
//! Run with: cargo test --test scenarios

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::time::Instant;

use roomkeeper::config::AppConfig;
use roomkeeper::coordinator::{EventData, InstanceSnapshot, StoreCoordinator, SyncReport};
use roomkeeper::model::{InstanceId, Message, MessageId, ProducerId, Room, RoomId};
use roomkeeper::{FetchError, FreshnessLayer, ProducerBackend};

/// Serves a swappable room list and `min(limit, available)` messages
struct FakeProducer {
    rooms: Mutex<Vec<Room>>,
    available: usize,
    delay: Duration,
    room_calls: AtomicUsize,
    message_limits: Mutex<Vec<usize>>,
}

impl FakeProducer {
    fn new(rooms: &[&str]) -> Self {
        Self {
            rooms: Mutex::new(rooms.iter().map(|id| Room::new(*id)).collect()),
            available: 2000,
            delay: Duration::ZERO,
            room_calls: AtomicUsize::new(0),
            message_limits: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn replace_rooms(&self, rooms: &[&str]) {
        *self.rooms.lock().unwrap() = rooms.iter().map(|id| Room::new(*id)).collect();
    }

    fn room_calls(&self) -> usize {
        self.room_calls.load(Ordering::SeqCst)
    }

    fn message_limits(&self) -> Vec<usize> {
        self.message_limits.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProducerBackend for FakeProducer {
    async fn fetch_room_list(&self) -> Result<Vec<Room>, FetchError> {
        self.room_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.rooms.lock().unwrap().clone())
    }

    async fn fetch_messages(&self, room: &RoomId, limit: usize) -> Result<Vec<Message>, FetchError> {
        self.message_limits.lock().unwrap().push(limit);
        let count = limit.min(self.available);
        Ok((self.available - count..self.available)
            .map(|i| Message {
                id: MessageId::new(format!("${}", i)),
                room_id: room.clone(),
                sender: "@carol:example.org".to_string(),
                body: format!("message {}", i),
                timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
            })
            .collect())
    }
}

fn room_ids(rooms: &[Room]) -> Vec<&str> {
    rooms.iter().map(|room| room.id.as_str()).collect()
}

/// Room reads go straight to the cache: no freezing, no spacing
fn unstabilized_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.stabilization.duration_seconds = 0;
    config.governor.room_fetch_spacing_ms = 0;
    config.cache.room_list_ttl_seconds = 1;
    config
}

fn healthy() -> InstanceSnapshot {
    InstanceSnapshot::connected("@agent:example.org", "https://example.org")
}

#[tokio::test(start_paused = true)]
async fn concurrent_room_list_reads_share_one_fetch() {
    let layer = FreshnessLayer::new(&AppConfig::default());
    let backend = FakeProducer::new(&["!a", "!b"]).with_delay(Duration::from_millis(200));
    let producer = ProducerId::from("p1");

    let results =
        futures::future::join_all((0..8).map(|_| layer.get_stable_room_list(&producer, &backend))).await;

    assert_eq!(backend.room_calls(), 1);
    assert_eq!(room_ids(&results[0]), vec!["!a", "!b"]);
    assert!(results.iter().all(|rooms| Arc::ptr_eq(rooms, &results[0])));
}

#[tokio::test(start_paused = true)]
async fn stabilized_list_wins_over_newer_data() {
    let mut config = AppConfig::default();
    config.governor.room_fetch_spacing_ms = 0;
    config.governor.max_room_fetch_per_minute = 100;
    let layer = FreshnessLayer::new(&config);
    let backend = FakeProducer::new(&["!a", "!b"]);
    let producer = ProducerId::from("p1");

    let frozen = layer.get_stable_room_list(&producer, &backend).await;
    backend.replace_rooms(&["!c"]);

    // well past the cache TTL, well within the stabilization period
    tokio::time::advance(Duration::from_secs(120)).await;
    let later = layer.get_stable_room_list(&producer, &backend).await;

    assert_eq!(room_ids(&later), vec!["!a", "!b"]);
    assert_eq!(later.as_ref(), frozen.as_ref());
    assert_eq!(backend.room_calls(), 1);

    // a forced refresh lifts the freeze
    layer.force_refresh(Some(&producer)).await;
    let refreshed = layer.get_stable_room_list(&producer, &backend).await;
    assert_eq!(room_ids(&refreshed), vec!["!c"]);
}

#[tokio::test(start_paused = true)]
async fn room_cache_keeps_most_recent_writes() {
    let mut config = unstabilized_config();
    config.cache.max_room_lists = 3;
    config.governor.max_room_fetch_per_minute = 100;
    let layer = FreshnessLayer::new(&config);
    let backend = FakeProducer::new(&["!a"]);

    for i in 1..=5 {
        layer
            .get_stable_room_list(&ProducerId::new(format!("p{}", i)), &backend)
            .await;
        tokio::time::advance(Duration::from_millis(10)).await;
    }

    let stats = layer.get_cache_stats().await.room_cache;
    assert_eq!(stats.size, 3);
    let keys: Vec<&str> = stats.entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["p3", "p4", "p5"]);
}

#[tokio::test(start_paused = true)]
async fn governor_caps_room_fetches_per_minute() {
    let layer = FreshnessLayer::new(&unstabilized_config());
    let backend = FakeProducer::new(&["!a"]);
    let producer = ProducerId::from("p1");

    let mut results = Vec::new();
    for _ in 0..4 {
        results.push(layer.get_stable_room_list(&producer, &backend).await);
        tokio::time::advance(Duration::from_secs(2)).await;
    }

    // default cap is 2 per minute; later reads fall back to the stale entry
    assert_eq!(backend.room_calls(), 2);
    assert!(results.iter().all(|rooms| room_ids(rooms) == vec!["!a"]));
    let history = layer.get_cache_stats().await.fetch_history;
    assert_eq!(history.recent_room_fetches, 2);

    tokio::time::advance(Duration::from_secs(60)).await;
    layer.get_stable_room_list(&producer, &backend).await;
    assert_eq!(backend.room_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn progressive_backfill_grows_on_schedule() {
    let layer = FreshnessLayer::new(&AppConfig::default());
    let backend = Arc::new(FakeProducer::new(&[]));
    let room = RoomId::from("!history");
    let producer = ProducerId::from("p1");
    let start = Instant::now();

    let first = layer.get_stable_messages(&room, &producer, backend.clone()).await;
    assert_eq!(first.len(), 10);

    let cached = |layer: FreshnessLayer| async move {
        let stats = layer.get_cache_stats().await.message_cache;
        stats.entries.first().map_or(0, |entry| entry.item_count)
    };

    tokio::time::sleep_until(start + Duration::from_millis(1100)).await;
    assert!(cached(layer.clone()).await >= 30);

    tokio::time::sleep_until(start + Duration::from_millis(3100)).await;
    assert!(cached(layer.clone()).await >= 50);

    tokio::time::sleep_until(start + Duration::from_millis(8100)).await;
    assert_eq!(cached(layer.clone()).await, 1000);
    assert_eq!(backend.message_limits(), vec![10, 30, 50, 1000]);

    let full = layer.get_stable_messages(&room, &producer, backend.clone()).await;
    assert_eq!(full.len(), 1000);
    assert!(full.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test(start_paused = true)]
async fn primary_fields_win_over_secondary_rooms() {
    let coordinator = StoreCoordinator::start(AppConfig::default().coordinator, None);
    let a = InstanceId::from("a");
    let b = InstanceId::from("b");
    coordinator
        .register(a.clone(), healthy().with_rooms(vec![Room::new("!lobby")]), 8)
        .await;
    coordinator.register(b.clone(), healthy(), 3).await;
    assert_eq!(coordinator.primary().await, Some(a.clone()));

    coordinator
        .handle_event(b.clone(), EventData::rooms(vec![Room::new("!new").with_name("from b")]))
        .await
        .unwrap();
    let view = coordinator.snapshot(&a).await.unwrap();
    assert_eq!(room_ids(&view.rooms), vec!["!lobby", "!new"]);

    coordinator
        .handle_event(a.clone(), EventData::rooms(vec![Room::new("!new").with_name("from a")]))
        .await
        .unwrap();
    coordinator
        .handle_event(b.clone(), EventData::rooms(vec![Room::new("!new").with_name("stale b")]))
        .await
        .unwrap();

    let view = coordinator.snapshot(&a).await.unwrap();
    let merged = view.rooms.iter().find(|room| room.id.as_str() == "!new").unwrap();
    assert_eq!(merged.name.as_deref(), Some("from a"));
}

#[tokio::test(start_paused = true)]
async fn error_event_fails_over_within_one_step() {
    let coordinator = StoreCoordinator::start(AppConfig::default().coordinator, None);
    let a = InstanceId::from("a");
    let b = InstanceId::from("b");
    coordinator.register(a.clone(), healthy(), 8).await;
    coordinator.register(b.clone(), healthy(), 3).await;

    coordinator
        .handle_event(a.clone(), EventData::error("connection lost"))
        .await
        .unwrap();
    assert_eq!(coordinator.primary().await, Some(b.clone()));

    coordinator
        .handle_event(b.clone(), EventData::error("connection lost"))
        .await
        .unwrap();
    let status = coordinator.get_coordination_status().await;
    assert_eq!(status.primary_store, None);
    assert_eq!(status.active_stores, 0);
}

#[tokio::test(start_paused = true)]
async fn primary_sync_loads_rooms_and_messages_through_layer() {
    let config = AppConfig::default();
    let layer = FreshnessLayer::new(&config);
    let coordinator = StoreCoordinator::start(config.coordinator.clone(), Some(layer.clone()));
    let a = InstanceId::from("a");
    let backend = Arc::new(FakeProducer::new(&["!one", "!two", "!three"]));
    coordinator.register(a.clone(), healthy(), 8).await;
    coordinator.attach_backend(&a, backend.clone()).await.unwrap();

    coordinator
        .handle_event(a.clone(), EventData::Sync(SyncReport::with_room_count(3)))
        .await
        .unwrap();

    let view = coordinator.snapshot(&a).await.unwrap();
    assert_eq!(room_ids(&view.rooms), vec!["!one", "!two", "!three"]);
    assert_eq!(view.messages.len(), 3);
    assert!(view.messages.values().all(|list| list.len() == 10));

    let status = coordinator.get_coordination_status().await;
    let cache = status.cache.unwrap();
    assert_eq!(cache.fetch_history.room_fetches, 1);
    assert_eq!(cache.fetch_history.message_fetches, 3);
    assert_eq!(status.last_sync.unwrap().report.room_count, 3);
}
