//! Freshness layer
//!
//! Composes the fetch governor, cache store, stabilizer, progressive loader
//! and in-flight de-duplicator behind one clone-able service. Every read
//! resolves to data: a fetch failure or a governor refusal falls back to the
//! last cached value, then to an empty list.
//!
//! All mutable state lives behind a single mutex that is never held across a
//! backend call or a timer.

pub mod governor;
pub mod inflight;
pub mod progressive;
pub mod stabilizer;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;

use crate::backend::{FetchError, ProducerBackend};
use crate::config::{AppConfig, CacheConfig, GovernorConfig, ProgressiveConfig, StabilizationConfig};
use crate::model::{CacheKey, Message, ProducerId, Room, RoomKey};

use governor::{FetchGovernor, FetchHistoryStats};
use inflight::InFlight;
use progressive::{LoadingState, ProgressiveStats};
use stabilizer::{StabilizationStats, Stabilizer};
use store::{CacheClassStats, CacheStore};

/// Where a read was served from, recorded on the request span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    Stabilized,
    Cache,
    Coalesced,
    Fetched,
    Loading,
    Stale,
    Empty,
}

impl ServedFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServedFrom::Stabilized => "stabilized",
            ServedFrom::Cache => "cache",
            ServedFrom::Coalesced => "coalesced",
            ServedFrom::Fetched => "fetched",
            ServedFrom::Loading => "loading",
            ServedFrom::Stale => "stale",
            ServedFrom::Empty => "empty",
        }
    }
}

/// The subset of [`AppConfig`] the layer runs on
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayerSettings {
    pub cache: CacheConfig,
    pub governor: GovernorConfig,
    pub stabilization: StabilizationConfig,
    pub progressive: ProgressiveConfig,
}

impl From<&AppConfig> for LayerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            cache: config.cache.clone(),
            governor: config.governor.clone(),
            stabilization: config.stabilization.clone(),
            progressive: config.progressive.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InFlightStats {
    pub room_lists: usize,
    pub messages: usize,
}

/// Side-effect free snapshot of the layer's state
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub room_cache: CacheClassStats,
    pub message_cache: CacheClassStats,
    pub stabilized_rooms: StabilizationStats,
    pub progressive_loading: ProgressiveStats,
    pub fetch_history: FetchHistoryStats,
    pub in_flight: InFlightStats,
    pub config: LayerSettings,
}

impl CacheStats {
    pub fn total_hits(&self) -> u64 {
        self.room_cache.total_hits() + self.message_cache.total_hits()
    }

    /// Share of reads answered by the cache: hits / (hits + fetches)
    pub fn cache_efficiency(&self) -> f64 {
        let hits = self.total_hits() as f64;
        let fetches = (self.fetch_history.room_fetches + self.fetch_history.message_fetches) as f64;
        if hits + fetches == 0.0 {
            return 0.0;
        }
        hits / (hits + fetches)
    }
}

/// Refresh sequence numbers, so that a fetch started before a refresh does
/// not write its result afterwards
#[derive(Debug, Default)]
struct RefreshMarks {
    seq: u64,
    global: u64,
    producers: HashMap<ProducerId, u64>,
}

impl RefreshMarks {
    fn current(&self) -> u64 {
        self.seq
    }

    fn mark(&mut self, producer: Option<&ProducerId>) {
        self.seq += 1;
        match producer {
            Some(producer) => {
                self.producers.insert(producer.clone(), self.seq);
            }
            None => {
                self.global = self.seq;
                self.producers.clear();
            }
        }
    }

    fn refreshed_since(&self, producer: &ProducerId, seq: u64) -> bool {
        self.global > seq || self.producers.get(producer).is_some_and(|&at| at > seq)
    }
}

struct LayerState {
    settings: LayerSettings,
    room_cache: CacheStore<ProducerId, Vec<Room>>,
    message_cache: CacheStore<RoomKey, Vec<Message>>,
    governor: FetchGovernor,
    stabilizer: Stabilizer,
    room_flights: InFlight<ProducerId, Vec<Room>>,
    message_flights: InFlight<RoomKey, Vec<Message>>,
    loading: HashMap<RoomKey, LoadingState>,
    next_generation: u64,
    refresh: RefreshMarks,
    disposed: bool,
}

impl LayerState {
    fn new(settings: LayerSettings) -> Self {
        Self {
            room_cache: CacheStore::new(settings.cache.room_list_ttl(), settings.cache.max_room_lists),
            message_cache: CacheStore::new(
                settings.cache.message_ttl(),
                settings.cache.max_message_lists,
            ),
            governor: FetchGovernor::new(&settings.governor),
            stabilizer: Stabilizer::new(settings.stabilization.duration()),
            room_flights: InFlight::new(),
            message_flights: InFlight::new(),
            loading: HashMap::new(),
            next_generation: 1,
            refresh: RefreshMarks::default(),
            disposed: false,
            settings,
        }
    }

    fn room_fallback(&self, producer: &ProducerId) -> (Arc<Vec<Room>>, ServedFrom) {
        match self.room_cache.last_known(producer) {
            Some(rooms) => (rooms, ServedFrom::Stale),
            None => (Arc::new(Vec::new()), ServedFrom::Empty),
        }
    }

    fn message_fallback(&self, key: &RoomKey) -> (Arc<Vec<Message>>, ServedFrom) {
        match self.message_cache.last_known(key) {
            Some(messages) => (messages, ServedFrom::Stale),
            None => (Arc::new(Vec::new()), ServedFrom::Empty),
        }
    }

    /// Forget the loading state of message lists the cache evicted
    fn drop_evicted(&mut self) {
        self.room_cache.take_evicted();
        for key in self.message_cache.take_evicted() {
            if self.loading.remove(&key).is_some() {
                tracing::debug!(%key, "Dropped loading state of evicted messages");
            }
        }
    }

    fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Drop everything cached or pending for one producer.
    /// Removing a loading state cancels its background task.
    async fn forget_producer(&mut self, producer: &ProducerId) {
        self.room_cache.remove(producer);
        self.stabilizer.remove(producer).await;
        self.message_cache.retain(|key| &key.producer != producer);
        self.loading.retain(|key, _| &key.producer != producer);
        self.room_flights.forget_where(|key| key == producer);
        self.message_flights.forget_where(|key| &key.producer == producer);
        self.governor.forget_where(|key| key.producer() == producer);
        self.refresh.mark(Some(producer));
    }

    fn forget_all(&mut self) {
        self.room_cache.clear();
        self.message_cache.clear();
        self.stabilizer.clear();
        self.loading.clear();
        self.room_flights.clear();
        self.message_flights.clear();
        self.governor.clear();
        self.refresh.mark(None);
    }
}

/// The data-freshness service shared by every producer
#[derive(Clone)]
pub struct FreshnessLayer {
    state: Arc<Mutex<LayerState>>,
}

impl FreshnessLayer {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(LayerState::new(LayerSettings::from(config)))),
        }
    }

    /// Room list for `producer`: stabilized snapshot, fresh cache, a shared
    /// or governed fetch, then stale cache or an empty list
    #[instrument(
        name = "freshness.get_stable_room_list",
        skip_all,
        fields(producer = %producer, served_from, duration_ms)
    )]
    pub async fn get_stable_room_list(
        &self,
        producer: &ProducerId,
        backend: &dyn ProducerBackend,
    ) -> Arc<Vec<Room>> {
        let start = Instant::now();
        let (rooms, served_from) = self.resolve_room_list(producer, backend).await;

        let span = tracing::Span::current();
        span.record("served_from", served_from.as_str());
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        rooms
    }

    async fn resolve_room_list(
        &self,
        producer: &ProducerId,
        backend: &dyn ProducerBackend,
    ) -> (Arc<Vec<Room>>, ServedFrom) {
        let stabilizer = {
            let state = self.state.lock().await;
            if state.disposed {
                return (Arc::new(Vec::new()), ServedFrom::Empty);
            }
            state.stabilizer.clone()
        };
        if let Some(rooms) = stabilizer.get_stabilized(producer, Instant::now()).await {
            return (rooms, ServedFrom::Stabilized);
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some(rooms) = state.room_cache.get(producer, now) {
            return (rooms, ServedFrom::Cache);
        }

        let timeout = state.settings.cache.fetch_timeout();
        if let Some(rx) = state.room_flights.join(producer, timeout, now) {
            drop(state);
            return match inflight::wait(rx, timeout).await {
                Ok(rooms) => (rooms, ServedFrom::Coalesced),
                Err(error) => {
                    tracing::debug!(%producer, %error, "Coalesced room list fetch failed");
                    self.state.lock().await.room_fallback(producer)
                }
            };
        }

        let key = CacheKey::RoomList(producer.clone());
        if let Err(refusal) = state.governor.check(&key, now) {
            tracing::debug!(%producer, ?refusal, "Room list fetch refused by governor");
            return state.room_fallback(producer);
        }

        state.governor.record_fetch(&key, now);
        let ticket = state.room_flights.lead(producer.clone(), now);
        let expected = state.room_cache.version(producer);
        let refresh_seq = state.refresh.current();
        drop(state);

        let result = match tokio::time::timeout(timeout, backend.fetch_room_list()).await {
            Ok(result) => result.map(Arc::new),
            Err(_) => Err(FetchError::Timeout),
        };

        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.room_flights.complete(producer, ticket, result.clone());

        match result {
            Ok(rooms) => {
                if state.refresh.refreshed_since(producer, refresh_seq) {
                    tracing::debug!(%producer, "Discarding room list fetched before a refresh");
                } else if state
                    .room_cache
                    .set_if_version(producer.clone(), rooms.clone(), expected, now)
                {
                    state.drop_evicted();
                    state.stabilizer.stabilize(producer, &rooms, now).await;
                    tracing::info!(%producer, room_count = rooms.len(), "Fetched room list");
                } else {
                    tracing::debug!(%producer, "Fetched room list superseded by a newer write");
                }
                (rooms, ServedFrom::Fetched)
            }
            Err(error) => {
                tracing::warn!(%producer, %error, "Room list fetch failed, serving fallback");
                state.room_fallback(producer)
            }
        }
    }

    /// Clear cache, stabilization, loading and in-flight state for one
    /// producer, or for everything (including fetch history) when `None`
    #[instrument(name = "freshness.force_refresh", skip(self))]
    pub async fn force_refresh(&self, producer: Option<&ProducerId>) {
        let mut state = self.state.lock().await;
        match producer {
            Some(producer) => {
                state.forget_producer(producer).await;
                tracing::info!(%producer, "Forced refresh for producer");
            }
            None => {
                state.forget_all();
                tracing::info!("Forced global refresh");
            }
        }
    }

    /// Introspection only; reads do not count as cache hits
    pub async fn get_cache_stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let now = Instant::now();
        CacheStats {
            room_cache: state.room_cache.stats(now),
            message_cache: state.message_cache.stats(now),
            stabilized_rooms: state.stabilizer.stats(now),
            progressive_loading: progressive::stats(&state.loading, now),
            fetch_history: state.governor.stats(now),
            in_flight: InFlightStats {
                room_lists: state.room_flights.len(),
                messages: state.message_flights.len(),
            },
            config: state.settings.clone(),
        }
    }

    /// Apply new TTLs, capacities, governor limits and stabilization window.
    /// Stage plans apply to loads started afterwards.
    #[instrument(name = "freshness.update_config", skip_all)]
    pub async fn update_config(&self, config: &AppConfig) {
        let settings = LayerSettings::from(config);
        let mut state = self.state.lock().await;
        let now = Instant::now();

        state
            .room_cache
            .reconfigure(settings.cache.room_list_ttl(), settings.cache.max_room_lists);
        state
            .message_cache
            .reconfigure(settings.cache.message_ttl(), settings.cache.max_message_lists);
        state.drop_evicted();
        state.governor.set_limits(&settings.governor);
        if settings.stabilization != state.settings.stabilization {
            state.stabilizer = state
                .stabilizer
                .with_duration(settings.stabilization.duration(), now)
                .await;
        }
        state.settings = settings;
        tracing::info!("Freshness layer configuration updated");
    }

    pub async fn settings(&self) -> LayerSettings {
        self.state.lock().await.settings.clone()
    }

    /// Drop all state; a disposed layer serves again afterwards
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.forget_all();
        state.disposed = false;
        tracing::info!("Freshness layer reset");
    }

    /// Cancel all background work; later reads return empty lists without
    /// touching the backend
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        state.forget_all();
        state.disposed = true;
        tracing::info!("Freshness layer disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RoomId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingBackend {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingBackend {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProducerBackend for CountingBackend {
        async fn fetch_room_list(&self) -> Result<Vec<Room>, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(FetchError::backend("unavailable"));
            }
            Ok(vec![Room::new(format!("!room{}", n))])
        }

        async fn fetch_messages(&self, _room: &RoomId, _limit: usize) -> Result<Vec<Message>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn layer() -> FreshnessLayer {
        FreshnessLayer::new(&AppConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_read_is_served_from_stabilized_snapshot() {
        let layer = layer();
        let backend = CountingBackend::new();
        let producer = ProducerId::from("p1");

        let first = layer.get_stable_room_list(&producer, &backend).await;
        let second = layer.get_stable_room_list(&producer, &backend).await;

        assert_eq!(backend.calls(), 1);
        assert_eq!(first.as_ref(), second.as_ref());
        assert_eq!(layer.get_cache_stats().await.stabilized_rooms.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_falls_back_to_empty() {
        let layer = layer();
        let backend = CountingBackend {
            fail: true,
            ..CountingBackend::new()
        };
        let rooms = layer.get_stable_room_list(&"p1".into(), &backend).await;
        assert!(rooms.is_empty());
        // the failed attempt still counts toward the governor
        assert_eq!(layer.get_cache_stats().await.fetch_history.room_fetches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_times_out() {
        let layer = layer();
        let backend = CountingBackend {
            delay: Duration::from_secs(120),
            ..CountingBackend::new()
        };
        let rooms = layer.get_stable_room_list(&"p1".into(), &backend).await;
        assert!(rooms.is_empty());
        assert_eq!(layer.get_cache_stats().await.in_flight.room_lists, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_for_one_producer() {
        let layer = layer();
        let backend = CountingBackend::new();
        let p1 = ProducerId::from("p1");
        let p2 = ProducerId::from("p2");
        layer.get_stable_room_list(&p1, &backend).await;
        layer.get_stable_room_list(&p2, &backend).await;

        layer.force_refresh(Some(&p1)).await;
        let stats = layer.get_cache_stats().await;
        assert_eq!(stats.room_cache.size, 1);
        assert_eq!(stats.stabilized_rooms.count, 1);
        assert_eq!(stats.fetch_history.room_fetches, 2);

        // spacing for p1 was forgotten, but the class cap of 2/min still holds
        let rooms = layer.get_stable_room_list(&p1, &backend).await;
        assert!(rooms.is_empty());
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_refresh_clears_history() {
        let layer = layer();
        let backend = CountingBackend::new();
        layer.get_stable_room_list(&"p1".into(), &backend).await;
        layer.force_refresh(None).await;

        let stats = layer.get_cache_stats().await;
        assert_eq!(stats.room_cache.size, 0);
        assert_eq!(stats.fetch_history.room_fetches, 0);

        layer.get_stable_room_list(&"p1".into(), &backend).await;
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_disables_stabilization() {
        let layer = layer();
        let backend = CountingBackend::new();
        let producer = ProducerId::from("p1");
        layer.get_stable_room_list(&producer, &backend).await;

        let mut config = AppConfig::default();
        config.stabilization.duration_seconds = 0;
        config.cache.room_list_ttl_seconds = 1;
        config.governor.room_fetch_spacing_ms = 0;
        layer.update_config(&config).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        let rooms = layer.get_stable_room_list(&producer, &backend).await;
        assert_eq!(backend.calls(), 2);
        assert_eq!(rooms[0].id.as_str(), "!room1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_fetching() {
        let layer = layer();
        let backend = CountingBackend::new();
        layer.dispose().await;
        assert!(layer.get_stable_room_list(&"p1".into(), &backend).await.is_empty());
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn test_cache_efficiency() {
        let mut stats = CacheStats::default();
        assert_eq!(stats.cache_efficiency(), 0.0);
        stats.fetch_history.room_fetches = 1;
        stats.room_cache.entries.push(store::EntryStats {
            key: "p1".to_string(),
            item_count: 1,
            age_ms: 0,
            hits: 3,
            version: 1,
            expired: false,
        });
        assert_eq!(stats.cache_efficiency(), 0.75);
    }
}
