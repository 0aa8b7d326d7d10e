//! Simulated producers driving a freshness layer and a coordinator.
//!
//! Each producer serves a deterministic room list and message history after a
//! short latency. Readers hit the layer every tick, producers push live
//! events, and the primary is knocked over and brought back to exercise
//! failover and recovery. A monitor task logs cache metrics periodically.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::backend::{FetchError, ProducerBackend};
use crate::config::AppConfig;
use crate::coordinator::{
    CoordinationStatus, CoordinatorError, EventData, InstanceSnapshot, StoreCoordinator, SyncReport,
    SyncState,
};
use crate::error::AppError;
use crate::freshness::{CacheStats, FreshnessLayer};
use crate::model::{InstanceId, Message, MessageId, ProducerId, Room, RoomId};

const SIM_HOMESERVER: &str = "https://sim.example.org";

/// Messages each simulated room has in its history
const SIM_HISTORY_LEN: usize = 120;

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub duration: Duration,
    pub producers: usize,
    pub rooms: usize,
    pub tick: Duration,
    pub metrics_interval: Duration,
    pub latency: Duration,
    /// Fail the primary this long after start (None: never)
    pub fail_primary_after: Option<Duration>,
    /// Restore the failed primary this long after it failed
    pub recover_after: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            producers: 3,
            rooms: 8,
            tick: Duration::from_millis(500),
            metrics_interval: Duration::from_secs(5),
            latency: Duration::from_millis(50),
            fail_primary_after: Some(Duration::from_secs(10)),
            recover_after: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub elapsed_ms: u64,
    pub ticks: u64,
    pub reads: u64,
    pub backend_calls: u64,
    pub cache_efficiency: f64,
    pub cache: CacheStats,
    pub coordination: CoordinationStatus,
}

/// A producer backend serving generated data
pub struct SimulatedBackend {
    rooms: usize,
    latency: Duration,
    base_time: DateTime<Utc>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl SimulatedBackend {
    pub fn new(rooms: usize, latency: Duration) -> Self {
        Self {
            rooms,
            latency,
            base_time: Utc::now(),
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::backend("simulated producer is down"));
        }
        Ok(())
    }

    fn message(&self, room: &RoomId, n: usize) -> Message {
        Message {
            id: MessageId::new(format!("${}-{}", room, n)),
            room_id: room.clone(),
            sender: format!("@user{}:sim.example.org", n % 5),
            body: format!("message {} in {}", n, room),
            timestamp: self.base_time + chrono::Duration::seconds(n as i64),
        }
    }
}

#[async_trait]
impl ProducerBackend for SimulatedBackend {
    async fn fetch_room_list(&self) -> Result<Vec<Room>, FetchError> {
        self.respond().await?;
        Ok((0..self.rooms).map(sim_room).collect())
    }

    async fn fetch_messages(&self, room: &RoomId, limit: usize) -> Result<Vec<Message>, FetchError> {
        self.respond().await?;
        let first = SIM_HISTORY_LEN.saturating_sub(limit);
        Ok((first..SIM_HISTORY_LEN).map(|n| self.message(room, n)).collect())
    }
}

fn sim_room(index: usize) -> Room {
    Room::new(format!("!room{}:sim.example.org", index)).with_name(format!("Room {}", index))
}

fn instance_id(index: usize) -> InstanceId {
    InstanceId::new(format!("producer-{}", index))
}

struct Producer {
    id: InstanceId,
    backend: Arc<SimulatedBackend>,
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, stopping"),
        _ = terminate => tracing::info!("Received SIGTERM, stopping"),
    }
}

fn log_metrics(stats: &CacheStats) {
    tracing::info!(
        room_cache = stats.room_cache.size,
        message_cache = stats.message_cache.size,
        stabilized = stats.stabilized_rooms.count,
        active_loads = stats.progressive_loading.active,
        recent_room_fetches = stats.fetch_history.recent_room_fetches,
        recent_message_fetches = stats.fetch_history.recent_message_fetches,
        total_hits = stats.total_hits(),
        efficiency = stats.cache_efficiency(),
        "Cache metrics"
    );
}

fn submit_logged(result: Result<(), CoordinatorError>, source: &InstanceId) {
    if let Err(e) = result {
        tracing::warn!(%source, error = %e, "Event not queued");
    }
}

/// Run the simulation until `options.duration` elapses or `shutdown` resolves
pub async fn run(
    config: &AppConfig,
    options: SimulationOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<SimulationReport, AppError> {
    let layer = FreshnessLayer::new(config);
    let coordinator = StoreCoordinator::start(config.coordinator.clone(), Some(layer.clone()));

    let producers: Vec<Producer> = (0..options.producers.max(1))
        .map(|i| Producer {
            id: instance_id(i),
            backend: Arc::new(SimulatedBackend::new(options.rooms, options.latency)),
        })
        .collect();

    for (i, producer) in producers.iter().enumerate() {
        let priority = (producers.len() - i) as i32 * 2;
        coordinator
            .register(producer.id.clone(), healthy_snapshot(), priority)
            .await;
        coordinator
            .attach_backend(&producer.id, producer.backend.clone())
            .await?;
        tracing::info!(id = %producer.id, priority, "Simulated producer registered");
    }

    // Secondaries know one room the others lack
    for (i, producer) in producers.iter().enumerate().skip(1) {
        let extra = Room::new(format!("!extra{}:sim.example.org", i)).with_name(format!("Extra {}", i));
        coordinator
            .handle_event(producer.id.clone(), EventData::rooms(vec![extra]))
            .await?;
    }

    let monitor = {
        let layer = layer.clone();
        let interval = options.metrics_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_metrics(&layer.get_cache_stats().await);
            }
        })
    };

    let started = Instant::now();
    let deadline = started + options.duration;
    let mut ticker = tokio::time::interval(options.tick);
    let mut ticks: u64 = 0;
    let mut reads: u64 = 0;
    let mut failed: Option<(usize, Duration)> = None;
    let mut failure_done = false;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, ending simulation");
                break;
            }
            _ = tokio::time::sleep_until(deadline) => break,
            _ = ticker.tick() => {}
        }
        ticks += 1;
        let elapsed = started.elapsed();

        if !failure_done && failed.is_none() && options.fail_primary_after.is_some_and(|at| elapsed >= at) {
            if let Some(primary) = coordinator.primary().await {
                if let Some(index) = producers.iter().position(|p| p.id == primary) {
                    tracing::warn!(id = %primary, "Injecting primary failure");
                    producers[index].backend.set_failing(true);
                    coordinator
                        .update_snapshot(&primary, healthy_snapshot().with_sync_state(SyncState::Error))
                        .await?;
                    coordinator
                        .handle_event(primary, EventData::error("simulated sync failure"))
                        .await?;
                    failed = Some((index, elapsed));
                }
            }
        }
        if let Some((index, at)) = failed {
            if elapsed >= at + options.recover_after {
                let producer = &producers[index];
                tracing::info!(id = %producer.id, "Restoring failed producer");
                producer.backend.set_failing(false);
                coordinator.update_snapshot(&producer.id, healthy_snapshot()).await?;
                failed = None;
                failure_done = true;
            }
        }

        let reader = &producers[(ticks as usize) % producers.len()];
        let producer_id = ProducerId::from(&reader.id);
        let rooms = layer
            .get_stable_room_list(&producer_id, reader.backend.as_ref())
            .await;
        reads += 1;
        if !rooms.is_empty() {
            let room = &rooms[(ticks as usize) % rooms.len()];
            let messages = layer
                .get_stable_messages(&room.id, &producer_id, reader.backend.clone())
                .await;
            reads += 1;
            tracing::trace!(room = %room.id, count = messages.len(), "Read messages");
        }

        let live_room = sim_room(ticks as usize % options.rooms.max(1)).id;
        let live = reader.backend.message(&live_room, SIM_HISTORY_LEN + ticks as usize);
        submit_logged(
            coordinator
                .submit_event(reader.id.clone(), EventData::messages(live_room, vec![live]))
                .await,
            &reader.id,
        );

        if ticks % 10 == 0 {
            if let Some(primary) = coordinator.primary().await {
                let report = SyncReport {
                    room_count: options.rooms,
                    sync_state: Some(SyncState::Running),
                    next_batch: Some(format!("s{}", ticks)),
                };
                submit_logged(
                    coordinator.submit_event(primary.clone(), EventData::Sync(report)).await,
                    &primary,
                );
            }
        }
    }

    monitor.abort();

    let coordination = coordinator.get_coordination_status().await;
    let cache = layer.get_cache_stats().await;
    log_metrics(&cache);

    let report = SimulationReport {
        elapsed_ms: started.elapsed().as_millis() as u64,
        ticks,
        reads,
        backend_calls: producers.iter().map(|p| p.backend.calls()).sum(),
        cache_efficiency: cache.cache_efficiency(),
        cache,
        coordination,
    };

    coordinator.dispose().await;
    layer.dispose().await;
    Ok(report)
}

fn healthy_snapshot() -> InstanceSnapshot {
    InstanceSnapshot::connected("@agent:sim.example.org", SIM_HOMESERVER)
}
