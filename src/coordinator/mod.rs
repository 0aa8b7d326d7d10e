//! Multi-instance store coordinator
//!
//! Several producers keep their own view of the same session. The
//! coordinator registers them with a priority, elects the healthiest
//! highest-priority one as primary and routes their events through a single
//! FIFO worker, merging what they report into the primary's snapshot:
//!
//! - `sync` is accepted from the primary only and re-broadcast as advisory
//! - `room` from the primary is upserted field-wise; from a secondary it only
//!   fills in rooms the primary lacks
//! - `message` is merged into the primary by id, sorted by timestamp
//! - `error` deactivates the reporter, fails over if it was primary and
//!   starts recovery polling
//!
//! Without a primary every merge is a no-op.

pub mod events;
pub mod instance;
mod recovery;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::instrument;

use crate::backend::ProducerBackend;
use crate::config::{CoordinatorConfig, NOTICE_CHANNEL_CAPACITY};
use crate::freshness::{CacheStats, FreshnessLayer};
use crate::model::{
    insert_room_if_absent, merge_messages, upsert_room, InstanceId, ProducerId, RoomId,
};

pub use events::{
    CoordinationEvent, CoordinatorError, CoordinatorNotice, EventData, EventKind, SyncReport,
};
pub use instance::{ClientState, ConnectionInfo, InstanceSnapshot, StoreInstance, SyncState};

use events::QueuedEvent;

#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub source: InstanceId,
    pub report: SyncReport,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub priority: i32,
    pub is_active: bool,
    pub is_healthy: bool,
    pub is_primary: bool,
    pub idle_ms: u64,
    pub room_count: usize,
    pub message_room_count: usize,
    pub message_count: usize,
    pub recovery_attempts: u32,
    pub recovery_exhausted: bool,
    pub recovery_pending: bool,
    pub has_backend: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinationStatus {
    pub primary_store: Option<InstanceId>,
    pub total_stores: usize,
    pub active_stores: usize,
    pub event_queue_length: usize,
    pub is_processing: bool,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub last_sync: Option<SyncRecord>,
    pub stores: Vec<InstanceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

#[derive(Default)]
struct CoordinatorState {
    instances: HashMap<InstanceId, StoreInstance>,
    backends: HashMap<InstanceId, Arc<dyn ProducerBackend>>,
    primary: Option<InstanceId>,
    next_seq: u64,
    last_sync: Option<SyncRecord>,
    recoveries: HashMap<InstanceId, JoinHandle<()>>,
    events_processed: u64,
    events_dropped: u64,
}

impl CoordinatorState {
    fn abort_recovery(&mut self, id: &InstanceId) {
        if let Some(handle) = self.recoveries.remove(id) {
            handle.abort();
        }
    }

    fn abort_all_recoveries(&mut self) {
        for (_, handle) in self.recoveries.drain() {
            handle.abort();
        }
    }

    fn is_primary(&self, id: &InstanceId) -> bool {
        self.primary.as_ref() == Some(id)
    }

    /// Merge the primary's rooms and messages into every active secondary
    fn propagate_from_primary(&mut self, primary: &InstanceId) {
        let Some(source) = self.instances.get(primary) else {
            return;
        };
        let rooms = source.snapshot.rooms.clone();
        let messages = source.snapshot.messages.clone();

        for (id, instance) in self.instances.iter_mut() {
            if id == primary || !instance.is_active {
                continue;
            }
            for room in &rooms {
                upsert_room(&mut instance.snapshot.rooms, room);
            }
            for (room_id, list) in &messages {
                merge_messages(
                    instance.snapshot.messages.entry(room_id.clone()).or_default(),
                    list,
                );
            }
            tracing::debug!(secondary = %id, %primary, "Synced secondary from primary");
        }
    }
}

/// State shared by the handle, the event worker and recovery tasks
struct CoordinatorInner {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    notices: broadcast::Sender<CoordinatorNotice>,
    layer: Option<FreshnessLayer>,
    processing: AtomicBool,
}

impl CoordinatorInner {
    fn notify(&self, notice: CoordinatorNotice) {
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }

    /// Re-run the election; on change, announce it and sync secondaries
    fn elect(&self, state: &mut CoordinatorState) -> bool {
        let next = instance::elect(&state.instances);
        if next == state.primary {
            return false;
        }
        let previous = std::mem::replace(&mut state.primary, next.clone());
        tracing::info!(previous = ?previous, current = ?next, "Primary store changed");
        if let Some(primary) = &next {
            state.propagate_from_primary(primary);
        } else {
            tracing::warn!("No healthy active store, coordination paused");
        }
        self.notify(CoordinatorNotice::PrimaryChanged {
            previous,
            current: next,
        });
        true
    }

    async fn run(self: Arc<Self>, queue: Receiver<QueuedEvent>) {
        tracing::info!("Coordinator worker starting");
        while let Ok(queued) = queue.recv().await {
            self.processing.store(true, Ordering::SeqCst);
            self.process(queued.event).await;
            self.processing.store(false, Ordering::SeqCst);
            if let Some(ack) = queued.ack {
                let _ = ack.send(());
            }
        }
        tracing::info!("Event queue closed, coordinator worker shutting down");
    }

    #[instrument(
        name = "coordinator.process_event",
        skip_all,
        fields(event_id = %event.id, source = %event.source, kind = %event.data.kind(), duration_ms)
    )]
    async fn process(self: &Arc<Self>, event: CoordinationEvent) {
        let start = Instant::now();
        let source = event.source;

        let known = {
            let mut state = self.state.lock().await;
            let known = state.instances.contains_key(&source);
            if known {
                state.events_processed += 1;
            } else {
                state.events_dropped += 1;
            }
            known
        };
        if !known {
            tracing::debug!(%source, "Dropping event from unregistered source");
            return;
        }

        match event.data {
            EventData::Sync(report) => self.on_sync(&source, report).await,
            EventData::Room { rooms } => self.on_rooms(&source, rooms).await,
            EventData::Message { room_id, messages } => {
                self.on_messages(&source, room_id, &messages).await
            }
            EventData::Error { reason } => self.on_error(&source, reason).await,
        }

        tracing::Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
    }

    async fn on_sync(&self, source: &InstanceId, report: SyncReport) {
        let load = {
            let mut state = self.state.lock().await;
            if !state.is_primary(source) {
                tracing::debug!(%source, "Ignoring sync from non-primary store");
                return;
            }

            state.last_sync = Some(SyncRecord {
                source: source.clone(),
                report: report.clone(),
                received_at: Utc::now(),
            });
            self.notify(CoordinatorNotice::SyncAdvisory {
                source: source.clone(),
                report: report.clone(),
            });

            let known_rooms = state
                .instances
                .get(source)
                .map_or(0, |instance| instance.snapshot.rooms.len());
            let needs_rooms = known_rooms == 0 || report.room_count > known_rooms;
            match (&self.layer, state.backends.get(source)) {
                (Some(layer), Some(backend)) => Some((layer.clone(), backend.clone(), needs_rooms)),
                _ => None,
            }
        };

        if let Some((layer, backend, needs_rooms)) = load {
            self.load_primary_data(source, &layer, backend, needs_rooms).await;
        }
    }

    /// Pull rooms and first messages for the primary through the freshness
    /// layer. The coordinator lock is released around every fetch.
    async fn load_primary_data(
        &self,
        source: &InstanceId,
        layer: &FreshnessLayer,
        backend: Arc<dyn ProducerBackend>,
        needs_rooms: bool,
    ) {
        let producer = ProducerId::from(source);

        if needs_rooms {
            let rooms = layer.get_stable_room_list(&producer, backend.as_ref()).await;
            if !rooms.is_empty() {
                let mut state = self.state.lock().await;
                if let Some(instance) = state.instances.get_mut(source) {
                    for room in rooms.iter() {
                        upsert_room(&mut instance.snapshot.rooms, room);
                    }
                    tracing::info!(%source, room_count = instance.snapshot.rooms.len(), "Loaded primary rooms");
                }
            }
        }

        let limit = self.config.preload_message_rooms;
        let targets: Vec<RoomId> = {
            let state = self.state.lock().await;
            let Some(instance) = state.instances.get(source) else {
                return;
            };
            let snapshot = &instance.snapshot;
            if snapshot.rooms.is_empty() || snapshot.messages.len() >= snapshot.rooms.len().min(limit) {
                Vec::new()
            } else {
                snapshot
                    .rooms
                    .iter()
                    .take(limit)
                    .filter(|room| snapshot.messages.get(&room.id).map_or(true, Vec::is_empty))
                    .map(|room| room.id.clone())
                    .collect()
            }
        };

        for room_id in targets {
            let messages = layer
                .get_stable_messages(&room_id, &producer, backend.clone())
                .await;
            if messages.is_empty() {
                continue;
            }
            let mut state = self.state.lock().await;
            if let Some(instance) = state.instances.get_mut(source) {
                let list = instance.snapshot.messages.entry(room_id.clone()).or_default();
                merge_messages(list, &messages);
                tracing::debug!(%source, room = %room_id, count = list.len(), "Preloaded messages");
            }
        }
    }

    async fn on_rooms(&self, source: &InstanceId, rooms: Vec<crate::model::Room>) {
        let mut state = self.state.lock().await;
        let Some(primary) = state.primary.clone() else {
            tracing::debug!(%source, "No primary store, room event not merged");
            return;
        };

        if *source == primary {
            if let Some(instance) = state.instances.get_mut(&primary) {
                for room in &rooms {
                    upsert_room(&mut instance.snapshot.rooms, room);
                }
            }
            for (id, instance) in state.instances.iter_mut() {
                if *id != primary && instance.is_active {
                    for room in &rooms {
                        upsert_room(&mut instance.snapshot.rooms, room);
                    }
                }
            }
            tracing::debug!(%source, count = rooms.len(), "Merged rooms from primary");
            self.notify(CoordinatorNotice::RoomsUpdated {
                source: source.clone(),
                rooms,
            });
        } else if let Some(instance) = state.instances.get_mut(&primary) {
            let added = rooms
                .iter()
                .filter(|room| insert_room_if_absent(&mut instance.snapshot.rooms, room))
                .count();
            if added > 0 {
                tracing::debug!(%source, %primary, added, "Supplemented primary with rooms from secondary");
            }
        }
    }

    async fn on_messages(&self, source: &InstanceId, room_id: RoomId, messages: &[crate::model::Message]) {
        let mut state = self.state.lock().await;
        let Some(primary) = state.primary.clone() else {
            tracing::debug!(%source, "No primary store, message event not merged");
            return;
        };
        let Some(instance) = state.instances.get_mut(&primary) else {
            return;
        };

        let list = instance.snapshot.messages.entry(room_id.clone()).or_default();
        let added = merge_messages(list, messages);
        if added > 0 {
            tracing::debug!(%source, room = %room_id, added, "Merged messages into primary");
            self.notify(CoordinatorNotice::MessagesMerged { room_id, added });
        }
    }

    async fn on_error(self: &Arc<Self>, source: &InstanceId, reason: String) {
        let mut state = self.state.lock().await;
        let Some(instance) = state.instances.get_mut(source) else {
            return;
        };
        instance.is_active = false;
        instance.recovery_attempts = 0;
        instance.recovery_exhausted = false;
        tracing::warn!(%source, %reason, "Store reported an error, deactivating");
        self.notify(CoordinatorNotice::InstanceDeactivated {
            id: source.clone(),
            reason,
        });

        if state.is_primary(source) {
            self.elect(&mut state);
            match &state.primary {
                Some(primary) => tracing::info!(failed = %source, %primary, "Failed over to new primary"),
                None => tracing::error!(failed = %source, "Failover found no healthy store"),
            }
        }

        self.schedule_recovery(&mut state, source.clone());
    }
}

/// Handle to the coordinator; cheap to clone
#[derive(Clone)]
pub struct StoreCoordinator {
    inner: Arc<CoordinatorInner>,
    queue: Sender<QueuedEvent>,
}

impl StoreCoordinator {
    /// Create the coordinator and spawn its event worker
    pub fn start(config: CoordinatorConfig, layer: Option<FreshnessLayer>) -> Self {
        let (queue, receiver) = async_channel::bounded(config.event_queue_capacity.max(1));
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let inner = Arc::new(CoordinatorInner {
            config,
            state: Mutex::new(CoordinatorState::default()),
            notices,
            layer,
            processing: AtomicBool::new(false),
        });

        tokio::spawn(inner.clone().run(receiver));
        Self { inner, queue }
    }

    pub fn layer(&self) -> Option<&FreshnessLayer> {
        self.inner.layer.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorNotice> {
        self.inner.notices.subscribe()
    }

    /// Register or re-register an instance. Re-registration keeps the
    /// original registration order and reactivates the instance.
    #[instrument(name = "coordinator.register", skip_all, fields(id = %id, priority = priority))]
    pub async fn register(&self, id: InstanceId, snapshot: InstanceSnapshot, priority: i32) {
        let mut state = self.inner.state.lock().await;
        state.abort_recovery(&id);

        match state.instances.get_mut(&id) {
            Some(existing) => {
                existing.priority = priority;
                existing.snapshot = snapshot;
                existing.is_active = true;
                existing.last_activity = Instant::now();
                existing.recovery_attempts = 0;
                existing.recovery_exhausted = false;
                tracing::info!(%id, priority, "Store re-registered");
            }
            None => {
                let seq = state.next_seq;
                state.next_seq += 1;
                let healthy = snapshot.is_healthy();
                state
                    .instances
                    .insert(id.clone(), StoreInstance::new(id.clone(), snapshot, priority, seq));
                tracing::info!(%id, priority, healthy, "Store registered");
            }
        }

        self.inner.elect(&mut state);
    }

    /// Replace an instance's snapshot and re-run the election
    pub async fn update_snapshot(
        &self,
        id: &InstanceId,
        snapshot: InstanceSnapshot,
    ) -> Result<(), CoordinatorError> {
        let mut state = self.inner.state.lock().await;
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::UnknownInstance(id.clone()))?;
        instance.snapshot = snapshot;
        instance.last_activity = Instant::now();
        self.inner.elect(&mut state);
        Ok(())
    }

    /// Give the coordinator a backend to load the instance's data with
    /// while it is primary
    pub async fn attach_backend(
        &self,
        id: &InstanceId,
        backend: Arc<dyn ProducerBackend>,
    ) -> Result<(), CoordinatorError> {
        let mut state = self.inner.state.lock().await;
        if !state.instances.contains_key(id) {
            return Err(CoordinatorError::UnknownInstance(id.clone()));
        }
        state.backends.insert(id.clone(), backend);
        Ok(())
    }

    /// Remove an instance. Returns false if it was not registered.
    pub async fn deregister(&self, id: &InstanceId) -> bool {
        let mut state = self.inner.state.lock().await;
        state.abort_recovery(id);
        state.backends.remove(id);
        if state.instances.remove(id).is_none() {
            return false;
        }
        tracing::info!(%id, "Store deregistered");
        if state.is_primary(id) {
            self.inner.elect(&mut state);
        }
        true
    }

    async fn enqueue(
        &self,
        source: InstanceId,
        data: EventData,
        ack: Option<oneshot::Sender<()>>,
    ) -> Result<QueuedEvent, CoordinatorError> {
        if self.queue.is_closed() {
            return Err(CoordinatorError::QueueClosed);
        }
        if let Some(instance) = self.inner.state.lock().await.instances.get_mut(&source) {
            instance.last_activity = Instant::now();
        }
        Ok(QueuedEvent {
            event: CoordinationEvent::new(source, data),
            ack,
        })
    }

    /// Queue an event and wait until the worker has processed it
    pub async fn handle_event(&self, source: InstanceId, data: EventData) -> Result<(), CoordinatorError> {
        let (ack, processed) = oneshot::channel();
        let queued = self.enqueue(source, data, Some(ack)).await?;
        self.queue
            .send(queued)
            .await
            .map_err(|_| CoordinatorError::QueueClosed)?;
        processed.await.map_err(|_| CoordinatorError::QueueClosed)
    }

    /// Queue an event without waiting for it to be processed
    pub async fn submit_event(&self, source: InstanceId, data: EventData) -> Result<(), CoordinatorError> {
        let queued = self.enqueue(source, data, None).await?;
        self.queue.try_send(queued).map_err(|e| match e {
            TrySendError::Full(_) => CoordinatorError::QueueFull,
            TrySendError::Closed(_) => CoordinatorError::QueueClosed,
        })
    }

    /// Make `id` primary, carrying over the rooms and messages the old
    /// primary had that `id` lacks. A later election may override this.
    #[instrument(name = "coordinator.switch_primary", skip_all, fields(id = %id))]
    pub async fn switch_primary(&self, id: &InstanceId) -> Result<(), CoordinatorError> {
        let mut state = self.inner.state.lock().await;
        let target = state
            .instances
            .get(id)
            .ok_or_else(|| CoordinatorError::UnknownInstance(id.clone()))?;
        if !target.is_active {
            return Err(CoordinatorError::InstanceInactive(id.clone()));
        }
        if !target.snapshot.is_healthy() {
            return Err(CoordinatorError::InstanceUnhealthy(id.clone()));
        }
        if state.is_primary(id) {
            return Ok(());
        }

        let previous = state.primary.replace(id.clone());
        let carried = previous
            .as_ref()
            .and_then(|old| state.instances.get(old))
            .map(|old| (old.snapshot.rooms.clone(), old.snapshot.messages.clone()));
        if let (Some((rooms, messages)), Some(target)) = (carried, state.instances.get_mut(id)) {
            let added_rooms = rooms
                .iter()
                .filter(|room| insert_room_if_absent(&mut target.snapshot.rooms, room))
                .count();
            let added_messages: usize = messages
                .iter()
                .map(|(room_id, list)| {
                    merge_messages(target.snapshot.messages.entry(room_id.clone()).or_default(), list)
                })
                .sum();
            tracing::debug!(%id, added_rooms, added_messages, "Carried data over from previous primary");
        }
        state.propagate_from_primary(id);

        tracing::info!(previous = ?previous, current = %id, "Primary store switched manually");
        self.inner.notify(CoordinatorNotice::PrimaryChanged {
            previous,
            current: Some(id.clone()),
        });
        Ok(())
    }

    pub async fn primary(&self) -> Option<InstanceId> {
        self.inner.state.lock().await.primary.clone()
    }

    /// A copy of an instance's current snapshot
    pub async fn snapshot(&self, id: &InstanceId) -> Option<InstanceSnapshot> {
        self.inner
            .state
            .lock()
            .await
            .instances
            .get(id)
            .map(|instance| instance.snapshot.clone())
    }

    pub async fn get_coordination_status(&self) -> CoordinationStatus {
        let mut status = {
            let state = self.inner.state.lock().await;
            let now = Instant::now();
            let mut stores: Vec<&StoreInstance> = state.instances.values().collect();
            stores.sort_by_key(|instance| (std::cmp::Reverse(instance.priority), instance.registered_seq));

            CoordinationStatus {
                primary_store: state.primary.clone(),
                total_stores: state.instances.len(),
                active_stores: state.instances.values().filter(|i| i.is_active).count(),
                event_queue_length: self.queue.len(),
                is_processing: self.inner.processing.load(Ordering::SeqCst),
                events_processed: state.events_processed,
                events_dropped: state.events_dropped,
                last_sync: state.last_sync.clone(),
                stores: stores
                    .into_iter()
                    .map(|instance| InstanceStatus {
                        id: instance.id.clone(),
                        priority: instance.priority,
                        is_active: instance.is_active,
                        is_healthy: instance.snapshot.is_healthy(),
                        is_primary: state.is_primary(&instance.id),
                        idle_ms: now.saturating_duration_since(instance.last_activity).as_millis() as u64,
                        room_count: instance.snapshot.rooms.len(),
                        message_room_count: instance.snapshot.messages.len(),
                        message_count: instance.snapshot.message_count(),
                        recovery_attempts: instance.recovery_attempts,
                        recovery_exhausted: instance.recovery_exhausted,
                        recovery_pending: state.recoveries.contains_key(&instance.id),
                        has_backend: state.backends.contains_key(&instance.id),
                    })
                    .collect(),
                cache: None,
            }
        };

        if let Some(layer) = &self.inner.layer {
            status.cache = Some(layer.get_cache_stats().await);
        }
        status
    }

    /// Forget every instance; queued events from them will be dropped
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        state.abort_all_recoveries();
        let next_seq = state.next_seq;
        *state = CoordinatorState {
            next_seq,
            ..CoordinatorState::default()
        };
        tracing::info!("Coordinator reset");
    }

    /// Close the event queue and stop recovery polling
    pub async fn dispose(&self) {
        self.queue.close();
        self.reset().await;
        tracing::info!("Coordinator disposed");
    }
}
