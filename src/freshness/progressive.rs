//! Progressive message loading
//!
//! Instead of one large backfill, a room's history is fetched in tiers of
//! increasing size (10, 30, 50, 1000 by default). Tier 0 runs while the caller
//! waits; the remaining tiers run in one background task per room, each at
//! its configured delay from the start of the load. Every successful tier
//! replaces the cached message list, unless the cache already holds messages
//! the tier lacks; then the two are merged. The cached list never shrinks,
//! and a load is finished as soon as it reaches the final tier size.
//!
//! Cancellation is cooperative: the task checks before each tier fires, and a
//! tier already in flight still commits. A cancelled load that got past tier
//! 0 resumes from where it stopped on the next read.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::instrument;

use super::inflight::{self, SharedResult};
use super::{FreshnessLayer, LayerState, ServedFrom};
use crate::backend::{FetchError, ProducerBackend};
use crate::config::ProgressiveConfig;
use crate::model::{merge_messages, CacheKey, Message, MessageId, ProducerId, RoomId, RoomKey};

/// Progress of one room's tiered load
pub struct LoadingState {
    generation: u64,
    plan: ProgressiveConfig,
    /// Next tier to run
    current_stage: usize,
    /// Cached message count after each completed tier
    stage_counts: Vec<Option<usize>>,
    completed_stages: Vec<bool>,
    started_at: Instant,
    /// Tier delays are measured from here; shifted when a load resumes
    origin: Instant,
    last_stage_time: Option<Instant>,
    running: bool,
    cancel: watch::Sender<bool>,
}

impl LoadingState {
    fn new(generation: u64, plan: ProgressiveConfig, now: Instant) -> (Self, watch::Receiver<bool>) {
        let stages = plan.stage_sizes.len();
        let (cancel, cancelled) = watch::channel(false);
        let state = Self {
            generation,
            plan,
            current_stage: 0,
            stage_counts: vec![None; stages],
            completed_stages: vec![false; stages],
            started_at: now,
            origin: now,
            last_stage_time: None,
            running: true,
            cancel,
        };
        (state, cancelled)
    }

    fn stage_count(&self) -> usize {
        self.plan.stage_sizes.len()
    }

    fn is_finished(&self) -> bool {
        self.current_stage >= self.stage_count()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Stopped early after tier 0 made it into the cache
    fn is_resumable(&self) -> bool {
        !self.running && !self.is_finished() && self.completed_stages.first().copied().unwrap_or(false)
    }

    fn complete_stage(&mut self, stage: usize, count: usize, now: Instant) {
        if let Some(slot) = self.stage_counts.get_mut(stage) {
            *slot = Some(count);
        }
        if let Some(done) = self.completed_stages.get_mut(stage) {
            *done = true;
        }
        self.skip_stage(stage, now);
    }

    fn skip_stage(&mut self, stage: usize, now: Instant) {
        self.current_stage = stage + 1;
        self.last_stage_time = Some(now);
    }

    /// Skip the remaining tiers
    fn finish(&mut self) {
        self.current_stage = self.stage_count();
    }

    /// Restart a stopped load under a new generation. The next tier keeps its
    /// original spacing from the last tier that ran.
    fn resume(&mut self, generation: u64, now: Instant) -> watch::Receiver<bool> {
        let (cancel, cancelled) = watch::channel(false);
        let elapsed_at_stop = self.plan.stage_delay(self.current_stage.saturating_sub(1));
        self.cancel = cancel;
        self.generation = generation;
        self.running = true;
        self.origin = now.checked_sub(elapsed_at_stop).unwrap_or(now);
        cancelled
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadingStats {
    pub key: String,
    pub generation: u64,
    pub current_stage: usize,
    pub total_stages: usize,
    pub completed_stages: Vec<bool>,
    /// Message count delivered by each tier, if it completed
    pub stage_counts: Vec<Option<usize>>,
    pub running: bool,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    pub since_last_stage_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressiveStats {
    pub active: usize,
    pub loads: Vec<LoadingStats>,
}

pub(super) fn stats(loading: &HashMap<RoomKey, LoadingState>, now: Instant) -> ProgressiveStats {
    let mut loads: Vec<LoadingStats> = loading
        .iter()
        .map(|(key, load)| LoadingStats {
            key: key.to_string(),
            generation: load.generation,
            current_stage: load.current_stage,
            total_stages: load.stage_count(),
            completed_stages: load.completed_stages.clone(),
            stage_counts: load.stage_counts.clone(),
            running: load.running,
            cancelled: load.is_cancelled(),
            elapsed_ms: now.saturating_duration_since(load.started_at).as_millis() as u64,
            since_last_stage_ms: load
                .last_stage_time
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
        })
        .collect();
    loads.sort_by(|a, b| a.key.cmp(&b.key));

    ProgressiveStats {
        active: loads.iter().filter(|l| l.running).count(),
        loads,
    }
}

async fn fetch_stage(
    backend: &dyn ProducerBackend,
    room: &RoomId,
    limit: usize,
    timeout: Duration,
) -> SharedResult<Vec<Message>> {
    match tokio::time::timeout(timeout, backend.fetch_messages(room, limit)).await {
        Ok(result) => result.map(Arc::new),
        Err(_) => Err(FetchError::Timeout),
    }
}

/// `fetched` if it covers everything cached, otherwise the union of both
fn grow_cached(cached: Option<Arc<Vec<Message>>>, fetched: &Arc<Vec<Message>>) -> Arc<Vec<Message>> {
    let Some(cached) = cached else {
        return fetched.clone();
    };
    let fetched_ids: HashSet<&MessageId> = fetched.iter().map(|m| &m.id).collect();
    if cached.iter().all(|m| fetched_ids.contains(&m.id)) {
        return fetched.clone();
    }
    let mut merged = cached.as_ref().clone();
    merge_messages(&mut merged, fetched);
    Arc::new(merged)
}

/// Record a tier's outcome. Returns false when the load was replaced or
/// dropped, in which case the result is discarded.
fn commit_stage(
    state: &mut LayerState,
    key: &RoomKey,
    generation: u64,
    stage: usize,
    result: &SharedResult<Vec<Message>>,
    expected: Option<u64>,
    now: Instant,
) -> bool {
    let Some(load) = state
        .loading
        .get_mut(key)
        .filter(|load| load.generation == generation)
    else {
        tracing::debug!(%key, stage, "Discarding tier for a replaced load");
        return false;
    };

    match result {
        Ok(fetched) => {
            let messages = grow_cached(state.message_cache.last_known(key), fetched);
            if state
                .message_cache
                .set_if_version(key.clone(), messages.clone(), expected, now)
            {
                tracing::debug!(%key, stage, count = messages.len(), "Tier committed");
                load.complete_stage(stage, messages.len(), now);
                if messages.len() >= load.plan.final_stage_size() && !load.is_finished() {
                    tracing::debug!(%key, stage, "Cached history already complete, skipping remaining tiers");
                    load.finish();
                }
            } else {
                tracing::debug!(%key, stage, "Tier superseded by a newer write");
                load.skip_stage(stage, now);
            }
        }
        Err(error) => {
            tracing::warn!(%key, stage, %error, "Tier failed, abandoning it");
            load.skip_stage(stage, now);
        }
    }
    state.drop_evicted();
    true
}

/// Sleep until `deadline`; false if the load was cancelled first
async fn wait_for_stage(deadline: Instant, cancelled: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *cancelled.borrow_and_update() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return !*cancelled.borrow(),
            changed = cancelled.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

impl FreshnessLayer {
    /// Messages for `room` as seen by `producer`: fresh cache, a shared tier 0
    /// fetch, or a new tiered load; otherwise stale cache or an empty list
    #[instrument(
        name = "freshness.get_stable_messages",
        skip_all,
        fields(producer = %producer, room = %room, served_from, duration_ms)
    )]
    pub async fn get_stable_messages(
        &self,
        room: &RoomId,
        producer: &ProducerId,
        backend: Arc<dyn ProducerBackend>,
    ) -> Arc<Vec<Message>> {
        let start = Instant::now();
        let key = RoomKey::new(producer.clone(), room.clone());
        let (messages, served_from) = self.resolve_messages(key, backend).await;

        let span = tracing::Span::current();
        span.record("served_from", served_from.as_str());
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        messages
    }

    async fn resolve_messages(
        &self,
        key: RoomKey,
        backend: Arc<dyn ProducerBackend>,
    ) -> (Arc<Vec<Message>>, ServedFrom) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.disposed {
            return (Arc::new(Vec::new()), ServedFrom::Empty);
        }
        let now = Instant::now();

        // A complete backfill, or the best a finished load could get
        let final_size = state.settings.progressive.final_stage_size();
        let load_finished = state.loading.get(&key).is_some_and(|load| load.is_finished());
        let serve_cached = state
            .message_cache
            .peek(&key, now)
            .is_some_and(|entry| entry.data.len() >= final_size || load_finished);
        if serve_cached {
            if let Some(messages) = state.message_cache.get(&key, now) {
                return (messages, ServedFrom::Cache);
            }
        }

        let timeout = state.settings.cache.fetch_timeout();
        if let Some(rx) = state.message_flights.join(&key, timeout, now) {
            drop(guard);
            return match inflight::wait(rx, timeout).await {
                Ok(messages) => (messages, ServedFrom::Coalesced),
                Err(error) => {
                    tracing::debug!(%key, %error, "Coalesced message fetch failed");
                    self.state.lock().await.message_fallback(&key)
                }
            };
        }

        if state.loading.get(&key).is_some_and(|load| load.running) {
            let (messages, _) = state.message_fallback(&key);
            return (messages, ServedFrom::Loading);
        }

        let cache_key = CacheKey::Messages(key.clone());
        if let Err(refusal) = state.governor.check(&cache_key, now) {
            tracing::debug!(%key, ?refusal, "Message fetch refused by governor");
            return state.message_fallback(&key);
        }
        state.governor.record_fetch(&cache_key, now);

        if state.loading.get(&key).is_some_and(|load| load.is_resumable()) {
            let generation = state.allocate_generation();
            if let Some(load) = state.loading.get_mut(&key) {
                let cancelled = load.resume(generation, now);
                let (from_stage, origin, plan) = (load.current_stage, load.origin, load.plan.clone());
                tracing::info!(%key, from_stage, "Resuming progressive load");
                self.spawn_stages(key.clone(), backend, generation, cancelled, from_stage, origin, plan);
            }
            let (messages, _) = state.message_fallback(&key);
            return (messages, ServedFrom::Loading);
        }

        let generation = state.allocate_generation();
        let plan = state.settings.progressive.clone();
        let (load, cancelled) = LoadingState::new(generation, plan.clone(), now);
        let origin = load.origin;
        // replacing an earlier state drops its cancel sender, which stops its task
        state.loading.insert(key.clone(), load);
        let ticket = state.message_flights.lead(key.clone(), now);
        let expected = state.message_cache.version(&key);
        drop(guard);

        let first_size = plan.stage_sizes.first().copied().unwrap_or(0);
        let result = fetch_stage(backend.as_ref(), &key.room, first_size, timeout).await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();
        let committed = commit_stage(state, &key, generation, 0, &result, expected, now);

        // Waiters get the committed list, which may be larger than the tier
        let served = match &result {
            Ok(fetched) if committed => Ok(state
                .message_cache
                .last_known(&key)
                .filter(|cached| cached.len() >= fetched.len())
                .unwrap_or_else(|| fetched.clone())),
            _ => result.clone(),
        };
        state.message_flights.complete(&key, ticket, served.clone());

        if committed {
            if let Some(load) = state.loading.get_mut(&key) {
                if load.is_finished() || load.is_cancelled() {
                    load.running = false;
                } else {
                    self.spawn_stages(key.clone(), backend, generation, cancelled, 1, origin, plan);
                }
            }
        }

        match served {
            Ok(messages) => (messages, ServedFrom::Fetched),
            Err(_) => state.message_fallback(&key),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_stages(
        &self,
        key: RoomKey,
        backend: Arc<dyn ProducerBackend>,
        generation: u64,
        cancelled: watch::Receiver<bool>,
        from_stage: usize,
        origin: Instant,
        plan: ProgressiveConfig,
    ) {
        let layer = self.clone();
        tokio::spawn(async move {
            layer
                .run_stages(key, backend, generation, cancelled, from_stage, origin, plan)
                .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(
        name = "freshness.progressive.run_stages",
        skip_all,
        fields(key = %key, generation = generation, from_stage = from_stage)
    )]
    async fn run_stages(
        self,
        key: RoomKey,
        backend: Arc<dyn ProducerBackend>,
        generation: u64,
        mut cancelled: watch::Receiver<bool>,
        from_stage: usize,
        origin: Instant,
        plan: ProgressiveConfig,
    ) {
        for stage in from_stage..plan.stage_sizes.len() {
            if !wait_for_stage(origin + plan.stage_delay(stage), &mut cancelled).await {
                tracing::debug!(%key, stage, "Progressive load cancelled");
                break;
            }

            let next = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let pending = match state.loading.get_mut(&key) {
                    Some(load) if load.generation == generation => {
                        if !load.is_finished() {
                            load.current_stage = stage;
                        }
                        !load.is_finished()
                    }
                    _ => return,
                };
                pending.then(|| (state.message_cache.version(&key), state.settings.cache.fetch_timeout()))
            };
            let Some((expected, timeout)) = next else {
                break;
            };

            let result = fetch_stage(backend.as_ref(), &key.room, plan.stage_sizes[stage], timeout).await;

            let mut guard = self.state.lock().await;
            if !commit_stage(&mut guard, &key, generation, stage, &result, expected, Instant::now()) {
                return;
            }
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let stopped = match state
            .loading
            .get_mut(&key)
            .filter(|load| load.generation == generation)
        {
            Some(load) => {
                load.running = false;
                tracing::debug!(%key, stage = load.current_stage, "Progressive load stopped");
                true
            }
            None => false,
        };
        // nothing to resume from or serve
        if stopped && !state.message_cache.contains(&key) {
            state.loading.remove(&key);
        }
    }

    /// Stop the not-yet-fired tiers of a room's load. Returns false if no
    /// load was running.
    #[instrument(
        name = "freshness.cancel_loading",
        skip_all,
        fields(producer = %producer, room = %room)
    )]
    pub async fn cancel_loading(&self, room: &RoomId, producer: &ProducerId) -> bool {
        let key = RoomKey::new(producer.clone(), room.clone());
        let state = self.state.lock().await;
        match state.loading.get(&key) {
            Some(load) if load.running => {
                load.cancel.send_replace(true);
                tracing::info!(%key, stage = load.current_stage, "Cancelled progressive load");
                true
            }
            _ => false,
        }
    }
}
