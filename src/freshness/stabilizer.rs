//! Room list stabilization
//!
//! After a successful fetch, a producer's room list is frozen for a long
//! window so that the UI does not flicker when producers overwrite each
//! other's lists. A frozen list takes precedence over the cache TTL and the
//! governor.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::MAX_STABILIZED_PRODUCERS;
use crate::model::{ProducerId, Room};

/// A frozen room list
#[derive(Debug, Clone)]
pub struct StabilizedSnapshot {
    pub rooms: Arc<Vec<Room>>,
    pub stabilized_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct StabilizedEntryStats {
    pub producer: ProducerId,
    pub room_count: usize,
    pub age_ms: u64,
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StabilizationStats {
    pub enabled: bool,
    pub duration_ms: u64,
    pub count: usize,
    pub entries: Vec<StabilizedEntryStats>,
}

/// Frozen room lists keyed by producer.
///
/// moka bounds the number of producers and drops entries in wall-clock time;
/// expiry itself is decided against the tokio clock so that paused-time
/// tests observe it exactly.
#[derive(Clone)]
pub struct Stabilizer {
    snapshots: Cache<ProducerId, Arc<StabilizedSnapshot>>,
    duration: Duration,
}

impl Stabilizer {
    pub fn new(duration: Duration) -> Self {
        let mut builder = Cache::builder().max_capacity(MAX_STABILIZED_PRODUCERS);
        if !duration.is_zero() {
            builder = builder.time_to_live(duration);
        }
        Self {
            snapshots: builder.build(),
            duration,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.duration.is_zero()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The frozen list for `producer`, evicting it if the window has passed
    pub async fn get_stabilized(&self, producer: &ProducerId, now: Instant) -> Option<Arc<Vec<Room>>> {
        if !self.is_enabled() {
            return None;
        }
        let snapshot = self.snapshots.get(producer).await?;
        if now.saturating_duration_since(snapshot.stabilized_at) < self.duration {
            return Some(snapshot.rooms.clone());
        }
        self.snapshots.invalidate(producer).await;
        tracing::debug!(%producer, "Stabilized room list expired");
        None
    }

    /// Freeze a deep copy of `rooms`, replacing any earlier snapshot
    pub async fn stabilize(&self, producer: &ProducerId, rooms: &[Room], now: Instant) {
        if !self.is_enabled() {
            return;
        }
        let snapshot = StabilizedSnapshot {
            rooms: Arc::new(rooms.to_vec()),
            stabilized_at: now,
        };
        self.snapshots
            .insert(producer.clone(), Arc::new(snapshot))
            .await;
        tracing::debug!(%producer, room_count = rooms.len(), "Stabilized room list");
    }

    pub async fn remove(&self, producer: &ProducerId) {
        self.snapshots.invalidate(producer).await;
    }

    pub fn clear(&self) {
        self.snapshots.invalidate_all();
    }

    /// Rebuild with a new window, carrying over snapshots that are still
    /// inside it
    pub async fn with_duration(&self, duration: Duration, now: Instant) -> Self {
        let next = Self::new(duration);
        if next.is_enabled() {
            for (producer, snapshot) in self.snapshots.iter() {
                if now.saturating_duration_since(snapshot.stabilized_at) < duration {
                    next.snapshots.insert((*producer).clone(), snapshot).await;
                }
            }
        }
        next
    }

    pub fn stats(&self, now: Instant) -> StabilizationStats {
        let mut entries: Vec<StabilizedEntryStats> = self
            .snapshots
            .iter()
            .filter_map(|(producer, snapshot)| {
                let age = now.saturating_duration_since(snapshot.stabilized_at);
                (age < self.duration).then(|| StabilizedEntryStats {
                    producer: (*producer).clone(),
                    room_count: snapshot.rooms.len(),
                    age_ms: age.as_millis() as u64,
                    remaining_ms: (self.duration - age).as_millis() as u64,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.producer.cmp(&b.producer));

        StabilizationStats {
            enabled: self.is_enabled(),
            duration_ms: self.duration.as_millis() as u64,
            count: entries.len(),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rooms(names: &[&str]) -> Vec<Room> {
        names.iter().map(|n| Room::new(*n)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_served_until_window_passes() {
        let stabilizer = Stabilizer::new(Duration::from_secs(1800));
        let producer = ProducerId::from("p1");
        stabilizer.stabilize(&producer, &rooms(&["!a", "!b"]), Instant::now()).await;

        let first = stabilizer.get_stabilized(&producer, Instant::now()).await.unwrap();
        let second = stabilizer.get_stabilized(&producer, Instant::now()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);

        tokio::time::advance(Duration::from_secs(1800)).await;
        assert!(stabilizer.get_stabilized(&producer, Instant::now()).await.is_none());
        assert_eq!(stabilizer.stats(Instant::now()).count, 0);
    }

    #[tokio::test]
    async fn test_stabilize_stores_a_copy() {
        let stabilizer = Stabilizer::new(Duration::from_secs(60));
        let producer = ProducerId::from("p1");
        let mut source = rooms(&["!a"]);
        stabilizer.stabilize(&producer, &source, Instant::now()).await;
        source.push(Room::new("!b"));

        let frozen = stabilizer.get_stabilized(&producer, Instant::now()).await.unwrap();
        assert_eq!(frozen.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_duration_disables() {
        let stabilizer = Stabilizer::new(Duration::ZERO);
        let producer = ProducerId::from("p1");
        stabilizer.stabilize(&producer, &rooms(&["!a"]), Instant::now()).await;
        assert!(stabilizer.get_stabilized(&producer, Instant::now()).await.is_none());
        assert!(!stabilizer.stats(Instant::now()).enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_duration_keeps_live_snapshots() {
        let stabilizer = Stabilizer::new(Duration::from_secs(600));
        let producer = ProducerId::from("p1");
        stabilizer.stabilize(&producer, &rooms(&["!a"]), Instant::now()).await;
        tokio::time::advance(Duration::from_secs(120)).await;

        let longer = stabilizer.with_duration(Duration::from_secs(300), Instant::now()).await;
        assert!(longer.get_stabilized(&producer, Instant::now()).await.is_some());

        let shorter = stabilizer.with_duration(Duration::from_secs(60), Instant::now()).await;
        assert!(shorter.get_stabilized(&producer, Instant::now()).await.is_none());
    }
}
