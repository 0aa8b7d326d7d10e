//! Fetch governor
//!
//! Tracks when each cache key was last fetched and how many fetches each
//! class performed recently. A fetch is allowed only if the key's minimum
//! spacing has elapsed and the class has not used up its per-minute cap.
//! Pure bookkeeping: callers pass the current instant.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::{GovernorConfig, GOVERNOR_HISTORY_RETENTION_SECS, GOVERNOR_WINDOW_SECS};
use crate::model::{CacheKey, FetchClass};

/// Limits for one fetch class
#[derive(Debug, Clone, Copy)]
struct ClassLimits {
    min_spacing: Duration,
    max_per_window: usize,
}

/// Why a fetch was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The key was fetched less than the minimum spacing ago
    TooSoon,
    /// The class reached its per-minute cap
    RateCapped,
}

/// Fetch history counters for introspection
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchHistoryStats {
    pub room_fetches: usize,
    pub message_fetches: usize,
    pub recent_room_fetches: usize,
    pub recent_message_fetches: usize,
}

#[derive(Debug)]
pub struct FetchGovernor {
    room_limits: ClassLimits,
    message_limits: ClassLimits,
    last_fetch: HashMap<CacheKey, Instant>,
    room_history: VecDeque<Instant>,
    message_history: VecDeque<Instant>,
}

impl FetchGovernor {
    pub fn new(config: &GovernorConfig) -> Self {
        let mut governor = Self {
            room_limits: ClassLimits {
                min_spacing: Duration::ZERO,
                max_per_window: 0,
            },
            message_limits: ClassLimits {
                min_spacing: Duration::ZERO,
                max_per_window: 0,
            },
            last_fetch: HashMap::new(),
            room_history: VecDeque::new(),
            message_history: VecDeque::new(),
        };
        governor.set_limits(config);
        governor
    }

    /// Replace the limits; recorded history is kept
    pub fn set_limits(&mut self, config: &GovernorConfig) {
        self.room_limits = ClassLimits {
            min_spacing: Duration::from_millis(config.room_fetch_spacing_ms),
            max_per_window: config.max_room_fetch_per_minute,
        };
        self.message_limits = ClassLimits {
            min_spacing: Duration::from_millis(config.message_fetch_spacing_ms),
            max_per_window: config.max_message_fetch_per_minute,
        };
    }

    fn limits(&self, class: FetchClass) -> ClassLimits {
        match class {
            FetchClass::RoomList => self.room_limits,
            FetchClass::Messages => self.message_limits,
        }
    }

    fn history(&self, class: FetchClass) -> &VecDeque<Instant> {
        match class {
            FetchClass::RoomList => &self.room_history,
            FetchClass::Messages => &self.message_history,
        }
    }

    fn history_mut(&mut self, class: FetchClass) -> &mut VecDeque<Instant> {
        match class {
            FetchClass::RoomList => &mut self.room_history,
            FetchClass::Messages => &mut self.message_history,
        }
    }

    fn recent_count(&self, class: FetchClass, now: Instant) -> usize {
        let window = Duration::from_secs(GOVERNOR_WINDOW_SECS);
        self.history(class)
            .iter()
            .filter(|&&at| now.saturating_duration_since(at) < window)
            .count()
    }

    /// Check whether a fetch for `key` may start at `now`
    pub fn check(&self, key: &CacheKey, now: Instant) -> Result<(), Refusal> {
        let limits = self.limits(key.class());

        if let Some(&last) = self.last_fetch.get(key) {
            if now.saturating_duration_since(last) < limits.min_spacing {
                return Err(Refusal::TooSoon);
            }
        }

        if self.recent_count(key.class(), now) >= limits.max_per_window {
            return Err(Refusal::RateCapped);
        }

        Ok(())
    }

    pub fn can_fetch(&self, key: &CacheKey, now: Instant) -> bool {
        self.check(key, now).is_ok()
    }

    /// Record a fetch for `key` and prune history older than the retention period
    pub fn record_fetch(&mut self, key: &CacheKey, now: Instant) {
        self.last_fetch.insert(key.clone(), now);
        let retention = Duration::from_secs(GOVERNOR_HISTORY_RETENTION_SECS);
        let history = self.history_mut(key.class());
        history.push_back(now);
        while let Some(&oldest) = history.front() {
            if now.saturating_duration_since(oldest) >= retention {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Forget the spacing timestamps of every key matching `predicate`
    pub fn forget_where(&mut self, mut predicate: impl FnMut(&CacheKey) -> bool) {
        self.last_fetch.retain(|key, _| !predicate(key));
    }

    pub fn clear(&mut self) {
        self.last_fetch.clear();
        self.room_history.clear();
        self.message_history.clear();
    }

    pub fn stats(&self, now: Instant) -> FetchHistoryStats {
        FetchHistoryStats {
            room_fetches: self.room_history.len(),
            message_fetches: self.message_history.len(),
            recent_room_fetches: self.recent_count(FetchClass::RoomList, now),
            recent_message_fetches: self.recent_count(FetchClass::Messages, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProducerId, RoomKey};

    fn room_key(producer: &str) -> CacheKey {
        CacheKey::RoomList(ProducerId::from(producer))
    }

    fn message_key(producer: &str, room: &str) -> CacheKey {
        CacheKey::Messages(RoomKey::new(producer.into(), room.into()))
    }

    #[test]
    fn test_first_fetch_is_allowed() {
        let governor = FetchGovernor::new(&GovernorConfig::default());
        assert!(governor.can_fetch(&room_key("p1"), Instant::now()));
    }

    #[test]
    fn test_min_spacing_per_key() {
        let mut governor = FetchGovernor::new(&GovernorConfig::default());
        let t0 = Instant::now();
        governor.record_fetch(&room_key("p1"), t0);

        assert_eq!(
            governor.check(&room_key("p1"), t0 + Duration::from_secs(4)),
            Err(Refusal::TooSoon)
        );
        assert!(governor.can_fetch(&room_key("p1"), t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_message_spacing_is_shorter() {
        let mut governor = FetchGovernor::new(&GovernorConfig::default());
        let t0 = Instant::now();
        let key = message_key("p1", "!r");
        governor.record_fetch(&key, t0);
        assert!(!governor.can_fetch(&key, t0 + Duration::from_millis(2999)));
        assert!(governor.can_fetch(&key, t0 + Duration::from_secs(3)));
        // other rooms are not affected by the spacing
        assert!(governor.can_fetch(&message_key("p1", "!other"), t0));
    }

    #[test]
    fn test_class_cap_applies_across_keys() {
        let mut governor = FetchGovernor::new(&GovernorConfig::default());
        let t0 = Instant::now();
        governor.record_fetch(&room_key("p1"), t0);
        governor.record_fetch(&room_key("p2"), t0 + Duration::from_secs(1));

        assert_eq!(
            governor.check(&room_key("p3"), t0 + Duration::from_secs(2)),
            Err(Refusal::RateCapped)
        );
        // message class has its own budget
        assert!(governor.can_fetch(&message_key("p3", "!r"), t0 + Duration::from_secs(2)));
        // after the window slides past the first fetch, one slot frees up
        assert!(governor.can_fetch(&room_key("p3"), t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_history_is_pruned_after_retention() {
        let mut governor = FetchGovernor::new(&GovernorConfig::default());
        let t0 = Instant::now();
        governor.record_fetch(&room_key("p1"), t0);
        governor.record_fetch(&room_key("p1"), t0 + Duration::from_secs(301));

        let stats = governor.stats(t0 + Duration::from_secs(301));
        assert_eq!(stats.room_fetches, 1);
        assert_eq!(stats.recent_room_fetches, 1);
    }

    #[test]
    fn test_forget_where_resets_spacing_only() {
        let mut governor = FetchGovernor::new(&GovernorConfig::default());
        let t0 = Instant::now();
        governor.record_fetch(&room_key("p1"), t0);
        governor.forget_where(|key| key.producer().as_str() == "p1");

        assert!(governor.can_fetch(&room_key("p1"), t0));
        assert_eq!(governor.stats(t0).room_fetches, 1);
    }

    #[test]
    fn test_set_limits_applies_immediately() {
        let mut governor = FetchGovernor::new(&GovernorConfig::default());
        let t0 = Instant::now();
        governor.record_fetch(&room_key("p1"), t0);
        governor.set_limits(&GovernorConfig {
            room_fetch_spacing_ms: 0,
            max_room_fetch_per_minute: 10,
            ..GovernorConfig::default()
        });
        assert!(governor.can_fetch(&room_key("p1"), t0));
    }
}
