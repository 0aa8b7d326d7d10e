//! Roomkeeper - freshness and coordination layer for chat session data
//!
//! Sits between producers of room and message data and the agents that read
//! it. The freshness layer de-duplicates concurrent fetches, caches results
//! with TTL and bounded capacity, freezes room lists for a stabilization
//! period, rate-limits backend calls and loads message history in timed
//! tiers. The coordinator elects a primary among several producers, merges
//! their events and fails over when the primary reports an error.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod freshness;
pub mod model;
pub mod simulate;

pub use backend::{FetchError, ProducerBackend};
pub use config::AppConfig;
pub use coordinator::{CoordinationStatus, CoordinatorError, EventData, StoreCoordinator};
pub use error::AppError;
pub use freshness::{CacheStats, FreshnessLayer};
