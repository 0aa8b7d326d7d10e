//! Configuration loading and constants.
//!
//! Loads layer configuration from TOML files and defines constants for cache
//! TTLs and capacities, fetch governance, stabilization, progressive loading,
//! coordinator recovery, logging format and default paths. `AppConfig` is the
//! root configuration struct containing all settings.

use const_format::formatcp;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Fetch Governance
// =============================================================================

/// Window over which the per-class call cap is counted
pub const GOVERNOR_WINDOW_SECS: u64 = 60;

/// Fetch history older than this is pruned on every recorded fetch (5 minutes)
pub const GOVERNOR_HISTORY_RETENTION_SECS: u64 = 300;

/// Minimum spacing between room list fetches for the same producer
pub const DEFAULT_ROOM_FETCH_SPACING_MS: u64 = 5000;

/// Minimum spacing between message fetches for the same room
pub const DEFAULT_MESSAGE_FETCH_SPACING_MS: u64 = 3000;

/// Room list fetches allowed per minute (all producers)
pub const DEFAULT_MAX_ROOM_FETCH_PER_MINUTE: usize = 2;

/// Message fetches allowed per minute (all rooms)
pub const DEFAULT_MAX_MESSAGE_FETCH_PER_MINUTE: usize = 15;

// =============================================================================
// Cache Store
// =============================================================================

/// Room list entries are fresh for 30 seconds
pub const DEFAULT_ROOM_CACHE_TTL_SECS: u64 = 30;

/// Message list entries are fresh for 60 seconds
pub const DEFAULT_MESSAGE_CACHE_TTL_SECS: u64 = 60;

/// Maximum number of cached room lists
pub const DEFAULT_MAX_CACHED_ROOM_LISTS: usize = 100;

/// Maximum number of cached message lists
pub const DEFAULT_MAX_CACHED_MESSAGE_LISTS: usize = 1000;

/// Timeout applied to every backend fetch; a pending slot older than this is replaced
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Capacity of broadcast channels for request coalescing
pub const BROADCAST_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// Stabilization
// =============================================================================

/// How long a successfully fetched room list stays frozen (30 minutes)
pub const DEFAULT_STABILIZATION_SECS: u64 = 1800;

/// Maximum number of producers with a frozen room list
pub const MAX_STABILIZED_PRODUCERS: u64 = 256;

// =============================================================================
// Progressive Loading
// =============================================================================

/// Message counts fetched by each backfill tier
pub const DEFAULT_STAGE_SIZES: [usize; 4] = [10, 30, 50, 1000];

/// Delay of each tier from the start of the load, in milliseconds
pub const DEFAULT_STAGE_DELAYS_MS: [u64; 4] = [0, 1000, 3000, 8000];

// =============================================================================
// Coordinator
// =============================================================================

/// First recovery check after an instance reports an error
pub const DEFAULT_RECOVERY_DELAY_SECS: u64 = 5;

/// Delay before re-checking an instance that is still unhealthy
pub const DEFAULT_RECOVERY_RETRY_SECS: u64 = 10;

/// Upper bound for the backed-off recovery delay
pub const DEFAULT_RECOVERY_MAX_DELAY_SECS: u64 = 60;

/// Capacity of the coordination event queue
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Number of primary rooms whose messages are preloaded after a sync
pub const DEFAULT_PRELOAD_MESSAGE_ROOMS: usize = 15;

/// Capacity of the coordinator notice channel
pub const NOTICE_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = formatcp!("{}=debug", env!("CARGO_CRATE_NAME"));

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub stabilization: StabilizationConfig,
    #[serde(default)]
    pub progressive: ProgressiveConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheConfig {
    /// TTL for cached room lists in seconds (default: 30 seconds)
    #[serde(default = "CacheConfig::default_room_ttl")]
    pub room_list_ttl_seconds: u64,
    /// TTL for cached message lists in seconds (default: 1 minute)
    #[serde(default = "CacheConfig::default_message_ttl")]
    pub message_ttl_seconds: u64,
    /// Maximum number of cached room lists (default: 100)
    #[serde(default = "CacheConfig::default_max_room_lists")]
    pub max_room_lists: usize,
    /// Maximum number of cached message lists (default: 1000)
    #[serde(default = "CacheConfig::default_max_message_lists")]
    pub max_message_lists: usize,
    /// Timeout for a single backend fetch in seconds (default: 30)
    #[serde(default = "CacheConfig::default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            room_list_ttl_seconds: Self::default_room_ttl(),
            message_ttl_seconds: Self::default_message_ttl(),
            max_room_lists: Self::default_max_room_lists(),
            max_message_lists: Self::default_max_message_lists(),
            fetch_timeout_seconds: Self::default_fetch_timeout(),
        }
    }
}

impl CacheConfig {
    fn default_room_ttl() -> u64 {
        DEFAULT_ROOM_CACHE_TTL_SECS
    }
    fn default_message_ttl() -> u64 {
        DEFAULT_MESSAGE_CACHE_TTL_SECS
    }
    fn default_max_room_lists() -> usize {
        DEFAULT_MAX_CACHED_ROOM_LISTS
    }
    fn default_max_message_lists() -> usize {
        DEFAULT_MAX_CACHED_MESSAGE_LISTS
    }
    fn default_fetch_timeout() -> u64 {
        DEFAULT_FETCH_TIMEOUT_SECS
    }

    pub fn room_list_ttl(&self) -> Duration {
        Duration::from_secs(self.room_list_ttl_seconds)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

/// Rate limits for backend fetches, per fetch class
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GovernorConfig {
    #[serde(default = "GovernorConfig::default_room_spacing")]
    pub room_fetch_spacing_ms: u64,
    #[serde(default = "GovernorConfig::default_message_spacing")]
    pub message_fetch_spacing_ms: u64,
    #[serde(default = "GovernorConfig::default_max_room_per_minute")]
    pub max_room_fetch_per_minute: usize,
    #[serde(default = "GovernorConfig::default_max_message_per_minute")]
    pub max_message_fetch_per_minute: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            room_fetch_spacing_ms: Self::default_room_spacing(),
            message_fetch_spacing_ms: Self::default_message_spacing(),
            max_room_fetch_per_minute: Self::default_max_room_per_minute(),
            max_message_fetch_per_minute: Self::default_max_message_per_minute(),
        }
    }
}

impl GovernorConfig {
    fn default_room_spacing() -> u64 {
        DEFAULT_ROOM_FETCH_SPACING_MS
    }
    fn default_message_spacing() -> u64 {
        DEFAULT_MESSAGE_FETCH_SPACING_MS
    }
    fn default_max_room_per_minute() -> usize {
        DEFAULT_MAX_ROOM_FETCH_PER_MINUTE
    }
    fn default_max_message_per_minute() -> usize {
        DEFAULT_MAX_MESSAGE_FETCH_PER_MINUTE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StabilizationConfig {
    /// How long a fetched room list stays frozen, in seconds (0 disables)
    #[serde(default = "StabilizationConfig::default_duration")]
    pub duration_seconds: u64,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            duration_seconds: Self::default_duration(),
        }
    }
}

impl StabilizationConfig {
    fn default_duration() -> u64 {
        DEFAULT_STABILIZATION_SECS
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }
}

/// Tiered message backfill plan
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProgressiveConfig {
    #[serde(default = "ProgressiveConfig::default_stage_sizes")]
    pub stage_sizes: Vec<usize>,
    #[serde(default = "ProgressiveConfig::default_stage_delays")]
    pub stage_delays_ms: Vec<u64>,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            stage_sizes: Self::default_stage_sizes(),
            stage_delays_ms: Self::default_stage_delays(),
        }
    }
}

impl ProgressiveConfig {
    fn default_stage_sizes() -> Vec<usize> {
        DEFAULT_STAGE_SIZES.to_vec()
    }
    fn default_stage_delays() -> Vec<u64> {
        DEFAULT_STAGE_DELAYS_MS.to_vec()
    }

    /// Size of the last (largest) tier
    pub fn final_stage_size(&self) -> usize {
        self.stage_sizes.last().copied().unwrap_or(0)
    }

    pub fn stage_delay(&self, stage: usize) -> Duration {
        Duration::from_millis(self.stage_delays_ms.get(stage).copied().unwrap_or(0))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stage_sizes.is_empty() {
            return Err(ConfigError::Validation(
                "progressive.stage_sizes must not be empty".to_string(),
            ));
        }
        if self.stage_sizes.len() != self.stage_delays_ms.len() {
            return Err(ConfigError::Validation(format!(
                "progressive.stage_sizes has {} entries but stage_delays_ms has {}",
                self.stage_sizes.len(),
                self.stage_delays_ms.len()
            )));
        }
        if self.stage_sizes[0] == 0 {
            return Err(ConfigError::Validation(
                "progressive.stage_sizes must be positive".to_string(),
            ));
        }
        if self.stage_sizes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::Validation(
                "progressive.stage_sizes must be strictly increasing".to_string(),
            ));
        }
        if self.stage_delays_ms[0] != 0 {
            return Err(ConfigError::Validation(
                "progressive.stage_delays_ms[0] must be 0 (stage 0 is synchronous)".to_string(),
            ));
        }
        if self.stage_delays_ms.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::Validation(
                "progressive.stage_delays_ms must be non-decreasing".to_string(),
            ));
        }
        Ok(())
    }
}

/// Multi-instance coordination settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    #[serde(default = "CoordinatorConfig::default_recovery_delay")]
    pub recovery_delay_seconds: u64,
    #[serde(default = "CoordinatorConfig::default_recovery_retry")]
    pub recovery_retry_seconds: u64,
    #[serde(default = "CoordinatorConfig::default_recovery_max_delay")]
    pub recovery_max_delay_seconds: u64,
    /// Stop polling after this many failed checks (unset: poll indefinitely)
    #[serde(default)]
    pub max_recovery_attempts: Option<u32>,
    #[serde(default = "CoordinatorConfig::default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default = "CoordinatorConfig::default_preload_message_rooms")]
    pub preload_message_rooms: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            recovery_delay_seconds: Self::default_recovery_delay(),
            recovery_retry_seconds: Self::default_recovery_retry(),
            recovery_max_delay_seconds: Self::default_recovery_max_delay(),
            max_recovery_attempts: None,
            event_queue_capacity: Self::default_event_queue_capacity(),
            preload_message_rooms: Self::default_preload_message_rooms(),
        }
    }
}

impl CoordinatorConfig {
    fn default_recovery_delay() -> u64 {
        DEFAULT_RECOVERY_DELAY_SECS
    }
    fn default_recovery_retry() -> u64 {
        DEFAULT_RECOVERY_RETRY_SECS
    }
    fn default_recovery_max_delay() -> u64 {
        DEFAULT_RECOVERY_MAX_DELAY_SECS
    }
    fn default_event_queue_capacity() -> usize {
        DEFAULT_EVENT_QUEUE_CAPACITY
    }
    fn default_preload_message_rooms() -> usize {
        DEFAULT_PRELOAD_MESSAGE_ROOMS
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_secs(self.recovery_delay_seconds)
    }

    /// Delay before the next recovery check, given how many checks already failed
    pub fn recovery_backoff(&self, failed_checks: u32) -> Duration {
        let factor = 1u64 << failed_checks.saturating_sub(1).min(16);
        let secs = self
            .recovery_retry_seconds
            .saturating_mul(factor)
            .min(self.recovery_max_delay_seconds.max(self.recovery_retry_seconds));
        Duration::from_secs(secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_room_lists == 0 || self.cache.max_message_lists == 0 {
            return Err(ConfigError::Validation(
                "cache capacities must be at least 1".to_string(),
            ));
        }
        if self.cache.fetch_timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "cache.fetch_timeout_seconds must be positive".to_string(),
            ));
        }
        self.progressive.validate()?;
        if self.coordinator.event_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "coordinator.event_queue_capacity must be at least 1".to_string(),
            ));
        }
        if !matches!(self.logging.format.to_ascii_lowercase().as_str(), "text" | "json") {
            return Err(ConfigError::Validation(format!(
                "logging.format must be \"text\" or \"json\", got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
