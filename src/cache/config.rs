//! Cache configuration.
//!
//! Bins and invalidation behavior are read from the `[cache]` table of
//! `tagcache.toml`:
//!
//! ```toml
//! [cache]
//! invalidation_timeout_ms = 5000
//! required_bins = ["page", "render"]
//!
//! [cache.database]
//! url = "postgres://localhost/app"
//!
//! [cache.bins.page]
//! backend = "memory"
//! capacity = 2000
//!
//! [cache.bins.render]
//! backend = "postgres"
//! ```

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_INVALIDATION_TIMEOUT_MS: u64 = 5000;
const DEFAULT_FAILURE_LOG_LIMIT: usize = 256;
const DEFAULT_BIN_CAPACITY: usize = 1000;
const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_PAGE_BIN: &str = "page";
const DEFAULT_BINS: [&str; 3] = ["page", "render", "data"];

/// Storage engine behind a bin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Postgres,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
        }
    }
}

/// Settings for one bin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BinSettings {
    pub backend: BackendKind,
    /// Maximum entries held by a memory bin.
    pub capacity: usize,
}

impl Default for BinSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            capacity: DEFAULT_BIN_CAPACITY,
        }
    }
}

impl BinSettings {
    /// Capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Connection settings shared by every `postgres` bin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
        }
    }
}

/// Cache configuration from `tagcache.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound for one bin's invalidation call.
    pub invalidation_timeout_ms: u64,
    /// Failed invalidations kept for retry before the oldest is dropped.
    pub failure_log_limit: usize,
    /// Bins that must exist for startup validation to pass.
    pub required_bins: Vec<String>,
    /// Bin used by the response page cache.
    pub page_bin: String,
    pub database: DatabaseConfig,
    pub bins: BTreeMap<String, BinSettings>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            invalidation_timeout_ms: DEFAULT_INVALIDATION_TIMEOUT_MS,
            failure_log_limit: DEFAULT_FAILURE_LOG_LIMIT,
            required_bins: Vec::new(),
            page_bin: DEFAULT_PAGE_BIN.to_string(),
            database: DatabaseConfig::default(),
            bins: DEFAULT_BINS
                .iter()
                .map(|bin| (bin.to_string(), BinSettings::default()))
                .collect(),
        }
    }
}

impl CacheConfig {
    pub fn invalidation_timeout(&self) -> Duration {
        Duration::from_millis(self.invalidation_timeout_ms)
    }

    /// Failure log limit as NonZeroUsize, clamping to 1 if zero.
    pub fn failure_log_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.failure_log_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
