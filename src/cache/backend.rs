//! Contract every cache bin backend fulfils.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use super::cacheable::MaxAge;
use super::error::BackendError;
use super::tags::TagSet;

/// A stored artifact together with the metadata it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub data: Bytes,
    pub tags: TagSet,
    pub max_age: MaxAge,
    /// Unix timestamp (seconds) of the write.
    pub created: u64,
}

impl CacheItem {
    pub fn new(data: impl Into<Bytes>, tags: TagSet, max_age: MaxAge) -> Self {
        Self {
            data: data.into(),
            tags,
            max_age,
            created: unix_now(),
        }
    }

    /// Unix timestamp after which the item is expired, if it ever expires.
    pub fn expires_at(&self) -> Option<u64> {
        match self.max_age {
            MaxAge::Permanent => None,
            MaxAge::Seconds(seconds) => Some(self.created.saturating_add(u64::from(seconds))),
        }
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at().is_some_and(|expires| now >= expires)
    }
}

/// Outcome of a read.
///
/// `Stale` entries are still physically present but must not be served as
/// fresh: one of their tags was invalidated or their max-age elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Fresh(CacheItem),
    Stale(CacheItem),
    Absent,
}

impl Lookup {
    pub fn fresh(self) -> Option<CacheItem> {
        match self {
            Self::Fresh(item) => Some(item),
            Self::Stale(_) | Self::Absent => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Storage behind one cache bin.
///
/// Implementations must make an invalidation visible to every subsequent read
/// issued through the same backend instance.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend kind used in logs, e.g. `memory`.
    fn kind(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Lookup, BackendError>;

    /// Store `item` under `key`, replacing any previous entry with a fresh one.
    ///
    /// Items with a zero max-age are never written.
    async fn set(&self, key: &str, item: CacheItem) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Mark every item carrying any of `tags` as stale.
    async fn invalidate_by_tags(&self, tags: &TagSet) -> Result<(), BackendError>;

    /// Remove every item carrying any of `tags`.
    async fn delete_tags(&self, tags: &TagSet) -> Result<(), BackendError>;
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
