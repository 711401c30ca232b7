#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tagcache::cache::{BackendError, CacheBackend, CacheItem, Lookup, TagSet};

/// Counts tag operations and fails them while unhealthy.
#[derive(Default)]
pub struct RecordingBackend {
    invalidations: AtomicUsize,
    deletions: AtomicUsize,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingBackend {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let backend = Self::default();
        backend.failing.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    pub fn deletions(&self) -> usize {
        self.deletions.load(Ordering::SeqCst)
    }

    async fn outcome(&self) -> Result<(), BackendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            Err(BackendError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for RecordingBackend {
    fn kind(&self) -> &'static str {
        "recording"
    }

    async fn get(&self, _key: &str) -> Result<Lookup, BackendError> {
        Ok(Lookup::Absent)
    }

    async fn set(&self, _key: &str, _item: CacheItem) -> Result<(), BackendError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn invalidate_by_tags(&self, _tags: &TagSet) -> Result<(), BackendError> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.outcome().await
    }

    async fn delete_tags(&self, _tags: &TagSet) -> Result<(), BackendError> {
        self.deletions.fetch_add(1, Ordering::SeqCst);
        self.outcome().await
    }
}

pub fn tags(values: &[&str]) -> TagSet {
    TagSet::try_from_strs(values).expect("valid tags")
}
