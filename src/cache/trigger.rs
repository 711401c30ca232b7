//! Cache trigger service.
//!
//! Entry point for business code reacting to data changes. Content writes must
//! not fail because a cache bin is unavailable, so backend failures are logged
//! and parked in a bounded [`FailureLog`] for a later retry instead of being
//! returned. Malformed tags are still returned as errors.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::config::CacheConfig;
use super::error::{CacheError, InvalidationError, Operation};
use super::invalidator::{InvalidationReport, TagInvalidator};
use super::lock::mutex_lock;
use super::tags::TagSet;

const SOURCE: &str = "cache::trigger";

const METRIC_FAILURE_LOG_LEN: &str = "tagcache_failure_log_len";
const METRIC_FAILURE_LOG_DROPPED: &str = "tagcache_failure_log_dropped_total";

/// Monotonic sequence number of a recorded failure within this process.
pub type Epoch = u64;

/// An invalidation that did not reach every bin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedInvalidation {
    pub id: Uuid,
    pub epoch: Epoch,
    pub operation: Operation,
    pub tags: TagSet,
    pub failed_bins: Vec<String>,
    pub timestamp: OffsetDateTime,
}

/// Bounded FIFO of failed invalidations awaiting retry.
///
/// When full, recording a new failure drops the oldest one.
pub struct FailureLog {
    entries: Mutex<VecDeque<FailedInvalidation>>,
    limit: NonZeroUsize,
    epoch_counter: AtomicU64,
}

impl FailureLog {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            limit,
            epoch_counter: AtomicU64::new(0),
        }
    }

    fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn record(&self, error: &InvalidationError, tags: &TagSet) -> FailedInvalidation {
        let entry = FailedInvalidation {
            id: Uuid::new_v4(),
            epoch: self.next_epoch(),
            operation: error.operation,
            tags: tags.clone(),
            failed_bins: error.failed_bins().into_iter().map(str::to_string).collect(),
            timestamp: OffsetDateTime::now_utc(),
        };

        let mut entries = mutex_lock(&self.entries, SOURCE, "record");
        if entries.len() >= self.limit.get() {
            if let Some(dropped) = entries.pop_front() {
                warn!(
                    failure_id = %dropped.id,
                    failure_epoch = dropped.epoch,
                    tags = %dropped.tags,
                    "Failure log full, dropping oldest failed invalidation"
                );
            }
            counter!(METRIC_FAILURE_LOG_DROPPED).increment(1);
        }
        entries.push_back(entry.clone());
        gauge!(METRIC_FAILURE_LOG_LEN).set(entries.len() as f64);
        entry
    }

    /// Remove up to `limit` entries, oldest first.
    pub fn drain(&self, limit: usize) -> Vec<FailedInvalidation> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "drain");
        let count = limit.min(entries.len());
        let drained = entries.drain(..count).collect();
        gauge!(METRIC_FAILURE_LOG_LEN).set(entries.len() as f64);
        drained
    }

    pub fn snapshot(&self) -> Vec<FailedInvalidation> {
        mutex_lock(&self.entries, SOURCE, "snapshot")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit.get()
    }
}

/// What happened to a triggered invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Every bin applied the operation.
    Applied(InvalidationReport),
    /// At least one bin failed; the failure was recorded for retry.
    Deferred(FailedInvalidation),
}

impl TriggerOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Summary of one [`CacheTrigger::retry_failed`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub attempted: usize,
    pub recovered: usize,
    pub failed_again: usize,
}

/// Availability-first wrapper around [`TagInvalidator`].
///
/// # Usage
///
/// ```ignore
/// // After a node was saved:
/// trigger.tags_changed(&["node:5", "node_list"]).await?;
/// ```
pub struct CacheTrigger {
    invalidator: TagInvalidator,
    failures: FailureLog,
}

impl CacheTrigger {
    pub fn new(invalidator: TagInvalidator, failure_log_limit: NonZeroUsize) -> Self {
        Self {
            invalidator,
            failures: FailureLog::new(failure_log_limit),
        }
    }

    pub fn from_config(invalidator: TagInvalidator, config: &CacheConfig) -> Self {
        Self::new(invalidator, config.failure_log_limit_non_zero())
    }

    /// Mark everything tagged with any of `tags` stale.
    pub async fn tags_changed<S: AsRef<str>>(
        &self,
        tags: &[S],
    ) -> Result<TriggerOutcome, CacheError> {
        let tags = TagSet::try_from_strs(tags)?;
        self.run(Operation::Invalidate, tags).await
    }

    /// Remove everything tagged with any of `tags`.
    pub async fn tags_deleted<S: AsRef<str>>(
        &self,
        tags: &[S],
    ) -> Result<TriggerOutcome, CacheError> {
        let tags = TagSet::try_from_strs(tags)?;
        self.run(Operation::Delete, tags).await
    }

    /// Re-issue up to `limit` recorded failures. Failures that persist are
    /// recorded again with a new epoch.
    pub async fn retry_failed(&self, limit: usize) -> RetrySummary {
        let pending = self.failures.drain(limit);
        let mut summary = RetrySummary {
            attempted: pending.len(),
            ..Default::default()
        };

        for failure in pending {
            match self.run(failure.operation, failure.tags).await {
                Ok(TriggerOutcome::Applied(_)) => summary.recovered += 1,
                Ok(TriggerOutcome::Deferred(_)) | Err(_) => summary.failed_again += 1,
            }
        }

        info!(
            attempted = summary.attempted,
            recovered = summary.recovered,
            failed_again = summary.failed_again,
            "Retried failed cache invalidations"
        );
        summary
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    pub fn invalidator(&self) -> &TagInvalidator {
        &self.invalidator
    }

    async fn run(&self, operation: Operation, tags: TagSet) -> Result<TriggerOutcome, CacheError> {
        let result = match operation {
            Operation::Invalidate => self.invalidator.invalidate_set(&tags).await,
            Operation::Delete => self.invalidator.delete_set(&tags).await,
        };

        match result {
            Ok(report) => Ok(TriggerOutcome::Applied(report)),
            Err(CacheError::Invalidation(error)) => {
                let failure = self.failures.record(&error, &tags);
                warn!(
                    failure_id = %failure.id,
                    failure_epoch = failure.epoch,
                    error = %error,
                    "Cache invalidation deferred for retry"
                );
                Ok(TriggerOutcome::Deferred(failure))
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::backend::{CacheBackend, CacheItem, Lookup};
    use crate::cache::error::{BackendError, BinFailure};
    use crate::cache::registry::BackendRegistry;

    fn tags(values: &[&str]) -> TagSet {
        TagSet::try_from_strs(values).expect("valid tags")
    }

    fn failure(operation: Operation, bin: &str) -> InvalidationError {
        InvalidationError {
            operation,
            failures: vec![BinFailure {
                bin: bin.to_string(),
                error: BackendError::unavailable("down"),
            }],
            succeeded: Vec::new(),
        }
    }

    /// Fails until switched healthy.
    #[derive(Default)]
    struct FlakyBackend {
        healthy: AtomicBool,
    }

    impl FlakyBackend {
        fn outcome(&self) -> Result<(), BackendError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BackendError::unavailable("connection refused"))
            }
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        fn kind(&self) -> &'static str {
            "flaky"
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
            self.outcome()
        }

        async fn delete_tags(&self, _tags: &TagSet) -> Result<(), BackendError> {
            self.outcome()
        }
    }

    fn trigger(backend: Arc<FlakyBackend>, limit: usize) -> CacheTrigger {
        let registry = BackendRegistry::builder()
            .register("render", backend)
            .build()
            .expect("registry");
        let invalidator = TagInvalidator::new(Arc::new(registry), Duration::from_secs(1));
        CacheTrigger::new(invalidator, NonZeroUsize::new(limit).expect("non-zero"))
    }

    #[test]
    fn record_and_drain_fifo() {
        let log = FailureLog::new(NonZeroUsize::new(8).expect("non-zero"));
        log.record(&failure(Operation::Invalidate, "page"), &tags(&["a"]));
        log.record(&failure(Operation::Delete, "render"), &tags(&["b"]));
        log.record(&failure(Operation::Invalidate, "data"), &tags(&["c"]));
        assert_eq!(log.len(), 3);

        let drained = log.drain(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].tags.to_strings(), vec!["a"]);
        assert_eq!(drained[1].operation, Operation::Delete);
        assert_eq!(drained[1].failed_bins, vec!["render"]);
        assert!(drained[0].epoch < drained[1].epoch);
        assert!(!drained[0].id.is_nil());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let log = FailureLog::new(NonZeroUsize::new(2).expect("non-zero"));
        log.record(&failure(Operation::Invalidate, "page"), &tags(&["a"]));
        log.record(&failure(Operation::Invalidate, "page"), &tags(&["b"]));
        log.record(&failure(Operation::Invalidate, "page"), &tags(&["c"]));

        let remaining: Vec<_> = log
            .snapshot()
            .into_iter()
            .map(|entry| entry.tags.join(","))
            .collect();
        assert_eq!(remaining, vec!["b", "c"]);
    }

    #[test]
    fn recovers_from_poisoned_lock() {
        let log = FailureLog::new(NonZeroUsize::new(2).expect("non-zero"));

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = log.entries.lock().expect("failure log lock should be acquired");
            panic!("poison failure log lock");
        }));

        log.record(&failure(Operation::Invalidate, "page"), &tags(&["a"]));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn backend_failures_are_deferred_not_returned() {
        let backend = Arc::new(FlakyBackend::default());
        let trigger = trigger(Arc::clone(&backend), 4);

        let outcome = trigger
            .tags_changed(&["node:5"])
            .await
            .expect("backend failures do not surface as errors");
        let TriggerOutcome::Deferred(failure) = outcome else {
            panic!("expected deferred outcome");
        };
        assert_eq!(failure.failed_bins, vec!["render"]);
        assert_eq!(trigger.failures().len(), 1);
    }

    #[tokio::test]
    async fn invalid_tags_are_still_errors() {
        let trigger = trigger(Arc::new(FlakyBackend::default()), 4);
        let err = trigger.tags_deleted(&[""]).await.expect_err("empty tag");
        assert!(matches!(err, CacheError::InvalidTag { .. }));
        assert!(trigger.failures().is_empty());
    }

    #[tokio::test]
    async fn retry_replays_recorded_failures() {
        let backend = Arc::new(FlakyBackend::default());
        let trigger = trigger(Arc::clone(&backend), 4);

        trigger.tags_changed(&["node:5"]).await.expect("deferred");
        trigger.tags_deleted(&["node:6"]).await.expect("deferred");

        let summary = trigger.retry_failed(10).await;
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.failed_again, 2);
        assert_eq!(trigger.failures().len(), 2);

        backend.healthy.store(true, Ordering::SeqCst);
        let summary = trigger.retry_failed(1).await;
        assert_eq!(
            summary,
            RetrySummary {
                attempted: 1,
                recovered: 1,
                failed_again: 0
            }
        );
        assert_eq!(trigger.failures().len(), 1);

        let outcome = trigger.tags_changed(&["node:7"]).await.expect("applied");
        assert!(outcome.is_applied());
    }
}
