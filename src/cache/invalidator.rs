//! Tag invalidation fan-out.
//!
//! Every registered bin is attempted for every request. Calls run
//! concurrently, each bounded by the configured timeout, and the failures are
//! aggregated into one [`InvalidationError`] once all bins have answered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::error::{BackendError, BinFailure, CacheError, InvalidationError, Operation};
use super::registry::BackendRegistry;
use super::tags::TagSet;

const METRIC_INVALIDATION_TOTAL: &str = "tagcache_invalidation_total";
const METRIC_INVALIDATION_BIN_FAILURE: &str = "tagcache_invalidation_bin_failure_total";
const METRIC_INVALIDATION_MS: &str = "tagcache_invalidation_ms";

/// Outcome of a fan-out in which every bin succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationReport {
    pub operation: Operation,
    pub tags: TagSet,
    /// Bins that applied the operation, in bin order.
    pub bins: Vec<String>,
}

/// Broadcasts tag invalidations and deletions to every bin of a registry.
#[derive(Debug, Clone)]
pub struct TagInvalidator {
    registry: Arc<BackendRegistry>,
    timeout: Duration,
}

impl TagInvalidator {
    pub fn new(registry: Arc<BackendRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn from_config(registry: Arc<BackendRegistry>, config: &CacheConfig) -> Self {
        Self::new(registry, config.invalidation_timeout())
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mark every item carrying any of `tags` stale in every bin.
    ///
    /// Tags are validated before any backend is touched.
    pub async fn invalidate_tags<S: AsRef<str>>(
        &self,
        tags: &[S],
    ) -> Result<InvalidationReport, CacheError> {
        let tags = TagSet::try_from_strs(tags)?;
        self.invalidate_set(&tags).await
    }

    /// Remove every item carrying any of `tags` from every bin.
    pub async fn delete_tags<S: AsRef<str>>(
        &self,
        tags: &[S],
    ) -> Result<InvalidationReport, CacheError> {
        let tags = TagSet::try_from_strs(tags)?;
        self.delete_set(&tags).await
    }

    /// Like [`TagInvalidator::invalidate_tags`] for untyped input such as a
    /// decoded JSON payload. Any non-string element aborts the call.
    pub async fn invalidate_values(
        &self,
        values: &[Value],
    ) -> Result<InvalidationReport, CacheError> {
        let tags = TagSet::from_values(values)?;
        self.invalidate_set(&tags).await
    }

    pub async fn invalidate_set(&self, tags: &TagSet) -> Result<InvalidationReport, CacheError> {
        self.fan_out(Operation::Invalidate, tags).await
    }

    pub async fn delete_set(&self, tags: &TagSet) -> Result<InvalidationReport, CacheError> {
        self.fan_out(Operation::Delete, tags).await
    }

    #[instrument(skip(self, tags), fields(operation = %operation, tags = %tags))]
    async fn fan_out(
        &self,
        operation: Operation,
        tags: &TagSet,
    ) -> Result<InvalidationReport, CacheError> {
        if tags.is_empty() {
            debug!("no tags given, nothing to do");
            return Ok(InvalidationReport {
                operation,
                tags: TagSet::empty(),
                bins: Vec::new(),
            });
        }

        let started_at = Instant::now();
        let limit = self.timeout;
        let calls = self
            .registry
            .all_bins()
            .into_iter()
            .map(|(bin, backend)| async move {
                let call = async {
                    match operation {
                        Operation::Invalidate => backend.invalidate_by_tags(tags).await,
                        Operation::Delete => backend.delete_tags(tags).await,
                    }
                };
                let result = match timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout(limit)),
                };
                (bin, result)
            });

        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for (bin, result) in join_all(calls).await {
            match result {
                Ok(()) => succeeded.push(bin.to_string()),
                Err(error) => {
                    warn!(bin, error = %error, "cache bin failed to apply tag {operation}");
                    counter!(
                        METRIC_INVALIDATION_BIN_FAILURE,
                        "operation" => operation.as_str(),
                        "bin" => bin.to_string()
                    )
                    .increment(1);
                    failures.push(BinFailure {
                        bin: bin.to_string(),
                        error,
                    });
                }
            }
        }

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_INVALIDATION_MS, "operation" => operation.as_str()).record(elapsed_ms);
        let outcome = if failures.is_empty() { "ok" } else { "partial" };
        counter!(
            METRIC_INVALIDATION_TOTAL,
            "operation" => operation.as_str(),
            "outcome" => outcome
        )
        .increment(1);

        info!(
            succeeded = succeeded.len(),
            failed = failures.len(),
            elapsed_ms,
            "Cache tag {operation} fanned out"
        );

        if failures.is_empty() {
            Ok(InvalidationReport {
                operation,
                tags: tags.clone(),
                bins: succeeded,
            })
        } else {
            Err(InvalidationError {
                operation,
                failures,
                succeeded,
            }
            .into())
        }
    }
}
