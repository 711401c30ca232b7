//! Error taxonomy for the cache core.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the cache core.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A value supplied as a tag is not a non-empty string.
    #[error("invalid cache tag at position {index}: {reason}")]
    InvalidTag { index: usize, reason: String },
    /// A bin was referenced that has no registered backend.
    #[error("no cache backend registered for bin `{bin}`")]
    UnknownBin { bin: String },
    /// One or more bins failed to apply an invalidation.
    #[error(transparent)]
    Invalidation(#[from] InvalidationError),
    /// A query or one of its parameters cannot be serialized into a fingerprint.
    #[error("query cannot be fingerprinted: {reason}")]
    UnfingerprintableQuery { reason: String },
    /// A context token in a cache key has no value in the current context.
    #[error("cache context `{token}` could not be resolved")]
    UnresolvedContext { token: String },
    /// Cache metadata could not be encoded as a response header.
    #[error("cache metadata cannot be encoded as header `{header}`: {reason}")]
    Header {
        header: &'static str,
        reason: String,
    },
    /// Bin configuration is malformed.
    #[error("invalid cache configuration for `{key}`: {reason}")]
    Configuration { key: String, reason: String },
    /// A direct backend call (read or write) failed.
    #[error("cache bin `{bin}` failed: {source}")]
    Backend {
        bin: String,
        #[source]
        source: BackendError,
    },
}

impl CacheError {
    pub fn invalid_tag(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidTag {
            index,
            reason: reason.into(),
        }
    }

    pub fn unknown_bin(bin: impl Into<String>) -> Self {
        Self::UnknownBin { bin: bin.into() }
    }

    pub fn unfingerprintable(reason: impl Into<String>) -> Self {
        Self::UnfingerprintableQuery {
            reason: reason.into(),
        }
    }

    pub fn configuration(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn backend(bin: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            bin: bin.into(),
            source,
        }
    }
}

/// Failure of a single backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("call did not complete within {0:?}")]
    Timeout(Duration),
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("backend storage error: {message}")]
    Storage { message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

/// Which fan-out operation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Mark tagged items stale.
    Invalidate,
    /// Remove tagged items outright.
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalidate => "invalidate",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend failure attributed to the bin it happened in.
#[derive(Debug)]
pub struct BinFailure {
    pub bin: String,
    pub error: BackendError,
}

/// Aggregate of every bin that failed during one fan-out.
///
/// Every registered bin was attempted; `succeeded` lists the bins that did
/// apply the operation.
#[derive(Debug, Error)]
#[error("tag {operation} failed for {} bin(s): {}", .failures.len(), describe(.failures))]
pub struct InvalidationError {
    pub operation: Operation,
    pub failures: Vec<BinFailure>,
    pub succeeded: Vec<String>,
}

impl InvalidationError {
    /// Names of the bins that failed, in bin order.
    pub fn failed_bins(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.bin.as_str()).collect()
    }
}

fn describe(failures: &[BinFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.bin, failure.error))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_message_names_every_failed_bin() {
        let err = InvalidationError {
            operation: Operation::Invalidate,
            failures: vec![
                BinFailure {
                    bin: "page".to_string(),
                    error: BackendError::unavailable("connection refused"),
                },
                BinFailure {
                    bin: "render".to_string(),
                    error: BackendError::Timeout(Duration::from_millis(50)),
                },
            ],
            succeeded: vec!["data".to_string()],
        };

        let message = err.to_string();
        assert!(message.starts_with("tag invalidate failed for 2 bin(s)"));
        assert!(message.contains("page (backend unavailable: connection refused)"));
        assert!(message.contains("render (call did not complete within 50ms)"));
        assert!(!message.contains("data"));
        assert_eq!(err.failed_bins(), vec!["page", "render"]);
    }

    #[test]
    fn invalidation_error_converts_into_cache_error() {
        let err: CacheError = InvalidationError {
            operation: Operation::Delete,
            failures: Vec::new(),
            succeeded: Vec::new(),
        }
        .into();
        assert!(matches!(err, CacheError::Invalidation(_)));
    }
}
