use std::io;
use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr; stdout carries command output.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .with_writer(io::stderr)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(io::stderr)
            .compact()
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tagcache_invalidation_total",
            Unit::Count,
            "Invalidation broadcasts by operation and outcome."
        );
        describe_counter!(
            "tagcache_invalidation_bin_failure_total",
            Unit::Count,
            "Bins that failed or timed out during an invalidation broadcast."
        );
        describe_histogram!(
            "tagcache_invalidation_ms",
            Unit::Milliseconds,
            "Invalidation broadcast latency in milliseconds."
        );
        describe_counter!(
            "tagcache_memory_hit_total",
            Unit::Count,
            "Fresh reads served by memory bins."
        );
        describe_counter!(
            "tagcache_memory_stale_total",
            Unit::Count,
            "Reads from memory bins that found an invalidated or expired item."
        );
        describe_counter!(
            "tagcache_memory_miss_total",
            Unit::Count,
            "Reads from memory bins that found nothing."
        );
        describe_counter!(
            "tagcache_memory_evict_total",
            Unit::Count,
            "Memory bin evictions due to capacity."
        );
        describe_gauge!(
            "tagcache_failure_log_len",
            Unit::Count,
            "Failed invalidations waiting for retry."
        );
        describe_counter!(
            "tagcache_failure_log_dropped_total",
            Unit::Count,
            "Failed invalidations dropped because the failure log was full."
        );
    });
}
