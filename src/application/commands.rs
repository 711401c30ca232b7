//! Handlers for the `tagcache` subcommands.
//!
//! Output is written as pretty JSON so it can be piped into other tools.

use std::io::Write;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::{
    BackendKind, BackendRegistry, CacheConfig, CacheTrigger, FINGERPRINT_SCHEME, Operation, QueryCache,
    TagInvalidator, TriggerOutcome, fingerprint,
};
use crate::config::{Command, FingerprintArgs};

use super::error::AppError;

#[derive(Debug, Serialize)]
struct BinView<'a> {
    bin: &'a str,
    backend: &'static str,
}

#[derive(Debug, Serialize)]
struct ReportView {
    operation: &'static str,
    tags: Vec<String>,
    bins: Vec<String>,
    retried: bool,
}

#[derive(Debug, Serialize)]
struct FingerprintView<'a> {
    scheme: &'static str,
    sql: &'a str,
    params: &'a [Value],
    fingerprint: String,
    key: String,
}

/// Run `command` against the bins described by `cache`.
pub async fn execute<W: Write>(
    command: &Command,
    cache: &CacheConfig,
    out: &mut W,
) -> Result<(), AppError> {
    match command {
        Command::Bins => {
            let registry = BackendRegistry::from_config(cache)?;
            list_bins(&registry, &cache.required_bins, out)
        }
        Command::Invalidate(args) => {
            let trigger = trigger_for(cache)?;
            apply_tags(&trigger, Operation::Invalidate, &args.tags, out).await
        }
        Command::Delete(args) => {
            let trigger = trigger_for(cache)?;
            apply_tags(&trigger, Operation::Delete, &args.tags, out).await
        }
        Command::Fingerprint(args) => print_fingerprint(args, out),
    }
}

fn trigger_for(cache: &CacheConfig) -> Result<CacheTrigger, AppError> {
    if process_local_only(cache) {
        warn!(
            bins = cache.bins.len(),
            "every bin is in-memory, so this invalidation reaches no shared cache"
        );
    }
    let registry = Arc::new(BackendRegistry::from_config(cache)?);
    registry.validate(&cache.required_bins)?;
    let invalidator = TagInvalidator::from_config(registry, cache);
    Ok(CacheTrigger::from_config(invalidator, cache))
}

/// True when no configured bin outlives the process.
fn process_local_only(cache: &CacheConfig) -> bool {
    cache
        .bins
        .values()
        .all(|bin| bin.backend == BackendKind::Memory)
}

/// Validate the registry and print every bin with its backend kind.
pub fn list_bins<W: Write, S: AsRef<str>>(
    registry: &BackendRegistry,
    required: &[S],
    out: &mut W,
) -> Result<(), AppError> {
    registry.validate(required)?;

    let bins = registry.all_bins();
    let views: Vec<BinView<'_>> = bins
        .iter()
        .map(|(bin, backend)| BinView {
            bin,
            backend: backend.kind(),
        })
        .collect();
    write_json(out, &views)
}

/// Broadcast `operation` for `tags`, retrying once if any bin failed.
pub async fn apply_tags<W: Write>(
    trigger: &CacheTrigger,
    operation: Operation,
    tags: &[String],
    out: &mut W,
) -> Result<(), AppError> {
    let outcome = match operation {
        Operation::Invalidate => trigger.tags_changed(tags).await?,
        Operation::Delete => trigger.tags_deleted(tags).await?,
    };

    let view = match outcome {
        TriggerOutcome::Applied(report) => ReportView {
            operation: report.operation.as_str(),
            tags: report.tags.to_strings(),
            bins: report.bins,
            retried: false,
        },
        TriggerOutcome::Deferred(failure) => {
            warn!(
                operation = %operation,
                failed_bins = ?failure.failed_bins,
                "retrying incomplete invalidation"
            );
            let summary = trigger.retry_failed(1).await;
            if summary.recovered == 0 {
                let bins = trigger
                    .failures()
                    .snapshot()
                    .pop()
                    .map(|latest| latest.failed_bins)
                    .unwrap_or(failure.failed_bins);
                return Err(AppError::Incomplete { operation, bins });
            }
            ReportView {
                operation: operation.as_str(),
                tags: failure.tags.to_strings(),
                bins: trigger
                    .invalidator()
                    .registry()
                    .bin_names()
                    .map(str::to_string)
                    .collect(),
                retried: true,
            }
        }
    };

    info!(
        operation = view.operation,
        tags = view.tags.len(),
        bins = view.bins.len(),
        "tag broadcast applied"
    );
    write_json(out, &view)
}

/// Print the fingerprint and query-cache key of `args`.
pub fn print_fingerprint<W: Write>(args: &FingerprintArgs, out: &mut W) -> Result<(), AppError> {
    let params: Vec<Value> = args.params.iter().map(|raw| parse_param(raw)).collect();

    let view = FingerprintView {
        scheme: FINGERPRINT_SCHEME,
        sql: &args.sql,
        params: &params,
        fingerprint: fingerprint(&args.sql, &params)?,
        key: QueryCache::key_for(&args.sql, &params)?,
    };
    write_json(out, &view)
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn write_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<(), AppError> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
