//! Invalidation across several bins, through the public API only.

mod support;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use support::{RecordingBackend, tags};
use tagcache::cache::{
    BackendError, BackendHandle, BackendRegistry, CacheBackend, CacheError, CacheItem,
    CacheTrigger, Lookup, MaxAge, MemoryBackend, Operation, TagInvalidator, TriggerOutcome,
};

fn memory(bin: &str, capacity: usize) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(
        bin,
        NonZeroUsize::new(capacity).expect("non-zero capacity"),
    ))
}

fn invalidator(bins: Vec<(&str, BackendHandle)>) -> TagInvalidator {
    let registry = bins
        .into_iter()
        .fold(BackendRegistry::builder(), |builder, (bin, backend)| {
            builder.register(bin, backend)
        })
        .build()
        .expect("registry");
    TagInvalidator::new(Arc::new(registry), Duration::from_secs(1))
}

#[tokio::test]
async fn one_failing_bin_does_not_stop_the_others() {
    let a = RecordingBackend::healthy();
    let b = RecordingBackend::failing();
    let c = RecordingBackend::healthy();
    let invalidator = invalidator(vec![
        ("a", a.clone() as BackendHandle),
        ("b", b.clone() as BackendHandle),
        ("c", c.clone() as BackendHandle),
    ]);

    let err = invalidator
        .invalidate_tags(&["node:5"])
        .await
        .expect_err("bin b fails");

    assert_eq!(a.invalidations(), 1);
    assert_eq!(b.invalidations(), 1);
    assert_eq!(c.invalidations(), 1);

    match err {
        CacheError::Invalidation(error) => {
            assert_eq!(error.operation, Operation::Invalidate);
            assert_eq!(error.failed_bins(), vec!["b"]);
            assert_eq!(error.succeeded, vec!["a".to_string(), "c".to_string()]);
            assert!(matches!(
                error.failures[0].error,
                BackendError::Unavailable { .. }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn slow_bin_times_out_while_fast_bins_apply() {
    let fast = RecordingBackend::healthy();
    let slow = RecordingBackend::slow(Duration::from_secs(30));
    let invalidator = invalidator(vec![
        ("fast", fast.clone() as BackendHandle),
        ("slow", slow.clone() as BackendHandle),
    ]);

    let err = invalidator
        .delete_tags(&["user:1"])
        .await
        .expect_err("slow bin times out");

    assert_eq!(fast.deletions(), 1);
    match err {
        CacheError::Invalidation(error) => {
            assert_eq!(error.failed_bins(), vec!["slow"]);
            assert!(matches!(error.failures[0].error, BackendError::Timeout(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn invalidated_items_read_stale_in_every_bin() {
    let page = memory("page", 8);
    let render = memory("render", 8);
    let invalidator = invalidator(vec![
        ("page", page.clone() as BackendHandle),
        ("render", render.clone() as BackendHandle),
    ]);

    for backend in [&page, &render] {
        backend
            .set(
                "node:5:full",
                CacheItem::new("<article/>", tags(&["node:5", "node_list"]), MaxAge::Permanent),
            )
            .await
            .expect("set");
        backend
            .set(
                "user:1:teaser",
                CacheItem::new("<p/>", tags(&["user:1"]), MaxAge::Permanent),
            )
            .await
            .expect("set");
    }

    let report = invalidator
        .invalidate_tags(&["node:5"])
        .await
        .expect("invalidate");
    assert_eq!(report.bins, vec!["page".to_string(), "render".to_string()]);

    for backend in [&page, &render] {
        let lookup = backend.get("node:5:full").await.expect("get");
        assert!(lookup.is_stale(), "tagged item is stale in {}", backend.bin());
        let untouched = backend.get("user:1:teaser").await.expect("get");
        assert!(untouched.is_fresh(), "unrelated item stays fresh");
    }

    // Rewriting after invalidation yields a fresh item again.
    page.set(
        "node:5:full",
        CacheItem::new("<article>v2</article>", tags(&["node:5"]), MaxAge::Permanent),
    )
    .await
    .expect("set");
    match page.get("node:5:full").await.expect("get") {
        Lookup::Fresh(item) => assert_eq!(&item.data[..], b"<article>v2</article>"),
        other => panic!("expected fresh item, got {other:?}"),
    }
}

#[tokio::test]
async fn deleted_tags_remove_items() {
    let page = memory("page", 8);
    let invalidator = invalidator(vec![("page", page.clone() as BackendHandle)]);

    page.set(
        "node:5:full",
        CacheItem::new("x", tags(&["node:5"]), MaxAge::Seconds(600)),
    )
    .await
    .expect("set");

    invalidator.delete_tags(&["node:5"]).await.expect("delete");
    assert!(page.get("node:5:full").await.expect("get").is_absent());
    assert!(page.is_empty());
}

#[tokio::test]
async fn trigger_defers_and_recovers_failed_bins() {
    let healthy = RecordingBackend::healthy();
    let flaky = RecordingBackend::failing();
    let registry = BackendRegistry::builder()
        .register("page", healthy.clone() as BackendHandle)
        .register("render", flaky.clone() as BackendHandle)
        .build()
        .expect("registry");
    let trigger = CacheTrigger::new(
        TagInvalidator::new(Arc::new(registry), Duration::from_secs(1)),
        NonZeroUsize::new(8).expect("non-zero"),
    );

    let outcome = trigger
        .tags_changed(&["node:5", "node_list"])
        .await
        .expect("valid tags");
    match outcome {
        TriggerOutcome::Deferred(failure) => {
            assert_eq!(failure.failed_bins, vec!["render".to_string()]);
            assert_eq!(failure.tags, tags(&["node_list", "node:5"]));
        }
        TriggerOutcome::Applied(report) => panic!("unexpected success: {report:?}"),
    }
    assert_eq!(trigger.failures().len(), 1);

    flaky.recover();
    let summary = trigger.retry_failed(10).await;
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.recovered, 1);
    assert!(trigger.failures().is_empty());
    assert_eq!(healthy.invalidations(), 2);
    assert_eq!(flaky.invalidations(), 2);
}
