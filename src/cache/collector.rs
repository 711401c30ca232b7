//! Task-local cache metadata collector.
//!
//! While a response is produced, every cacheable artifact it is built from
//! reports its metadata through [`record`]. The collected metadata is the
//! composite of all of them and ends up on the response headers or decides
//! whether the response may be stored at all.

use std::cell::RefCell;
use std::future::Future;

use super::cacheable::{Cacheable, CacheableMetadata};
use super::tags::TagSet;

tokio::task_local! {
    static COLLECTED: RefCell<CacheableMetadata>;
}

/// Fold `artifact`'s metadata into the active collector.
///
/// Without an active collector the call is ignored.
///
/// # Example
///
/// ```ignore
/// let teaser = render_teaser(&node).await?;
/// tagcache::cache::collector::record(&teaser);
/// ```
pub fn record<C: Cacheable + ?Sized>(artifact: &C) {
    let _ = COLLECTED.try_with(|collected| collected.borrow_mut().add_dependency(artifact));
}

/// Add bare tags to the active collector.
pub fn record_tags(tags: &TagSet) {
    let _ = COLLECTED.try_with(|collected| collected.borrow_mut().add_tags(tags));
}

/// Snapshot of what was collected so far, if a collector is active.
pub fn current() -> Option<CacheableMetadata> {
    COLLECTED.try_with(|collected| collected.borrow().clone()).ok()
}

pub fn is_active() -> bool {
    COLLECTED.try_with(|_| ()).is_ok()
}

/// Run `fut` with a fresh collector and return its output together with the
/// composite metadata recorded while it ran.
pub async fn with_collector<F, R>(fut: F) -> (R, CacheableMetadata)
where
    F: Future<Output = R>,
{
    COLLECTED
        .scope(RefCell::new(CacheableMetadata::new()), async {
            let output = fut.await;
            let collected = current().unwrap_or_default();
            (output, collected)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::cacheable::{CacheKeyPart, MaxAge};

    fn tags(values: &[&str]) -> TagSet {
        TagSet::try_from_strs(values).expect("valid tags")
    }

    #[tokio::test]
    async fn record_without_collector_is_no_op() {
        record(&CacheableMetadata::new().with_tags(tags(&["node:1"])));
        assert!(!is_active());
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn with_collector_composes_recorded_metadata() {
        let ((), collected) = with_collector(async {
            assert!(is_active());
            record(
                &CacheableMetadata::new()
                    .with_tags(tags(&["node:5"]))
                    .with_max_age(MaxAge::Seconds(3600)),
            );
            record(
                &CacheableMetadata::new()
                    .with_keys([CacheKeyPart::literal("menu"), CacheKeyPart::context("user.roles")])
                    .with_tags(tags(&["menu:main"]))
                    .with_max_age(MaxAge::Seconds(60)),
            );
            record_tags(&tags(&["node_list", "node:5"]));
        })
        .await;

        assert_eq!(
            collected.cache_tags().to_strings(),
            vec!["menu:main", "node:5", "node_list"]
        );
        assert_eq!(collected.cache_max_age(), MaxAge::Seconds(60));
        assert_eq!(
            collected.cache_keys(),
            &[CacheKeyPart::context("user.roles")]
        );
        assert!(collected.is_cacheable());
    }

    #[tokio::test]
    async fn uncacheable_dependency_taints_the_collection() {
        let (_, collected) = with_collector(async {
            record(&CacheableMetadata::new().with_tags(tags(&["a"])));
            record(&CacheableMetadata::new().uncacheable());
        })
        .await;
        assert!(!collected.should_store());
    }

    #[tokio::test]
    async fn nested_collectors_are_isolated() {
        let (inner, outer) = with_collector(async {
            record_tags(&tags(&["outer"]));
            let ((), inner) = with_collector(async {
                record_tags(&tags(&["inner"]));
            })
            .await;
            inner
        })
        .await;

        assert_eq!(inner.cache_tags().to_strings(), vec!["inner"]);
        assert_eq!(outer.cache_tags().to_strings(), vec!["outer"]);
    }
}
