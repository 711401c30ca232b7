//! Tag-based cache invalidation core.
//!
//! - **Tags** name the data an artifact depends on; [`TagSet`] keeps them
//!   sorted and deduplicated so composition is order-independent.
//! - **Cacheable metadata** ([`Cacheable`], [`CacheableMetadata`]) travels with
//!   every artifact and composes upward: tags union, max-age takes the minimum,
//!   cacheability is the conjunction.
//! - **Bins** are named cache namespaces, each backed by one
//!   [`CacheBackend`] held in the [`BackendRegistry`].
//! - **Invalidation** ([`TagInvalidator`], [`CacheTrigger`]) fans out to every
//!   bin and aggregates per-bin failures.
//!
//! ## Configuration
//!
//! Bins are configured in `tagcache.toml`:
//!
//! ```toml
//! [cache]
//! invalidation_timeout_ms = 5000
//!
//! [cache.bins.page]
//! backend = "memory"
//! capacity = 2000
//! # ... see config.rs for all options
//! ```

mod annotate;
mod backend;
mod cacheable;
pub mod collector;
mod config;
mod error;
mod fingerprint;
mod index;
mod invalidator;
mod lock;
mod middleware;
mod registry;
mod store;
mod tags;
mod trigger;

pub use annotate::{
    CACHE_KEYS_HEADER, CACHE_MAX_AGE_HEADER, CACHE_TAGS_HEADER, CacheAnnotation,
    metadata_from_headers,
};
pub use backend::{CacheBackend, CacheItem, Lookup};
pub(crate) use backend::unix_now;
pub use cacheable::{
    CacheKeyPart, Cacheable, CacheableMetadata, ContextResolver, ContextToken, MaxAge,
};
pub use config::{BackendKind, BinSettings, CacheConfig, DatabaseConfig};
pub use error::{BackendError, BinFailure, CacheError, InvalidationError, Operation};
pub use fingerprint::{FINGERPRINT_SCHEME, QueryCache, fingerprint};
pub use index::TagIndex;
pub use invalidator::{InvalidationReport, TagInvalidator};
pub use middleware::{
    PAGE_CACHE_HEADER, PageCacheState, RequestContextResolver, cache_annotation_layer,
    page_cache_layer,
};
pub use registry::{BackendHandle, BackendRegistry, RegistryBuilder, is_valid_bin_name};
pub use store::MemoryBackend;
pub use tags::{Tag, TagSet, TagValue, build_tags, validate_tags};
pub use trigger::{
    CacheTrigger, Epoch, FailedInvalidation, FailureLog, RetrySummary, TriggerOutcome,
};
