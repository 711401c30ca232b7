//! Cacheability metadata carried by every artifact that participates in caching.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::CacheError;
use super::tags::TagSet;

/// How long an artifact may be cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MaxAge {
    /// Cacheable until explicitly invalidated by tag.
    #[default]
    Permanent,
    /// Cacheable for this many seconds; zero means not cacheable.
    Seconds(u32),
}

impl MaxAge {
    /// Must not be cached at all.
    pub const UNCACHEABLE: Self = Self::Seconds(0);

    pub fn is_zero(self) -> bool {
        self == Self::UNCACHEABLE
    }

    /// Wire encoding: seconds, with `-1` standing for permanent.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Permanent => -1,
            Self::Seconds(seconds) => i64::from(seconds),
        }
    }

    /// Inverse of [`MaxAge::as_i64`]; any negative value means permanent.
    pub fn from_i64(value: i64) -> Self {
        if value < 0 {
            Self::Permanent
        } else {
            Self::Seconds(u32::try_from(value).unwrap_or(u32::MAX))
        }
    }
}

impl Ord for MaxAge {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Permanent, Self::Permanent) => Ordering::Equal,
            (Self::Permanent, Self::Seconds(_)) => Ordering::Greater,
            (Self::Seconds(_), Self::Permanent) => Ordering::Less,
            (Self::Seconds(a), Self::Seconds(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for MaxAge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MaxAge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// One component of an artifact's cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheKeyPart {
    /// Fixed key component, e.g. `node` or `5`.
    Literal(String),
    /// Placeholder resolved against the request context, e.g. `user.roles`.
    Context(ContextToken),
}

/// Named request context a key varies by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextToken {
    pub context: String,
}

impl CacheKeyPart {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn context(token: impl Into<String>) -> Self {
        Self::Context(ContextToken {
            context: token.into(),
        })
    }
}

/// Supplies values for context tokens when building a storage key.
pub trait ContextResolver {
    fn resolve(&self, token: &str) -> Option<String>;
}

impl<F> ContextResolver for F
where
    F: Fn(&str) -> Option<String>,
{
    fn resolve(&self, token: &str) -> Option<String> {
        self(token)
    }
}

/// Capability implemented by every cacheable artifact.
pub trait Cacheable {
    fn cache_keys(&self) -> &[CacheKeyPart];
    fn cache_tags(&self) -> &TagSet;
    fn cache_max_age(&self) -> MaxAge;
    fn is_cacheable(&self) -> bool;
}

/// Owned cache metadata for an artifact under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheableMetadata {
    keys: Vec<CacheKeyPart>,
    tags: TagSet,
    max_age: MaxAge,
    cacheable: bool,
}

impl Default for CacheableMetadata {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            tags: TagSet::empty(),
            max_age: MaxAge::Permanent,
            cacheable: true,
        }
    }
}

impl CacheableMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the metadata of any cacheable artifact.
    pub fn from_cacheable<C: Cacheable + ?Sized>(source: &C) -> Self {
        Self {
            keys: source.cache_keys().to_vec(),
            tags: source.cache_tags().clone(),
            max_age: source.cache_max_age(),
            cacheable: source.is_cacheable(),
        }
    }

    pub fn with_keys(mut self, keys: impl IntoIterator<Item = CacheKeyPart>) -> Self {
        self.keys = keys.into_iter().collect();
        self
    }

    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_max_age(mut self, max_age: MaxAge) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn add_tags(&mut self, tags: &TagSet) {
        self.tags.extend_from(tags);
    }

    /// Fold a constituent's metadata into this (parent) artifact.
    ///
    /// Tags are unioned, max-age takes the minimum, cacheability is the
    /// conjunction, and context tokens bubble up so the parent varies by
    /// everything its children vary by. Literal key parts stay with their
    /// owner.
    pub fn add_dependency<C: Cacheable + ?Sized>(&mut self, dependency: &C) {
        self.tags.extend_from(dependency.cache_tags());
        self.max_age = self.max_age.min(dependency.cache_max_age());
        self.cacheable &= dependency.is_cacheable();

        for part in dependency.cache_keys() {
            if matches!(part, CacheKeyPart::Context(_)) && !self.keys.contains(part) {
                self.keys.push(part.clone());
            }
        }
    }

    /// Metadata of a composite built from `parts`.
    pub fn compose<'a, C>(parts: impl IntoIterator<Item = &'a C>) -> Self
    where
        C: Cacheable + ?Sized + 'a,
    {
        let mut composite = Self::default();
        for part in parts {
            composite.add_dependency(part);
        }
        composite
    }

    /// True when a cache write is allowed at all.
    pub fn should_store(&self) -> bool {
        self.cacheable && !self.max_age.is_zero()
    }

    /// Render the key parts into one storage key, resolving context tokens.
    pub fn storage_key(&self, resolver: &dyn ContextResolver) -> Result<String, CacheError> {
        let mut rendered = Vec::with_capacity(self.keys.len());
        for part in &self.keys {
            match part {
                CacheKeyPart::Literal(value) => rendered.push(value.clone()),
                CacheKeyPart::Context(token) => {
                    let value = resolver.resolve(&token.context).ok_or_else(|| {
                        CacheError::UnresolvedContext {
                            token: token.context.clone(),
                        }
                    })?;
                    rendered.push(format!("[{}]={value}", token.context));
                }
            }
        }
        Ok(rendered.join(":"))
    }
}

impl Cacheable for CacheableMetadata {
    fn cache_keys(&self) -> &[CacheKeyPart] {
        &self.keys
    }

    fn cache_tags(&self) -> &TagSet {
        &self.tags
    }

    fn cache_max_age(&self) -> MaxAge {
        self.max_age
    }

    fn is_cacheable(&self) -> bool {
        self.cacheable
    }
}
