//! Cache tags and canonical tag sets.
//!
//! A [`TagSet`] is always sorted ascending and free of duplicates, so two
//! artifacts that depend on the same data serialize to byte-identical tag
//! lists regardless of the order their constituents were composed in.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::error::CacheError;

/// A single non-empty cache tag, e.g. `node:5` or `config:system.site`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(String);

impl Tag {
    pub fn new(value: impl Into<String>) -> Result<Self, CacheError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CacheError::invalid_tag(0, "tag must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Suffix value accepted by [`TagSet::build_from_prefix`].
///
/// Stringification follows the loose convention cache tags have always been
/// built with: `Null` and `Bool(false)` become the empty string and
/// `Bool(true)` becomes `"1"`.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null | Self::Bool(false) => Ok(()),
            Self::Bool(true) => f.write_str("1"),
            Self::Int(value) => write!(f, "{value}"),
            Self::UInt(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<u32> for TagValue {
    fn from(value: u32) -> Self {
        Self::UInt(value.into())
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<TagValue>> From<Option<T>> for TagValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Deduplicated, lexicographically sorted collection of tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagSet(Vec<Tag>);

impl TagSet {
    /// The empty tag set.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Canonicalize already-validated tags.
    pub fn new(tags: impl IntoIterator<Item = Tag>) -> Self {
        let mut tags: Vec<Tag> = tags.into_iter().collect();
        canonicalize(&mut tags);
        Self(tags)
    }

    /// Build a set from strings, failing on the first empty one.
    pub fn try_from_strs<S: AsRef<str>>(values: &[S]) -> Result<Self, CacheError> {
        let mut tags = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            let value = value.as_ref();
            if value.is_empty() {
                return Err(CacheError::invalid_tag(index, "tag must not be empty"));
            }
            tags.push(Tag(value.to_string()));
        }
        canonicalize(&mut tags);
        Ok(Self(tags))
    }

    /// Build a set from loosely-typed input (request payloads, config, CLI).
    pub fn from_values(values: &[Value]) -> Result<Self, CacheError> {
        validate_tags(values)?;
        let tags = values
            .iter()
            .filter_map(Value::as_str)
            .map(|value| Tag(value.to_string()))
            .collect();
        Ok(Self::new_unchecked(tags))
    }

    /// Canonical set of [`build_tags`] output.
    pub fn build_from_prefix<V>(prefix: &str, suffixes: impl IntoIterator<Item = V>) -> Self
    where
        V: Into<TagValue>,
    {
        Self::new_unchecked(build_tags(prefix, suffixes))
    }

    /// Union of any number of sets. Merging zero sets yields the empty set.
    pub fn merge<'a>(sets: impl IntoIterator<Item = &'a TagSet>) -> Self {
        let mut tags = Vec::new();
        for set in sets {
            tags.extend_from_slice(&set.0);
        }
        Self::new_unchecked(tags)
    }

    /// Union of two sets, walking both sorted vectors once.
    pub fn union(&self, other: &TagSet) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }

        let (left, right) = (&self.0, &other.0);
        let mut merged = Vec::with_capacity(left.len() + right.len());
        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            match left[i].cmp(&right[j]) {
                Ordering::Less => {
                    merged.push(left[i].clone());
                    i += 1;
                }
                Ordering::Greater => {
                    merged.push(right[j].clone());
                    j += 1;
                }
                Ordering::Equal => {
                    merged.push(left[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&left[i..]);
        merged.extend_from_slice(&right[j..]);
        Self(merged)
    }

    /// Add every tag of `other` to this set in place.
    pub fn extend_from(&mut self, other: &TagSet) {
        if !other.is_empty() {
            *self = self.union(other);
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0
            .binary_search_by(|candidate| candidate.as_str().cmp(tag))
            .is_ok()
    }

    pub fn intersects(&self, other: &TagSet) -> bool {
        other.iter().any(|tag| self.contains(tag.as_str()))
    }

    pub fn as_slice(&self) -> &[Tag] {
        &self.0
    }

    /// Tags as plain strings, in canonical order.
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|tag| tag.0.clone()).collect()
    }

    /// Space-joined representation used on the wire.
    pub fn join(&self, separator: &str) -> String {
        self.0
            .iter()
            .map(Tag::as_str)
            .collect::<Vec<_>>()
            .join(separator)
    }

    fn new_unchecked(mut tags: Vec<Tag>) -> Self {
        canonicalize(&mut tags);
        Self(tags)
    }
}

/// One tag per suffix, formatted as `{prefix}:{suffix}`, in suffix order.
pub fn build_tags<V>(prefix: &str, suffixes: impl IntoIterator<Item = V>) -> Vec<Tag>
where
    V: Into<TagValue>,
{
    suffixes
        .into_iter()
        .map(|suffix| Tag(format!("{prefix}:{}", suffix.into())))
        .collect()
}

fn canonicalize(tags: &mut Vec<Tag>) {
    tags.sort_unstable();
    tags.dedup();
}

impl Deref for TagSet {
    type Target = [Tag];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.join(" "))
    }
}

impl Serialize for TagSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(Tag::as_str))
    }
}

impl<'de> Deserialize<'de> for TagSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        Self::try_from_strs(&raw).map_err(serde::de::Error::custom)
    }
}

/// Reject any value that is not a non-empty string.
///
/// An empty slice is valid. The first offending element aborts validation so
/// nothing downstream ever sees a partially-valid tag list.
pub fn validate_tags(values: &[Value]) -> Result<(), CacheError> {
    for (index, value) in values.iter().enumerate() {
        match value {
            Value::String(tag) if tag.is_empty() => {
                return Err(CacheError::invalid_tag(index, "tag must not be empty"));
            }
            Value::String(_) => {}
            other => {
                return Err(CacheError::invalid_tag(
                    index,
                    format!("expected a string, found {}", json_kind(other)),
                ));
            }
        }
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
