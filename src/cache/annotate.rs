//! Response cache annotations.
//!
//! Exports finished cache metadata as response headers for reverse proxies:
//!
//! | header          | value                                          |
//! |-----------------|------------------------------------------------|
//! | `x-cache-tags`  | space-separated tags                           |
//! | `cache_max_age` | seconds, `-1` when permanent                   |
//! | `cache_keys`    | JSON array, context parts as `{"context": ..}` |
//!
//! A response that may not be cached carries none of them.

use std::convert::Infallible;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponseParts, ResponseParts};

use super::cacheable::{CacheKeyPart, Cacheable, CacheableMetadata, MaxAge};
use super::error::CacheError;
use super::tags::TagSet;

pub const CACHE_TAGS_HEADER: HeaderName = HeaderName::from_static("x-cache-tags");
pub const CACHE_MAX_AGE_HEADER: HeaderName = HeaderName::from_static("cache_max_age");
pub const CACHE_KEYS_HEADER: HeaderName = HeaderName::from_static("cache_keys");

/// Header values derived from an artifact's cache metadata.
///
/// Tags travel space-separated, so a tag containing whitespace is read back
/// by [`metadata_from_headers`] as several tags. Proxies split the header the
/// same way; build tags without whitespace when they must survive the trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheAnnotation {
    tags: Option<HeaderValue>,
    max_age: Option<HeaderValue>,
    keys: Option<HeaderValue>,
}

impl CacheAnnotation {
    pub fn from_cacheable<C: Cacheable + ?Sized>(artifact: &C) -> Result<Self, CacheError> {
        if !artifact.is_cacheable() {
            return Ok(Self::default());
        }

        let tags = artifact.cache_tags();
        let tags = if tags.is_empty() {
            None
        } else {
            Some(header_value("x-cache-tags", &tags.join(" "))?)
        };

        let max_age = artifact.cache_max_age();
        let max_age = (!max_age.is_zero()).then(|| HeaderValue::from(max_age.as_i64()));

        let keys = artifact.cache_keys();
        let keys = if keys.is_empty() {
            None
        } else {
            let encoded = serde_json::to_string(keys).map_err(|err| CacheError::Header {
                header: "cache_keys",
                reason: err.to_string(),
            })?;
            Some(header_value("cache_keys", &encoded)?)
        };

        Ok(Self {
            tags,
            max_age,
            keys,
        })
    }

    /// True when nothing would be emitted.
    pub fn is_empty(&self) -> bool {
        self.tags.is_none() && self.max_age.is_none() && self.keys.is_none()
    }

    pub fn tags(&self) -> Option<&HeaderValue> {
        self.tags.as_ref()
    }

    pub fn max_age(&self) -> Option<&HeaderValue> {
        self.max_age.as_ref()
    }

    pub fn keys(&self) -> Option<&HeaderValue> {
        self.keys.as_ref()
    }

    /// Replace any cache headers in `headers` with this annotation.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in [
            (CACHE_TAGS_HEADER, &self.tags),
            (CACHE_MAX_AGE_HEADER, &self.max_age),
            (CACHE_KEYS_HEADER, &self.keys),
        ] {
            match value {
                Some(value) => {
                    headers.insert(name, value.clone());
                }
                None => {
                    headers.remove(name);
                }
            }
        }
    }
}

impl IntoResponseParts for CacheAnnotation {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        self.apply(res.headers_mut());
        Ok(res)
    }
}

fn header_value(header: &'static str, value: &str) -> Result<HeaderValue, CacheError> {
    HeaderValue::from_str(value).map_err(|err| CacheError::Header {
        header,
        reason: err.to_string(),
    })
}

/// Read cache metadata back from annotated headers.
///
/// Returns `None` when none of the cache headers is present. Tags without a
/// max-age header mean a zero max-age.
pub fn metadata_from_headers(headers: &HeaderMap) -> Result<Option<CacheableMetadata>, CacheError> {
    let tags = headers.get(CACHE_TAGS_HEADER);
    let max_age = headers.get(CACHE_MAX_AGE_HEADER);
    let keys = headers.get(CACHE_KEYS_HEADER);
    if tags.is_none() && max_age.is_none() && keys.is_none() {
        return Ok(None);
    }

    let mut metadata = CacheableMetadata::new();

    if let Some(value) = tags {
        let raw = header_str("x-cache-tags", value)?;
        let parsed: Vec<&str> = raw.split_whitespace().collect();
        metadata = metadata.with_tags(TagSet::try_from_strs(&parsed)?);
    }

    let max_age = match max_age {
        Some(value) => {
            let raw = header_str("cache_max_age", value)?;
            let seconds = raw.trim().parse::<i64>().map_err(|err| CacheError::Header {
                header: "cache_max_age",
                reason: err.to_string(),
            })?;
            MaxAge::from_i64(seconds)
        }
        None => MaxAge::UNCACHEABLE,
    };
    metadata = metadata.with_max_age(max_age);

    if let Some(value) = keys {
        let raw = header_str("cache_keys", value)?;
        let parts: Vec<CacheKeyPart> =
            serde_json::from_str(raw).map_err(|err| CacheError::Header {
                header: "cache_keys",
                reason: err.to_string(),
            })?;
        metadata = metadata.with_keys(parts);
    }

    Ok(Some(metadata))
}

fn header_str<'a>(header: &'static str, value: &'a HeaderValue) -> Result<&'a str, CacheError> {
    value.to_str().map_err(|err| CacheError::Header {
        header,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use insta::assert_snapshot;

    use super::*;

    fn tags(values: &[&str]) -> TagSet {
        TagSet::try_from_strs(values).expect("valid tags")
    }

    fn render(annotation: &CacheAnnotation) -> String {
        let mut headers = HeaderMap::new();
        annotation.apply(&mut headers);
        let mut lines: Vec<String> = headers
            .iter()
            .map(|(name, value)| format!("{name}: {}", value.to_str().unwrap_or("<binary>")))
            .collect();
        lines.sort();
        lines.join("\n")
    }

    #[test]
    fn full_annotation() {
        let metadata = CacheableMetadata::new()
            .with_keys([
                CacheKeyPart::literal("node"),
                CacheKeyPart::literal("5"),
                CacheKeyPart::context("user.roles"),
            ])
            .with_tags(tags(&["node:5", "node_list", "config:system.site"]))
            .with_max_age(MaxAge::Seconds(3600));

        let annotation = CacheAnnotation::from_cacheable(&metadata).expect("annotation");
        assert_snapshot!(render(&annotation), @r#"
        cache_keys: ["node","5",{"context":"user.roles"}]
        cache_max_age: 3600
        x-cache-tags: config:system.site node:5 node_list
        "#);
    }

    #[test]
    fn permanent_max_age_is_minus_one() {
        let metadata = CacheableMetadata::new().with_tags(tags(&["node:5"]));
        let annotation = CacheAnnotation::from_cacheable(&metadata).expect("annotation");
        assert_snapshot!(render(&annotation), @r"
        cache_max_age: -1
        x-cache-tags: node:5
        ");
    }

    #[test]
    fn zero_max_age_and_empty_parts_are_omitted() {
        let metadata = CacheableMetadata::new()
            .with_tags(tags(&["node:5"]))
            .with_max_age(MaxAge::UNCACHEABLE);
        let annotation = CacheAnnotation::from_cacheable(&metadata).expect("annotation");
        assert!(annotation.max_age().is_none());
        assert!(annotation.keys().is_none());
        assert_eq!(
            annotation.tags().and_then(|v| v.to_str().ok()),
            Some("node:5")
        );
    }

    #[test]
    fn uncacheable_artifacts_emit_nothing() {
        let metadata = CacheableMetadata::new()
            .with_keys([CacheKeyPart::literal("node")])
            .with_tags(tags(&["node:5"]))
            .uncacheable();
        let annotation = CacheAnnotation::from_cacheable(&metadata).expect("annotation");
        assert!(annotation.is_empty());

        let mut headers = HeaderMap::new();
        headers.insert(CACHE_TAGS_HEADER, HeaderValue::from_static("stale:tag"));
        headers.insert(CACHE_MAX_AGE_HEADER, HeaderValue::from_static("60"));
        annotation.apply(&mut headers);
        assert!(headers.is_empty(), "existing affirmative headers are stripped");
    }

    #[test]
    fn tags_that_cannot_be_header_values_are_errors() {
        let metadata = CacheableMetadata::new().with_tags(tags(&["bad\ntag"]));
        let err = CacheAnnotation::from_cacheable(&metadata).expect_err("newline in tag");
        assert!(matches!(err, CacheError::Header { header: "x-cache-tags", .. }));
    }

    #[test]
    fn whitespace_inside_a_tag_splits_on_the_wire() {
        let metadata = CacheableMetadata::new().with_tags(tags(&["node list", "node:5"]));
        let mut headers = HeaderMap::new();
        CacheAnnotation::from_cacheable(&metadata)
            .expect("annotation")
            .apply(&mut headers);
        assert_eq!(headers[CACHE_TAGS_HEADER], "node list node:5");

        let parsed = metadata_from_headers(&headers)
            .expect("parse")
            .expect("cache headers present");
        assert_eq!(
            parsed.cache_tags().to_strings(),
            vec!["list", "node", "node:5"]
        );
    }

    #[test]
    fn works_as_response_parts() {
        let annotation = CacheAnnotation::from_cacheable(
            &CacheableMetadata::new()
                .with_tags(tags(&["node:1"]))
                .with_max_age(MaxAge::Seconds(5)),
        )
        .expect("annotation");
        let response = (StatusCode::OK, annotation, "body").into_response();
        assert_eq!(response.headers()[CACHE_TAGS_HEADER], "node:1");
        assert_eq!(response.headers()[CACHE_MAX_AGE_HEADER], "5");
    }

    #[test]
    fn headers_parse_back_into_metadata() {
        let original = CacheableMetadata::new()
            .with_keys([CacheKeyPart::literal("node"), CacheKeyPart::context("languages")])
            .with_tags(tags(&["node:5", "node_list"]))
            .with_max_age(MaxAge::Seconds(120));
        let mut headers = HeaderMap::new();
        CacheAnnotation::from_cacheable(&original)
            .expect("annotation")
            .apply(&mut headers);

        let parsed = metadata_from_headers(&headers)
            .expect("parse")
            .expect("cache headers present");
        assert_eq!(parsed, original);

        assert_eq!(metadata_from_headers(&HeaderMap::new()).expect("parse"), None);
    }

    #[test]
    fn tags_without_max_age_parse_as_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_TAGS_HEADER, HeaderValue::from_static("node:1"));
        let parsed = metadata_from_headers(&headers)
            .expect("parse")
            .expect("cache headers present");
        assert_eq!(parsed.cache_max_age(), MaxAge::UNCACHEABLE);
        assert!(!parsed.should_store());
    }
}
