//! axum layers for cache annotation and tag-aware page caching.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::annotate::{CacheAnnotation, metadata_from_headers};
use super::backend::{CacheItem, Lookup};
use super::cacheable::{CacheKeyPart, Cacheable, CacheableMetadata};
use super::collector;
use super::config::CacheConfig;
use super::error::CacheError;
use super::registry::{BackendHandle, BackendRegistry};

/// Marks whether a response came from the page cache.
pub const PAGE_CACHE_HEADER: HeaderName = HeaderName::from_static("x-tagcache");

const DEFAULT_BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Run the handler with a metadata collector and stamp what was collected,
/// merged with any cache headers the handler set itself, on the response.
///
/// Responses for which nothing was recorded pass through untouched.
pub async fn cache_annotation_layer(request: Request, next: Next) -> Response {
    let (response, metadata) = collect(next.run(request)).await;
    match metadata {
        Some(metadata) => annotated(response, &metadata),
        None => response,
    }
}

/// Resolves a cache context token, e.g. `user`, against request headers.
pub type RequestContextResolver = Arc<dyn Fn(&HeaderMap, &str) -> Option<String> + Send + Sync>;

/// Shared state for [`page_cache_layer`].
#[derive(Clone)]
pub struct PageCacheState {
    bin: String,
    backend: BackendHandle,
    body_limit: usize,
    contexts: Option<RequestContextResolver>,
}

impl PageCacheState {
    pub fn new(bin: impl Into<String>, backend: BackendHandle) -> Self {
        Self {
            bin: bin.into(),
            backend,
            body_limit: DEFAULT_BODY_LIMIT_BYTES,
            contexts: None,
        }
    }

    pub fn from_config(registry: &BackendRegistry, config: &CacheConfig) -> Result<Self, CacheError> {
        Ok(Self::new(&config.page_bin, registry.get(&config.page_bin)?))
    }

    /// Responses whose body exceeds `bytes` are served but not stored.
    pub fn with_body_limit(mut self, bytes: usize) -> Self {
        self.body_limit = bytes;
        self
    }

    /// Pages that vary by context tokens are only stored when every token
    /// resolves through `resolver`.
    pub fn with_context_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&HeaderMap, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.contexts = Some(Arc::new(resolver));
        self
    }

    /// Key for the variant of `base` selected by `tokens` in this request.
    fn variant_key(&self, base: &str, headers: &HeaderMap, tokens: &[String]) -> Option<String> {
        let resolver = self.contexts.as_deref()?;
        let parts = CacheableMetadata::new()
            .with_keys(tokens.iter().map(|token| CacheKeyPart::context(token.as_str())));
        match parts.storage_key(&|token: &str| resolver(headers, token)) {
            Ok(variant) => Some(format!("{base}#{variant}")),
            Err(err) => {
                debug!(bin = %self.bin, error = %err, "page variant not resolvable");
                None
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredPage {
    /// A complete response.
    Page {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    /// The response varies by these context tokens; look up the variant.
    Vary { contexts: Vec<String> },
}

enum Buffered {
    Complete(Bytes),
    /// Too large or failed mid-stream; carries the body to forward as is.
    Passthrough(Body),
}

/// Serve fresh pages from the page bin and store cacheable 200 GET responses
/// under the tags collected while producing them.
///
/// Stale entries are treated as misses. A page whose metadata carries
/// context tokens is stored per resolved context, behind a vary record at
/// the URL key.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<PageCacheState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let base = page_key(&request);
    let headers = request.headers().clone();
    if let Some(response) = lookup(&cache, &base, &headers).await {
        return response;
    }

    let (response, metadata) = collect(next.run(request)).await;
    let Some(metadata) = metadata else {
        return response;
    };
    let response = annotated(response, &metadata);

    if response.status() != StatusCode::OK || !metadata.should_store() {
        return response;
    }

    let tokens = context_tokens(&metadata);
    let key = if tokens.is_empty() {
        base.clone()
    } else {
        match cache.variant_key(&base, &headers, &tokens) {
            Some(key) => key,
            None => return response,
        }
    };

    let (mut parts, body) = response.into_parts();
    let bytes = match buffer(body, cache.body_limit).await {
        Buffered::Complete(bytes) => bytes,
        Buffered::Passthrough(body) => {
            debug!(bin = %cache.bin, limit = cache.body_limit, "page not buffered for caching");
            return Response::from_parts(parts, body);
        }
    };

    let page = StoredPage::Page {
        status: parts.status.as_u16(),
        headers: parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect(),
        body: BASE64.encode(&bytes),
    };

    if store(&cache, &key, &page, &metadata).await && key != base {
        let vary = StoredPage::Vary { contexts: tokens };
        store(&cache, &base, &vary, &metadata).await;
    }

    parts
        .headers
        .insert(PAGE_CACHE_HEADER, HeaderValue::from_static("MISS"));
    Response::from_parts(parts, Body::from(bytes))
}

/// Fresh cached response for `base`, following a vary record once.
async fn lookup(cache: &PageCacheState, base: &str, headers: &HeaderMap) -> Option<Response> {
    let stored = read(cache, base).await?;
    let stored = match stored {
        StoredPage::Vary { contexts } => {
            let key = cache.variant_key(base, headers, &contexts)?;
            read(cache, &key).await?
        }
        page => page,
    };
    let response = decode_page(stored);
    if response.is_some() {
        debug!(bin = %cache.bin, outcome = "hit", "serving cached page");
    }
    response
}

async fn read(cache: &PageCacheState, key: &str) -> Option<StoredPage> {
    match cache.backend.get(key).await {
        Ok(Lookup::Fresh(item)) => match serde_json::from_slice(&item.data) {
            Ok(stored) => Some(stored),
            Err(err) => {
                warn!(bin = %cache.bin, key, error = %err, "cached page does not decode");
                None
            }
        },
        Ok(Lookup::Stale(_)) => {
            debug!(bin = %cache.bin, key, outcome = "stale", "cached page is stale");
            None
        }
        Ok(Lookup::Absent) => {
            debug!(bin = %cache.bin, key, outcome = "miss", "page not cached");
            None
        }
        Err(err) => {
            warn!(bin = %cache.bin, key, error = %err, "page cache read failed");
            None
        }
    }
}

async fn store(
    cache: &PageCacheState,
    key: &str,
    page: &StoredPage,
    metadata: &CacheableMetadata,
) -> bool {
    let data = match serde_json::to_vec(page) {
        Ok(data) => data,
        Err(err) => {
            warn!(bin = %cache.bin, key, error = %err, "page could not be encoded");
            return false;
        }
    };
    let item = CacheItem::new(data, metadata.cache_tags().clone(), metadata.cache_max_age());
    match cache.backend.set(key, item).await {
        Ok(()) => {
            debug!(bin = %cache.bin, key, tags = %metadata.cache_tags(), "page stored");
            true
        }
        Err(err) => {
            warn!(bin = %cache.bin, key, error = %err, "page cache write failed");
            false
        }
    }
}

/// Read `body` into memory up to `limit` bytes. Past the limit, or on a
/// stream error, the chunks read so far are replayed ahead of the rest.
async fn buffer(body: Body, limit: usize) -> Buffered {
    if body.size_hint().lower() > limit as u64 {
        return Buffered::Passthrough(body);
    }

    let mut data = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;
    while let Some(next) = data.next().await {
        match next {
            Ok(chunk) => {
                total = total.saturating_add(chunk.len());
                chunks.push(chunk);
                if total > limit {
                    let head = stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
                    return Buffered::Passthrough(Body::from_stream(head.chain(data)));
                }
            }
            Err(err) => {
                warn!(error = %err, "page body failed while buffering");
                let head = chunks.into_iter().map(Ok).chain(std::iter::once(Err(err)));
                return Buffered::Passthrough(Body::from_stream(stream::iter(head)));
            }
        }
    }

    let mut bytes = Vec::with_capacity(total);
    for chunk in &chunks {
        bytes.extend_from_slice(chunk);
    }
    Buffered::Complete(Bytes::from(bytes))
}

fn context_tokens(metadata: &CacheableMetadata) -> Vec<String> {
    metadata
        .cache_keys()
        .iter()
        .filter_map(|part| match part {
            CacheKeyPart::Context(token) => Some(token.context.clone()),
            CacheKeyPart::Literal(_) => None,
        })
        .collect()
}

/// Run `fut` under a collector and fold in cache headers already on the
/// response. `None` when neither source had anything.
async fn collect<F>(fut: F) -> (Response, Option<CacheableMetadata>)
where
    F: Future<Output = Response>,
{
    let (response, collected) = collector::with_collector(fut).await;
    let recorded = collected != CacheableMetadata::default();

    let from_headers = match metadata_from_headers(response.headers()) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "ignoring malformed cache headers");
            None
        }
    };

    let metadata = match (recorded, from_headers) {
        (false, None) => None,
        (true, None) => Some(collected),
        (false, Some(headers)) => Some(headers),
        (true, Some(headers)) => {
            let mut merged = collected;
            merged.add_dependency(&headers);
            Some(merged)
        }
    };
    (response, metadata)
}

fn annotated(mut response: Response, metadata: &CacheableMetadata) -> Response {
    match CacheAnnotation::from_cacheable(metadata) {
        Ok(annotation) => annotation.apply(response.headers_mut()),
        Err(err) => warn!(error = %err, "cache metadata not exported"),
    }
    response
}

fn page_key(request: &Request) -> String {
    match request.uri().query() {
        Some(query) => format!("page:{}?{query}", request.uri().path()),
        None => format!("page:{}", request.uri().path()),
    }
}

fn decode_page(stored: StoredPage) -> Option<Response> {
    let StoredPage::Page {
        status,
        headers,
        body,
    } = stored
    else {
        return None;
    };
    let body = BASE64.decode(body.as_bytes()).ok()?;

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), value);
        }
    }
    let mut response = builder.body(Body::from(body)).ok()?;
    response
        .headers_mut()
        .insert(PAGE_CACHE_HEADER, HeaderValue::from_static("HIT"));
    Some(response)
}
