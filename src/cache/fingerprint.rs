//! Query fingerprints and a read-through query cache.

use std::fmt;
use std::future::Future;

use serde::Serialize;
use serde::ser;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::backend::{CacheItem, Lookup};
use super::cacheable::{CacheableMetadata, MaxAge};
use super::collector;
use super::error::CacheError;
use super::registry::{BackendHandle, BackendRegistry};
use super::tags::TagSet;

/// Leading element of every canonical encoding. Changing it changes every
/// fingerprint, so it is versioned.
pub const FINGERPRINT_SCHEME: &str = "tagcache.query.v1";

/// Stable hex-encoded SHA-256 over `sql` and its positional parameters.
///
/// Parameter order is significant. A parameter that cannot be serialized
/// fails with [`CacheError::UnfingerprintableQuery`]; callers must then run
/// the query uncached. Non-finite floats are rejected as well: JSON has no
/// encoding for them and would collapse NaN, both infinities and NULL into
/// the same key.
pub fn fingerprint<P: Serialize>(sql: &str, params: &[P]) -> Result<String, CacheError> {
    params
        .serialize(FiniteFloats)
        .map_err(|err| CacheError::unfingerprintable(err.to_string()))?;

    let canonical = serde_json::to_vec(&(FINGERPRINT_SCHEME, sql, params))
        .map_err(|err| CacheError::unfingerprintable(err.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

/// Serializer that produces nothing and fails on the first NaN or infinity.
struct FiniteFloats;

#[derive(Debug)]
struct NonFinite(String);

impl fmt::Display for NonFinite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for NonFinite {}

impl ser::Error for NonFinite {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

impl FiniteFloats {
    fn check(value: f64) -> Result<(), NonFinite> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(NonFinite(format!("non-finite float parameter {value}")))
        }
    }
}

impl ser::Serializer for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_i128(self, _: i128) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_u128(self, _: u128) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_f32(self, value: f32) -> Result<(), NonFinite> {
        Self::check(f64::from(value))
    }
    fn serialize_f64(self, value: f64) -> Result<(), NonFinite> {
        Self::check(value)
    }
    fn serialize_char(self, _: char) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_none(self) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), NonFinite> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<(), NonFinite> {
        Ok(())
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(self)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, NonFinite> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), NonFinite> {
        key.serialize(FiniteFloats)
    }
    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(FiniteFloats)
    }
    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

/// Read-through cache for query results stored in one bin.
///
/// Every cache-side problem (unfingerprintable query, backend error, payload
/// that no longer decodes) degrades to running the query uncached.
#[derive(Clone)]
pub struct QueryCache {
    bin: String,
    backend: BackendHandle,
}

impl QueryCache {
    pub fn new(registry: &BackendRegistry, bin: &str) -> Result<Self, CacheError> {
        Ok(Self::with_backend(bin, registry.get(bin)?))
    }

    pub fn with_backend(bin: impl Into<String>, backend: BackendHandle) -> Self {
        Self {
            bin: bin.into(),
            backend,
        }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Storage key for a query, if it can be fingerprinted.
    pub fn key_for<P: Serialize>(sql: &str, params: &[P]) -> Result<String, CacheError> {
        fingerprint(sql, params).map(|digest| format!("query:{digest}"))
    }

    /// Return the cached result of `sql` with `params`, or run `execute` and
    /// store its result under `tags` for `max_age`.
    ///
    /// The tags and max-age are also recorded in the active metadata
    /// collector, so responses built from the result inherit them.
    pub async fn get_or_execute<T, P, F, Fut, E>(
        &self,
        sql: &str,
        params: &[P],
        tags: &TagSet,
        max_age: MaxAge,
        execute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        P: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        collector::record(
            &CacheableMetadata::new()
                .with_tags(tags.clone())
                .with_max_age(max_age),
        );

        let key = match Self::key_for(sql, params) {
            Ok(key) => key,
            Err(err) => {
                warn!(bin = %self.bin, error = %err, "query not cacheable, executing uncached");
                return execute().await;
            }
        };

        if let Some(cached) = self.read(&key).await {
            return Ok(cached);
        }

        let value = execute().await?;
        self.write(&key, &value, tags, max_age).await;
        Ok(value)
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Lookup::Fresh(item)) => match serde_json::from_slice(&item.data) {
                Ok(value) => {
                    debug!(bin = %self.bin, key, "query cache hit");
                    Some(value)
                }
                Err(err) => {
                    warn!(bin = %self.bin, key, error = %err, "cached query result does not decode");
                    None
                }
            },
            Ok(Lookup::Stale(_) | Lookup::Absent) => None,
            Err(err) => {
                warn!(bin = %self.bin, key, error = %err, "query cache read failed");
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T, tags: &TagSet, max_age: MaxAge) {
        if max_age.is_zero() {
            return;
        }
        let data = match serde_json::to_vec(value) {
            Ok(data) => data,
            Err(err) => {
                warn!(bin = %self.bin, key, error = %err, "query result does not serialize");
                return;
            }
        };
        let item = CacheItem::new(data, tags.clone(), max_age);
        if let Err(err) = self.backend.set(key, item).await {
            warn!(bin = %self.bin, key, error = %err, "query cache write failed");
        }
    }
}
