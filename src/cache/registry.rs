//! Bin → backend registry.
//!
//! Backends built from configuration are instantiated lazily on first use and
//! then reused for the registry's lifetime. Tests and embedders can register
//! ready-made backends through [`RegistryBuilder`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::backend::CacheBackend;
use super::config::{BackendKind, CacheConfig};
use super::error::CacheError;
use super::store::MemoryBackend;
use crate::infra::db::PostgresBackend;

/// Shared handle to a bin's backend.
pub type BackendHandle = Arc<dyn CacheBackend>;

/// Bin names double as table suffixes, so only `[a-z0-9_]` is accepted.
pub fn is_valid_bin_name(bin: &str) -> bool {
    !bin.is_empty()
        && bin
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

fn check_bin_name(bin: &str) -> Result<(), CacheError> {
    if is_valid_bin_name(bin) {
        Ok(())
    } else {
        Err(CacheError::configuration(
            format!("cache.bins.{bin}"),
            "bin names may only contain lowercase letters, digits and `_`",
        ))
    }
}

/// Postgres connection shared by every `postgres` bin.
struct SharedPool {
    options: PgConnectOptions,
    max_connections: u32,
    pool: OnceCell<PgPool>,
}

impl SharedPool {
    fn pool(&self) -> PgPool {
        self.pool
            .get_or_init(|| {
                PgPoolOptions::new()
                    .max_connections(self.max_connections)
                    .connect_lazy_with(self.options.clone())
            })
            .clone()
    }
}

enum Pending {
    Memory(std::num::NonZeroUsize),
    Postgres(Arc<SharedPool>),
}

enum Slot {
    Ready(BackendHandle),
    Lazy {
        pending: Pending,
        backend: OnceCell<BackendHandle>,
    },
}

/// Maps every configured bin to exactly one backend.
pub struct BackendRegistry {
    bins: BTreeMap<String, Slot>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("bins", &self.bins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    /// Build a registry from configuration. Nothing is connected yet.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let needs_database = config
            .bins
            .values()
            .any(|settings| settings.backend == BackendKind::Postgres);

        let shared = if needs_database {
            let url = config.database.url.as_deref().ok_or_else(|| {
                CacheError::configuration(
                    "cache.database.url",
                    "required when any bin uses the postgres backend",
                )
            })?;
            let options = PgConnectOptions::from_str(url)
                .map_err(|err| CacheError::configuration("cache.database.url", err.to_string()))?;
            Some(Arc::new(SharedPool {
                options,
                max_connections: config.database.max_connections.max(1),
                pool: OnceCell::new(),
            }))
        } else {
            None
        };

        let mut bins = BTreeMap::new();
        for (bin, settings) in &config.bins {
            check_bin_name(bin)?;
            let pending = match (settings.backend, &shared) {
                (BackendKind::Memory, _) => Pending::Memory(settings.capacity_non_zero()),
                (BackendKind::Postgres, Some(shared)) => Pending::Postgres(Arc::clone(shared)),
                (BackendKind::Postgres, None) => {
                    return Err(CacheError::configuration(
                        "cache.database.url",
                        "required when any bin uses the postgres backend",
                    ));
                }
            };
            bins.insert(
                bin.clone(),
                Slot::Lazy {
                    pending,
                    backend: OnceCell::new(),
                },
            );
        }

        Ok(Self { bins })
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Backend for `bin`, instantiating it on first use.
    pub fn get(&self, bin: &str) -> Result<BackendHandle, CacheError> {
        let slot = self
            .bins
            .get(bin)
            .ok_or_else(|| CacheError::unknown_bin(bin))?;
        Ok(Self::resolve(bin, slot))
    }

    /// Every bin with its backend, in bin name order.
    pub fn all_bins(&self) -> BTreeMap<&str, BackendHandle> {
        self.bins
            .iter()
            .map(|(bin, slot)| (bin.as_str(), Self::resolve(bin, slot)))
            .collect()
    }

    pub fn bin_names(&self) -> impl Iterator<Item = &str> {
        self.bins.keys().map(String::as_str)
    }

    pub fn contains(&self, bin: &str) -> bool {
        self.bins.contains_key(bin)
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Fail if any of `required` has no backend, then instantiate every bin.
    pub fn validate<S: AsRef<str>>(&self, required: &[S]) -> Result<(), CacheError> {
        if let Some(missing) = required
            .iter()
            .map(AsRef::as_ref)
            .find(|bin| !self.contains(bin))
        {
            return Err(CacheError::unknown_bin(missing));
        }

        let bins = self.all_bins();
        debug!(bins = bins.len(), "cache bins validated");
        Ok(())
    }

    fn resolve(bin: &str, slot: &Slot) -> BackendHandle {
        match slot {
            Slot::Ready(backend) => Arc::clone(backend),
            Slot::Lazy { pending, backend } => Arc::clone(backend.get_or_init(|| {
                let backend: BackendHandle = match pending {
                    Pending::Memory(capacity) => Arc::new(MemoryBackend::new(bin, *capacity)),
                    Pending::Postgres(shared) => Arc::new(PostgresBackend::new(bin, shared.pool())),
                };
                info!(bin, backend = backend.kind(), "cache bin backend initialized");
                backend
            })),
        }
    }
}

/// Registers pre-built backends, mostly for tests and embedders.
#[derive(Default)]
pub struct RegistryBuilder {
    bins: Vec<(String, BackendHandle)>,
}

impl RegistryBuilder {
    pub fn register(mut self, bin: impl Into<String>, backend: BackendHandle) -> Self {
        self.bins.push((bin.into(), backend));
        self
    }

    pub fn build(self) -> Result<BackendRegistry, CacheError> {
        let mut bins = BTreeMap::new();
        for (bin, backend) in self.bins {
            check_bin_name(&bin)?;
            if bins.contains_key(&bin) {
                return Err(CacheError::configuration(
                    format!("cache.bins.{bin}"),
                    "bin registered more than once",
                ));
            }
            bins.insert(bin, Slot::Ready(backend));
        }
        Ok(BackendRegistry { bins })
    }
}
