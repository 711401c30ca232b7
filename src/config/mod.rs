//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::str::FromStr;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{BackendKind, CacheConfig, is_valid_bin_name};

mod cli;

pub use cli::{CliArgs, Command, FingerprintArgs, Overrides, TagsArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tagcache";
const ENV_PREFIX: &str = "TAGCACHE";

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.required_bins")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);
    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(timeout) = overrides.invalidation_timeout_ms {
            self.cache.invalidation_timeout_ms = timeout;
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.cache.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(mut cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    if cache.invalidation_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.invalidation_timeout_ms",
            "must be greater than zero",
        ));
    }
    if cache.failure_log_limit == 0 {
        return Err(LoadError::invalid(
            "cache.failure_log_limit",
            "must be greater than zero",
        ));
    }
    if cache.bins.is_empty() {
        return Err(LoadError::invalid("cache.bins", "at least one bin is required"));
    }

    for (bin, settings) in &cache.bins {
        if !is_valid_bin_name(bin) {
            return Err(LoadError::invalid(
                format!("cache.bins.{bin}"),
                "bin names may only contain lowercase letters, digits and `_`",
            ));
        }
        if settings.backend == BackendKind::Memory && settings.capacity == 0 {
            return Err(LoadError::invalid(
                format!("cache.bins.{bin}.capacity"),
                "must be greater than zero",
            ));
        }
    }

    cache.database.url = cache.database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    let needs_database = cache
        .bins
        .values()
        .any(|settings| settings.backend == BackendKind::Postgres);
    if needs_database && cache.database.url.is_none() {
        return Err(LoadError::invalid(
            "cache.database.url",
            "required when any bin uses the postgres backend",
        ));
    }
    if cache.database.max_connections == 0 {
        return Err(LoadError::invalid(
            "cache.database.max_connections",
            "must be greater than zero",
        ));
    }

    if let Some(missing) = cache
        .required_bins
        .iter()
        .find(|bin| !cache.bins.contains_key(bin.as_str()))
    {
        return Err(LoadError::invalid(
            "cache.required_bins",
            format!("bin `{missing}` is not configured"),
        ));
    }
    if !cache.bins.contains_key(&cache.page_bin) {
        return Err(LoadError::invalid(
            "cache.page_bin",
            format!("bin `{}` is not configured", cache.page_bin),
        ));
    }

    Ok(cache)
}
