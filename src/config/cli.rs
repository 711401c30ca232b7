use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the tagcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "tagcache",
    version,
    about = "Inspect cache bins and broadcast tag invalidations"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "TAGCACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List configured bins and their backends.
    Bins,
    /// Mark every item carrying any of the tags stale in every bin.
    Invalidate(TagsArgs),
    /// Remove every item carrying any of the tags from every bin.
    Delete(TagsArgs),
    /// Print the cache fingerprint of a query and its parameters.
    Fingerprint(FingerprintArgs),
}

#[derive(Debug, Args, Clone)]
pub struct TagsArgs {
    /// Tags to act on, e.g. `node:5 node_list`.
    #[arg(value_name = "TAG", required = true)]
    pub tags: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct FingerprintArgs {
    /// Query text.
    #[arg(long, value_name = "SQL")]
    pub sql: String,

    /// Positional parameters. Each is parsed as JSON, falling back to a
    /// plain string.
    #[arg(value_name = "PARAM")]
    pub params: Vec<String>,
}

/// Settings that may be overridden from the command line.
#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the per-bin invalidation timeout.
    #[arg(long = "invalidation-timeout-ms", value_name = "MILLIS", global = true)]
    pub invalidation_timeout_ms: Option<u64>,

    /// Override the database connection URL used by postgres bins.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,
}
