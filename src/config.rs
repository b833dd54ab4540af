use crate::services::{
    admission::DEFAULT_SWEEP_INTERVAL, metadata::DEFAULT_METADATA_TIMEOUT,
    object_store::DEFAULT_MAX_ALLOCATION_ATTEMPTS,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    /// No database means the service runs without metadata.
    pub database_url: Option<String>,
    /// Requests per second per client and operation, 0 = unlimited.
    pub rps_limit: u64,
    /// Bytes per second per client and operation, 0 = unlimited.
    pub bps_limit: u64,
    pub pre_stages: Vec<String>,
    pub post_stages: Vec<String>,
    pub max_allocation_attempts: usize,
    pub sweep_interval: Duration,
    pub metadata_timeout: Duration,
    pub max_upload_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Blob store with per-client rate limiting")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides OBJECT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// SQLite URL for metadata (overrides OBJECT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Requests per second limit, 0 disables (overrides OBJECT_STORE_RPS)
    #[arg(long = "rps")]
    pub rps_limit: Option<u64>,

    /// Bytes per second limit, 0 disables (overrides OBJECT_STORE_BPS)
    #[arg(long = "bps")]
    pub bps_limit: Option<u64>,

    /// Pre-stage to run before storing, repeatable (overrides OBJECT_STORE_PRE_STAGES)
    #[arg(long = "pre-stage")]
    pub pre_stages: Vec<String>,

    /// Post-stage to run after storing, repeatable (overrides OBJECT_STORE_POST_STAGES)
    #[arg(long = "post-stage")]
    pub post_stages: Vec<String>,

    /// Id candidates tried per upload (overrides OBJECT_STORE_MAX_ALLOCATION_ATTEMPTS)
    #[arg(long)]
    pub max_allocation_attempts: Option<usize>,

    /// Seconds between admission window sweeps (overrides OBJECT_STORE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Timeout for metadata calls (overrides OBJECT_STORE_METADATA_TIMEOUT_SECS)
    #[arg(long)]
    pub metadata_timeout_secs: Option<u64>,

    /// Largest accepted upload body (overrides OBJECT_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Apply the metadata schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI arguments over environment values over defaults.
    pub fn from_sources(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env("OBJECT_STORE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port: u16 = parse_var(&env, "OBJECT_STORE_PORT", 8080)?;
        let env_storage =
            env("OBJECT_STORE_STORAGE_DIR").unwrap_or_else(|| "./data/objects".into());
        let env_db = env("OBJECT_STORE_DATABASE_URL").filter(|url| !url.trim().is_empty());
        let env_rps: u64 = parse_var(&env, "OBJECT_STORE_RPS", 2)?;
        let env_bps: u64 = parse_var(&env, "OBJECT_STORE_BPS", 1_000_000)?;
        let env_attempts: usize = parse_var(
            &env,
            "OBJECT_STORE_MAX_ALLOCATION_ATTEMPTS",
            DEFAULT_MAX_ALLOCATION_ATTEMPTS,
        )?;
        let env_sweep: u64 = parse_var(
            &env,
            "OBJECT_STORE_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL.as_secs(),
        )?;
        let env_timeout: u64 = parse_var(
            &env,
            "OBJECT_STORE_METADATA_TIMEOUT_SECS",
            DEFAULT_METADATA_TIMEOUT.as_secs(),
        )?;
        let env_upload: usize =
            parse_var(&env, "OBJECT_STORE_MAX_UPLOAD_BYTES", 64 * 1024 * 1024)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.or(env_db),
            rps_limit: args.rps_limit.unwrap_or(env_rps),
            bps_limit: args.bps_limit.unwrap_or(env_bps),
            pre_stages: or_env_list(args.pre_stages, env("OBJECT_STORE_PRE_STAGES")),
            post_stages: or_env_list(args.post_stages, env("OBJECT_STORE_POST_STAGES")),
            max_allocation_attempts: args
                .max_allocation_attempts
                .unwrap_or(env_attempts),
            sweep_interval: nonzero_secs(
                "sweep interval",
                args.sweep_interval_secs.unwrap_or(env_sweep),
            )?,
            metadata_timeout: nonzero_secs(
                "metadata timeout",
                args.metadata_timeout_secs.unwrap_or(env_timeout),
            )?,
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_upload),
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(env: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}

fn nonzero_secs(what: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        anyhow::bail!("{} must be at least one second", what);
    }
    Ok(Duration::from_secs(secs))
}

fn or_env_list(cli: Vec<String>, env_value: Option<String>) -> Vec<String> {
    if !cli.is_empty() {
        return cli;
    }
    env_value
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
