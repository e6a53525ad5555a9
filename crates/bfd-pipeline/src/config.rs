//! Configuration management
//!
//! Everything is read from environment variables (optionally seeded from a
//! `.env` file). A job family is enabled by setting its anchor variable:
//! `CCW_S3_BUCKET` for the CCW RIF loader, `RDA_API_URL` for the RDA loader.

use anyhow::{anyhow, bail, Result};
use bfd_common::hashing::{IdHasherConfig, DEFAULT_CACHE_SIZE, DEFAULT_HASH_ITERATIONS};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use crate::{rda::ClaimType, storage::config::StorageConfig};

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/bfd";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default scheduler tick.
pub const DEFAULT_PIPELINE_TICK_MILLIS: u64 = 100;

/// Default size of the S3 worker pool.
pub const DEFAULT_CCW_S3_WORKER_THREADS: usize = 4;

/// Default pause between availability checks of an uploading data set.
pub const DEFAULT_CCW_AVAILABILITY_POLL_MILLIS: u64 = 1000;

/// Default limit on waiting for a data set to finish uploading (one hour).
pub const DEFAULT_CCW_AVAILABILITY_TIMEOUT_SECS: u64 = 3600;

/// Free scratch space required before the next data set is prefetched.
pub const DEFAULT_CCW_PREFETCH_MIN_FREE_BYTES: u64 = 50 * 1000 * 1000 * 1000;

/// Default number of claims committed per transaction.
pub const DEFAULT_RDA_BATCH_SIZE: usize = 1000;

/// Default idle time after which a change feed is considered caught up.
pub const DEFAULT_RDA_IDLE_TIMEOUT_SECS: u64 = 60;

/// Default interval between RDA job runs.
pub const DEFAULT_RDA_JOB_INTERVAL_SECS: u64 = 1;

/// What the scheduler does when a job run fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failure halts the whole pipeline.
    #[default]
    StopPipeline,
    /// A failing job is disabled; the others keep running.
    DisableJob,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stop" | "stop_pipeline" | "stop-pipeline" => Ok(FailurePolicy::StopPipeline),
            "disable" | "disable_job" | "disable-job" => Ok(FailurePolicy::DisableJob),
            _ => Err(anyhow!("Invalid failure policy: {}", s)),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub ccw: Option<CcwRifLoadOptions>,
    pub rda: Option<RdaLoadOptions>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_millis: u64,
    pub failure_policy: FailurePolicy,
}

/// Options for the CCW RIF batch loader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcwRifLoadOptions {
    pub s3_bucket: String,
    pub s3_worker_threads: usize,
    pub idempotency_required: bool,
    pub availability_poll_millis: u64,
    /// 0 waits forever
    pub availability_timeout_secs: u64,
    pub prefetch_min_free_bytes: u64,
    pub scratch_dir: PathBuf,
}

/// Options for the RDA streaming loader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdaLoadOptions {
    pub api_url: String,
    pub claim_types: Vec<ClaimType>,
    pub batch_size: usize,
    pub idle_timeout_secs: u64,
    pub job_interval_secs: u64,
    /// Used only when no checkpoint has been stored yet
    pub starting_sequence_number: Option<i64>,
    pub max_batches_per_call: Option<usize>,
    pub hash_iterations: u32,
    pub hash_pepper: String,
    pub mbi_cache_size: usize,
}

impl AppConfig {
    /// Load configuration from `.env` and the environment, then validate it
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = AppConfig {
            database: DatabaseConfig::from_env()?,
            scheduler: SchedulerConfig::from_env()?,
            storage: StorageConfig::from_env()?,
            ccw: CcwRifLoadOptions::from_env()?,
            rda: RdaLoadOptions::from_env()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.scheduler.validate()?;
        self.storage.validate()?;

        if self.ccw.is_none() && self.rda.is_none() {
            bail!("No jobs enabled: set CCW_S3_BUCKET and/or RDA_API_URL");
        }
        if let Some(ccw) = &self.ccw {
            ccw.validate()?;
        }
        if let Some(rda) = &self.rda {
            rda.validate()?;
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: env_var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS)?,
            min_connections: env_parse("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS)?,
            connect_timeout_secs: env_parse(
                "DATABASE_CONNECT_TIMEOUT",
                DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            )?,
            idle_timeout_secs: env_parse("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            bail!("Database URL cannot be empty");
        }

        if self.max_connections == 0 {
            bail!("Database max_connections must be greater than 0");
        }

        if self.min_connections > self.max_connections {
            bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.min_connections,
                self.max_connections
            );
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            tick_millis: env_parse("PIPELINE_TICK_MILLIS", DEFAULT_PIPELINE_TICK_MILLIS)?,
            failure_policy: env_parse("PIPELINE_FAILURE_POLICY", FailurePolicy::default())?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_millis == 0 {
            bail!("PIPELINE_TICK_MILLIS must be greater than 0");
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_millis: DEFAULT_PIPELINE_TICK_MILLIS,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl CcwRifLoadOptions {
    /// Returns `None` when `CCW_S3_BUCKET` is unset
    pub fn from_env() -> Result<Option<Self>> {
        let Some(s3_bucket) = env_var("CCW_S3_BUCKET") else {
            return Ok(None);
        };

        Ok(Some(Self {
            s3_bucket,
            s3_worker_threads: env_parse("CCW_S3_WORKER_THREADS", DEFAULT_CCW_S3_WORKER_THREADS)?,
            idempotency_required: env_parse("CCW_IDEMPOTENCY_REQUIRED", true)?,
            availability_poll_millis: env_parse(
                "CCW_AVAILABILITY_POLL_MILLIS",
                DEFAULT_CCW_AVAILABILITY_POLL_MILLIS,
            )?,
            availability_timeout_secs: env_parse(
                "CCW_AVAILABILITY_TIMEOUT_SECS",
                DEFAULT_CCW_AVAILABILITY_TIMEOUT_SECS,
            )?,
            prefetch_min_free_bytes: env_parse(
                "CCW_PREFETCH_MIN_FREE_BYTES",
                DEFAULT_CCW_PREFETCH_MIN_FREE_BYTES,
            )?,
            scratch_dir: env_var("CCW_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_scratch_dir),
        }))
    }

    /// Options for `bucket` with every other value at its default
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            s3_bucket: bucket.into(),
            s3_worker_threads: DEFAULT_CCW_S3_WORKER_THREADS,
            idempotency_required: true,
            availability_poll_millis: DEFAULT_CCW_AVAILABILITY_POLL_MILLIS,
            availability_timeout_secs: DEFAULT_CCW_AVAILABILITY_TIMEOUT_SECS,
            prefetch_min_free_bytes: DEFAULT_CCW_PREFETCH_MIN_FREE_BYTES,
            scratch_dir: default_scratch_dir(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.s3_bucket.is_empty() {
            bail!("CCW_S3_BUCKET cannot be empty");
        }
        if self.s3_worker_threads == 0 {
            bail!("CCW_S3_WORKER_THREADS must be greater than 0");
        }
        if self.availability_poll_millis == 0 {
            bail!("CCW_AVAILABILITY_POLL_MILLIS must be greater than 0");
        }
        Ok(())
    }

    pub fn availability_poll_interval(&self) -> Duration {
        Duration::from_millis(self.availability_poll_millis)
    }

    pub fn availability_timeout(&self) -> Option<Duration> {
        match self.availability_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl RdaLoadOptions {
    /// Returns `None` when `RDA_API_URL` is unset
    pub fn from_env() -> Result<Option<Self>> {
        let Some(api_url) = env_var("RDA_API_URL") else {
            return Ok(None);
        };

        let claim_types = env_var("RDA_CLAIM_TYPES")
            .unwrap_or_else(|| "fiss,mcs".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ClaimType::from_str)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(Self {
            api_url,
            claim_types,
            batch_size: env_parse("RDA_BATCH_SIZE", DEFAULT_RDA_BATCH_SIZE)?,
            idle_timeout_secs: env_parse("RDA_IDLE_TIMEOUT_SECS", DEFAULT_RDA_IDLE_TIMEOUT_SECS)?,
            job_interval_secs: env_parse("RDA_JOB_INTERVAL_SECS", DEFAULT_RDA_JOB_INTERVAL_SECS)?,
            starting_sequence_number: env_parse_opt("RDA_STARTING_SEQUENCE_NUMBER")?,
            max_batches_per_call: env_parse_opt("RDA_MAX_BATCHES_PER_CALL")?,
            hash_iterations: env_parse("RDA_HASH_ITERATIONS", DEFAULT_HASH_ITERATIONS)?,
            hash_pepper: env_var("RDA_HASH_PEPPER").unwrap_or_default(),
            mbi_cache_size: env_parse("RDA_MBI_CACHE_SIZE", DEFAULT_CACHE_SIZE)?,
        }))
    }

    /// Options for `api_url` with every other value at its default
    pub fn for_api(api_url: impl Into<String>, hash_pepper: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            claim_types: vec![ClaimType::Fiss, ClaimType::Mcs],
            batch_size: DEFAULT_RDA_BATCH_SIZE,
            idle_timeout_secs: DEFAULT_RDA_IDLE_TIMEOUT_SECS,
            job_interval_secs: DEFAULT_RDA_JOB_INTERVAL_SECS,
            starting_sequence_number: None,
            max_batches_per_call: None,
            hash_iterations: DEFAULT_HASH_ITERATIONS,
            hash_pepper: hash_pepper.into(),
            mbi_cache_size: DEFAULT_CACHE_SIZE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_url.is_empty() {
            bail!("RDA_API_URL cannot be empty");
        }
        if self.claim_types.is_empty() {
            bail!("RDA_CLAIM_TYPES must name at least one claim type");
        }
        if self.batch_size == 0 {
            bail!("RDA_BATCH_SIZE must be greater than 0");
        }
        if self.idle_timeout_secs == 0 {
            bail!("RDA_IDLE_TIMEOUT_SECS must be greater than 0");
        }
        if self.max_batches_per_call == Some(0) {
            bail!("RDA_MAX_BATCHES_PER_CALL must be greater than 0 when set");
        }
        if let Some(start) = self.starting_sequence_number {
            if start < 0 {
                bail!("RDA_STARTING_SEQUENCE_NUMBER cannot be negative");
            }
        }
        self.hasher_config()
            .validate()
            .map_err(|e| anyhow!("Invalid RDA hashing settings: {}", e))?;
        Ok(())
    }

    pub fn hasher_config(&self) -> IdHasherConfig {
        IdHasherConfig::new(self.hash_iterations, self.hash_pepper.clone())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn job_interval(&self) -> Duration {
        Duration::from_secs(self.job_interval_secs)
    }
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("bfd-pipeline")
}

/// Non-empty value of an environment variable
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, falling back to `default` when unset.
/// A value that is set but unparseable is an error, never silently defaulted.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(env_parse_opt(name)?.unwrap_or(default))
}

fn env_parse_opt<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    env_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| anyhow!("Invalid value for {}: '{}' ({})", name, raw, e))
        })
        .transpose()
}
