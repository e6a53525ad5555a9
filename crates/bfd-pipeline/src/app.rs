//! Process wiring: builds the configured jobs and runs them until a shutdown
//! signal arrives or a job fails.

use anyhow::{anyhow, Context, Result};
use bfd_common::hashing::{IdHashCache, IdHasher, MbiCache};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{future::Future, sync::Arc};
use tracing::info;

use crate::{
    ccw::{prevalidate::PgBeneIdRangeValidator, CcwRifLoadJob, PgStagingRecordSink},
    config::{AppConfig, CcwRifLoadOptions, DatabaseConfig, RdaLoadOptions, SchedulerConfig},
    error::PipelineError,
    pipeline::{smoke_test_failures, JobOutcome, PipelineJob, PipelineManager},
    rda::{
        ClaimSink, ClaimStreamSource, ClaimTransformer, ClaimType, HttpClaimStreamSource,
        PgClaimSink, RdaLoadJob,
    },
    storage::{config::StorageConfig, s3::S3ObjectStore, task_manager::S3TaskManager},
};

/// Exit code for invalid configuration
pub const EXIT_CODE_BAD_CONFIG: u8 = 1;

/// Exit code for a job failure or any other runtime error
pub const EXIT_CODE_JOB_FAILED: u8 = 2;

/// Exit code for a failed startup smoke test
pub const EXIT_CODE_SMOKE_TEST_FAILED: u8 = 3;

/// Exit code the process should end with for `error`
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<PipelineError>() {
        Some(PipelineError::Config(_)) => EXIT_CODE_BAD_CONFIG,
        Some(PipelineError::SmokeTestFailed(_)) => EXIT_CODE_SMOKE_TEST_FAILED,
        _ => EXIT_CODE_JOB_FAILED,
    }
}

/// Load and validate configuration. Every failure is a configuration error.
pub fn load_config() -> Result<AppConfig> {
    AppConfig::from_env().map_err(|e| PipelineError::Config(format!("{:#}", e)).into())
}

pub async fn connect_database(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(config.idle_timeout())
        .connect(&config.url)
        .await
        .context("Failed to connect to database")?;
    info!("Database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Database migrations completed");

    Ok(pool)
}

/// Every job enabled by `config`
pub async fn build_jobs(config: &AppConfig, pool: &PgPool) -> Result<Vec<PipelineJob>> {
    let mut jobs: Vec<PipelineJob> = Vec::new();

    if let Some(ccw) = &config.ccw {
        jobs.push(PipelineJob::from(build_ccw_job(ccw, &config.storage, pool).await?));
    }

    if let Some(rda) = &config.rda {
        let (source, sink, cache) = rda_collaborators(rda, pool).await?;
        jobs.extend(rda_jobs(rda, &rda.claim_types, source, sink, cache));
    }

    info!(
        jobs = ?jobs.iter().map(PipelineJob::job_type).collect::<Vec<_>>(),
        "Jobs configured"
    );
    Ok(jobs)
}

async fn build_ccw_job(
    options: &CcwRifLoadOptions,
    storage: &StorageConfig,
    pool: &PgPool,
) -> Result<CcwRifLoadJob> {
    let store = Arc::new(S3ObjectStore::new(storage, options.s3_bucket.clone()).await?);
    let task_manager = Arc::new(S3TaskManager::new(
        store,
        options.scratch_dir.clone(),
        options.s3_worker_threads,
    )?);

    CcwRifLoadJob::new(
        options.clone(),
        task_manager,
        Arc::new(PgStagingRecordSink::new(pool.clone())),
        Some(Arc::new(PgBeneIdRangeValidator::new(pool.clone()))),
    )
}

async fn rda_collaborators(
    options: &RdaLoadOptions,
    pool: &PgPool,
) -> Result<(Arc<dyn ClaimStreamSource>, Arc<dyn ClaimSink>, Arc<dyn IdHashCache>)> {
    let sink = PgClaimSink::new(pool.clone());

    let cache = MbiCache::computed(IdHasher::new(options.hasher_config()), options.mbi_cache_size);
    let known = sink.load_mbi_hashes(options.mbi_cache_size).await?;
    let seeded = known.len();
    cache.seed(known)?;
    info!(seeded, capacity = options.mbi_cache_size, "MBI hash cache seeded");

    let source = HttpClaimStreamSource::new(options.api_url.clone())?;
    Ok((Arc::new(source), Arc::new(sink), Arc::new(cache)))
}

/// One RDA job per claim type, sharing the feed client, the sink and the MBI
/// hash cache
pub fn rda_jobs(
    options: &RdaLoadOptions,
    claim_types: &[ClaimType],
    source: Arc<dyn ClaimStreamSource>,
    sink: Arc<dyn ClaimSink>,
    cache: Arc<dyn IdHashCache>,
) -> Vec<PipelineJob> {
    let transformer = Arc::new(ClaimTransformer::new(cache));
    claim_types
        .iter()
        .map(|claim_type| {
            PipelineJob::from(RdaLoadJob::new(
                *claim_type,
                options.clone(),
                Arc::clone(&source),
                Arc::clone(&sink),
                Arc::clone(&transformer),
            ))
        })
        .collect()
}

/// Smoke test `jobs`, then schedule them until `shutdown` resolves or the
/// pipeline stops by itself. In-flight runs always finish before this returns.
pub async fn run_jobs<F>(scheduler: SchedulerConfig, jobs: Vec<PipelineJob>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let failed = smoke_test_failures(&jobs).await;
    if !failed.is_empty() {
        return Err(PipelineError::SmokeTestFailed(failed).into());
    }
    info!("All smoke tests passed");

    let manager = PipelineManager::new(scheduler, jobs);
    manager.start().await?;

    tokio::select! {
        _ = shutdown => {
            info!("Shutdown requested; waiting for running jobs to finish");
            manager.stop();
        },
        _ = manager.await_completion() => {},
    }
    manager.await_completion().await;

    match manager.error() {
        Some(error) => Err(anyhow!("Pipeline job failed: {:#}", error)),
        None => Ok(()),
    }
}

/// Run the RDA job for `claim_type` once, outside the scheduler
pub async fn direct_rda_load(
    config: &AppConfig,
    pool: &PgPool,
    claim_type: ClaimType,
) -> Result<JobOutcome> {
    let rda = config
        .rda
        .as_ref()
        .ok_or_else(|| PipelineError::Config("RDA_API_URL must be set for a direct load".to_string()))?;

    let (source, sink, cache) = rda_collaborators(rda, pool).await?;
    let mut jobs = rda_jobs(rda, &[claim_type], source, sink, cache);

    let failed = smoke_test_failures(&jobs).await;
    if !failed.is_empty() {
        return Err(PipelineError::SmokeTestFailed(failed).into());
    }

    let mut outcome = JobOutcome::NothingToDo;
    for job in jobs.iter_mut() {
        outcome = job.call().await?;
        job.shutdown().await;
    }
    Ok(outcome)
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
