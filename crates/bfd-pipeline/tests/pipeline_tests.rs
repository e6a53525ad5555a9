//! End-to-end scheduler tests
//!
//! Runs real CCW and RDA jobs through `app::run_jobs` with in-memory
//! collaborators and checks smoke testing, failure handling and shutdown.

mod common;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bfd_pipeline::{
    app::{self, exit_code_for, EXIT_CODE_JOB_FAILED, EXIT_CODE_SMOKE_TEST_FAILED},
    ccw::{
        manifest::{DataSetManifestEntry, RifFileType},
        RecordSink,
    },
    config::{FailurePolicy, SchedulerConfig},
    error::PipelineError,
    pipeline::{CustomJob, JobOutcome, JobSchedule, PipelineJob},
    rda::{ClaimSink, ClaimType, InMemoryClaimSink, InProcessClaimSource},
    storage::InMemoryObjectStore,
};
use common::*;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::time::sleep;

fn scheduler(failure_policy: FailurePolicy) -> SchedulerConfig {
    SchedulerConfig {
        tick_millis: 50,
        failure_policy,
    }
}

/// Job that only counts its runs
struct CountingJob {
    smoke_ok: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CustomJob for CountingJob {
    fn job_type(&self) -> String {
        "CountingJob".to_string()
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(Duration::from_secs(1))
    }

    async fn is_smoke_test_successful(&self) -> Result<bool> {
        if self.smoke_ok {
            Ok(true)
        } else {
            Err(anyhow!("dependency unreachable"))
        }
    }

    async fn call(&mut self) -> Result<JobOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(JobOutcome::NothingToDo)
    }
}

fn counting_job(smoke_ok: bool) -> (PipelineJob, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let job = PipelineJob::Custom(Box::new(CountingJob {
        smoke_ok,
        calls: calls.clone(),
    }));
    (job, calls)
}

#[tokio::test(start_paused = true)]
async fn test_smoke_test_failure_runs_nothing() -> Result<()> {
    init_tracing();
    let (broken, broken_calls) = counting_job(false);
    let (healthy, healthy_calls) = counting_job(true);

    let err = app::run_jobs(
        scheduler(FailurePolicy::StopPipeline),
        vec![healthy, broken],
        std::future::pending(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::SmokeTestFailed(jobs)) if jobs == &vec!["CountingJob".to_string()]
    ));
    assert_eq!(exit_code_for(&err), EXIT_CODE_SMOKE_TEST_FAILED);
    assert_eq!(broken_calls.load(Ordering::SeqCst), 0);
    assert_eq!(healthy_calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stream_failure_stops_pipeline() -> Result<()> {
    init_tracing();
    let source = InProcessClaimSource::new(claim_changes(1..=50, ClaimType::Fiss)).with_failure_after(10);
    let sink = Arc::new(InMemoryClaimSink::new());
    let (other, other_calls) = counting_job(true);
    let jobs = vec![
        PipelineJob::from(rda_job(ClaimType::Fiss, rda_options(20, 5), Arc::new(source), sink.clone())),
        other,
    ];

    // Never asked to shut down; the failure alone ends the run.
    let err = app::run_jobs(scheduler(FailurePolicy::StopPipeline), jobs, std::future::pending())
        .await
        .unwrap_err();

    assert_eq!(exit_code_for(&err), EXIT_CODE_JOB_FAILED);
    assert!(format!("{:#}", err).contains("Stream for FISS failed after 10 message(s)"));
    assert_eq!(sink.checkpoint(ClaimType::Fiss), None);
    assert!(other_calls.load(Ordering::SeqCst) >= 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_disabled_job_leaves_others_running() -> Result<()> {
    init_tracing();
    let failing = InProcessClaimSource::new(claim_changes(1..=50, ClaimType::Fiss)).with_failure_after(3);
    let sink = Arc::new(InMemoryClaimSink::new());
    let jobs = vec![
        PipelineJob::from(rda_job(ClaimType::Fiss, rda_options(20, 5), Arc::new(failing), sink.clone())),
        PipelineJob::from(rda_job(
            ClaimType::Mcs,
            rda_options(5, 5),
            Arc::new(InProcessClaimSource::new(claim_changes(1..=8, ClaimType::Mcs))),
            sink.clone(),
        )),
    ];

    let err = app::run_jobs(scheduler(FailurePolicy::DisableJob), jobs, sleep(Duration::from_secs(30)))
        .await
        .unwrap_err();

    // The failure is still reported once the pipeline has been shut down.
    assert_eq!(exit_code_for(&err), EXIT_CODE_JOB_FAILED);
    assert_eq!(sink.checkpoint(ClaimType::Fiss), None);
    assert_eq!(sink.checkpoint(ClaimType::Mcs), Some(8));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_ccw_and_rda_jobs_run_until_shutdown() -> Result<()> {
    init_tracing();
    let scratch = TempDir::new()?;
    let store = Arc::new(InMemoryObjectStore::new(TEST_BUCKET));
    let manifest = manifest(
        "Incoming",
        "2024-06-01T00:00:00Z",
        0,
        vec![DataSetManifestEntry::new("beneficiaries.rif", RifFileType::Beneficiary)],
    );
    upload_data_set(&store, &manifest, &[("beneficiaries.rif", "DML_IND|BENE_ID\nINSERT|-1\n")]).await;

    let record_sink = RecordingSink::new();
    let ccw = ccw_job(
        store.clone(),
        ccw_options(scratch.path()),
        record_sink.clone() as Arc<dyn RecordSink>,
        None,
    );

    let mut changes = claim_changes(1..=25, ClaimType::Fiss);
    changes.extend(claim_changes(1..=7, ClaimType::Mcs));
    let claim_sink = Arc::new(InMemoryClaimSink::new());
    let mut jobs = vec![PipelineJob::from(ccw)];
    jobs.extend(app::rda_jobs(
        &rda_options(10, 5),
        &[ClaimType::Fiss, ClaimType::Mcs],
        Arc::new(InProcessClaimSource::new(changes)),
        claim_sink.clone() as Arc<dyn ClaimSink>,
        Arc::new(bfd_common::hashing::MbiCache::computed(
            bfd_common::hashing::IdHasher::new(bfd_common::hashing::IdHasherConfig::new(1, "test-pepper")),
            64,
        )),
    ));

    app::run_jobs(
        scheduler(FailurePolicy::StopPipeline),
        jobs,
        sleep(Duration::from_secs(20)),
    )
    .await?;

    let loaded = record_sink.loaded();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].manifest_id, manifest.id);
    assert!(store.contains("Done/2024-06-01T00:00:00Z/0_manifest.xml"));

    assert_eq!(claim_sink.checkpoint(ClaimType::Fiss), Some(25));
    assert_eq!(claim_sink.checkpoint(ClaimType::Mcs), Some(7));
    // Later runs found nothing new, so nothing was stored twice.
    assert_eq!(claim_sink.claim_count(), 32);
    assert_eq!(claim_sink.commit_count(), 4);
    Ok(())
}
