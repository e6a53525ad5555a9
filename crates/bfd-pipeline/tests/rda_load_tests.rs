//! RDA load job tests
//!
//! Runs the job against an in-process change feed and the in-memory claim
//! sink, covering checkpoint resumption, idle termination, and transport
//! failures that must not commit a partial batch.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use bfd_pipeline::{
    app::{exit_code_for, EXIT_CODE_JOB_FAILED},
    error::PipelineError,
    pipeline::JobOutcome,
    rda::{
        source::ClaimStream, ClaimSink, ClaimStreamSource, ClaimType, InMemoryClaimSink,
        InProcessClaimSource,
    },
};
use common::*;
use futures::StreamExt;
use std::sync::{Arc, Mutex};

/// Feed that records every starting sequence number requested and every
/// sequence number it delivered
struct RecordingSource {
    inner: InProcessClaimSource,
    starts: Mutex<Vec<i64>>,
    delivered: Arc<Mutex<Vec<i64>>>,
}

impl RecordingSource {
    fn new(inner: InProcessClaimSource) -> Arc<Self> {
        Arc::new(Self {
            inner,
            starts: Mutex::new(Vec::new()),
            delivered: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn starts(&self) -> Vec<i64> {
        self.starts.lock().unwrap().clone()
    }

    fn delivered(&self) -> Vec<i64> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClaimStreamSource for RecordingSource {
    async fn call_version_service(&self) -> Result<String> {
        self.inner.call_version_service().await
    }

    async fn call_service(&self, claim_type: ClaimType, start: i64) -> Result<ClaimStream> {
        self.starts.lock().unwrap().push(start);
        let delivered = Arc::clone(&self.delivered);
        let stream = self.inner.call_service(claim_type, start).await?;
        Ok(stream
            .inspect(move |change| {
                if let Ok(change) = change {
                    delivered.lock().unwrap().push(change.sequence_number);
                }
            })
            .boxed())
    }
}

#[tokio::test]
async fn test_resumes_from_checkpoint() -> Result<()> {
    init_tracing();
    let source = RecordingSource::new(InProcessClaimSource::new(claim_changes(1..=60, ClaimType::Fiss)));
    let sink = Arc::new(InMemoryClaimSink::new().with_checkpoint(ClaimType::Fiss, 40));
    let mut job = rda_job(ClaimType::Fiss, rda_options(10, 5), source.clone(), sink.clone());

    assert_eq!(job.call().await?, JobOutcome::WorkDone);

    assert_eq!(source.starts(), vec![40]);
    let delivered = source.delivered();
    assert!(delivered.iter().all(|seq| *seq >= 40));
    assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));

    assert_eq!(sink.checkpoint(ClaimType::Fiss), Some(60));
    assert_eq!(sink.claim_count(), 20);
    assert!(sink.claim(ClaimType::Fiss, "fiss-40").is_none());
    assert!(sink.claim(ClaimType::Fiss, "fiss-41").is_some());
    assert_eq!(job.last_progress().processed, 20);
    Ok(())
}

#[tokio::test]
async fn test_configured_start_used_without_checkpoint() -> Result<()> {
    init_tracing();
    let source = RecordingSource::new(InProcessClaimSource::new(claim_changes(1..=20, ClaimType::Mcs)));
    let sink = Arc::new(InMemoryClaimSink::new());
    let mut options = rda_options(100, 5);
    options.starting_sequence_number = Some(15);
    let mut job = rda_job(ClaimType::Mcs, options, source.clone(), sink.clone());

    job.call().await?;

    assert_eq!(source.starts(), vec![15]);
    assert_eq!(sink.claim_count(), 6);
    assert_eq!(sink.checkpoint(ClaimType::Mcs), Some(20));

    // The next run resumes from the checkpoint, not the configured start.
    assert_eq!(job.call().await?, JobOutcome::NothingToDo);
    assert_eq!(source.starts(), vec![15, 20]);
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_equals_last_committed_batch() -> Result<()> {
    init_tracing();
    let source = InProcessClaimSource::new(claim_changes(1..=60, ClaimType::Fiss)).with_failure_after(45);
    let sink = Arc::new(InMemoryClaimSink::new());
    let mut job = rda_job(ClaimType::Fiss, rda_options(30, 5), Arc::new(source), sink.clone());

    let err = job.call().await.unwrap_err();

    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::StreamTransport {
            processed,
            committed,
            ..
        }) => {
            assert_eq!(*processed, 45);
            assert_eq!(*committed, 30);
        },
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(sink.checkpoint(ClaimType::Fiss), Some(30));
    assert_eq!(sink.commit_count(), 1);
    assert!(sink.claim(ClaimType::Fiss, "fiss-31").is_none());
    Ok(())
}

#[tokio::test]
async fn test_transport_error_mid_batch_commits_nothing() -> Result<()> {
    init_tracing();
    let changes = claim_changes(1..=100, ClaimType::Fiss);
    let failing = InProcessClaimSource::new(changes.clone()).with_failure_after(25);
    let sink = Arc::new(InMemoryClaimSink::new());
    let mut job = rda_job(ClaimType::Fiss, rda_options(30, 5), Arc::new(failing), sink.clone());

    let err = job.call().await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::StreamTransport { processed: 25, committed: 0, .. })
    ));
    assert_eq!(exit_code_for(&err), EXIT_CODE_JOB_FAILED);
    assert_eq!(sink.checkpoint(ClaimType::Fiss), None);
    assert_eq!(sink.claim_count(), 0);

    // A restarted job replays from the beginning and loses nothing.
    let mut restarted = rda_job(
        ClaimType::Fiss,
        rda_options(30, 5),
        Arc::new(InProcessClaimSource::new(changes)),
        sink.clone(),
    );
    assert_eq!(restarted.call().await?, JobOutcome::WorkDone);
    assert_eq!(sink.checkpoint(ClaimType::Fiss), Some(100));
    assert_eq!(sink.claim_count(), 100);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_idle_feed_ends_run_gracefully() -> Result<()> {
    init_tracing();
    let source = InProcessClaimSource::new(claim_changes(1..=5, ClaimType::Mcs)).holding_open();
    let sink = Arc::new(InMemoryClaimSink::new());
    let mut job = rda_job(ClaimType::Mcs, rda_options(100, 10), Arc::new(source), sink.clone());

    let started = tokio::time::Instant::now();
    assert_eq!(job.call().await?, JobOutcome::WorkDone);

    assert!(started.elapsed() >= std::time::Duration::from_secs(10));
    assert_eq!(sink.checkpoint(ClaimType::Mcs), Some(5));
    assert_eq!(sink.commit_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_idle_feed_without_messages_is_nothing_to_do() -> Result<()> {
    init_tracing();
    let source = InProcessClaimSource::new(Vec::new()).holding_open();
    let sink = Arc::new(InMemoryClaimSink::new());
    let mut job = rda_job(ClaimType::Fiss, rda_options(10, 10), Arc::new(source), sink.clone());

    assert_eq!(job.call().await?, JobOutcome::NothingToDo);
    assert_eq!(sink.commit_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_commit_propagates_and_keeps_checkpoint() -> Result<()> {
    init_tracing();
    let source = InProcessClaimSource::new(claim_changes(1..=10, ClaimType::Fiss));
    let sink = Arc::new(InMemoryClaimSink::new());
    sink.fail_next_commit();
    let mut job = rda_job(ClaimType::Fiss, rda_options(5, 5), Arc::new(source), sink.clone());

    assert!(job.call().await.is_err());
    assert_eq!(sink.checkpoint(ClaimType::Fiss), None);

    job.call().await?;
    assert_eq!(sink.checkpoint(ClaimType::Fiss), Some(10));
    Ok(())
}

#[tokio::test]
async fn test_claim_types_keep_separate_checkpoints() -> Result<()> {
    init_tracing();
    let mut changes = claim_changes(1..=12, ClaimType::Fiss);
    changes.extend(claim_changes(100..=103, ClaimType::Mcs));
    let source: Arc<dyn ClaimStreamSource> = Arc::new(InProcessClaimSource::new(changes));
    let sink = Arc::new(InMemoryClaimSink::new());

    let mut fiss = rda_job(ClaimType::Fiss, rda_options(5, 5), source.clone(), sink.clone());
    let mut mcs = rda_job(ClaimType::Mcs, rda_options(5, 5), source, sink.clone());
    fiss.call().await?;
    mcs.call().await?;

    assert_eq!(sink.last_sequence_number(ClaimType::Fiss).await?, Some(12));
    assert_eq!(sink.last_sequence_number(ClaimType::Mcs).await?, Some(103));
    let claim = sink.claim(ClaimType::Mcs, "mcs-101").unwrap();
    assert!(claim.mbi_hash.is_some());
    assert_eq!(claim.payload["totalCharge"], "101.00");
    Ok(())
}
