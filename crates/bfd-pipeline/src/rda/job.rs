//! The RDA load job
//!
//! One job per claim type. Each run opens the change feed at the committed
//! checkpoint, transforms messages into claims and commits them in batches,
//! each batch together with its checkpoint. A run ends when the feed goes
//! idle, ends, or fails. Only an idle or ended feed commits its final partial
//! batch; a failure leaves everything after the last full batch uncommitted.

use anyhow::{bail, Result};
use futures::StreamExt;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use super::{
    checkpoint::{already_committed, starting_sequence_number},
    sink::ClaimSink,
    source::{ClaimStreamSource, ClaimType},
    transform::{ClaimTransformer, RdaClaim},
};
use crate::{
    config::RdaLoadOptions,
    error::PipelineError,
    pipeline::{JobOutcome, JobSchedule},
};

/// Logged when a run opens the change feed.
pub const LOG_MESSAGE_STREAM_STARTED: &str = "Starting RDA change feed call.";

/// Logged when a run closes the change feed, whatever the reason.
pub const LOG_MESSAGE_STREAM_TERMINATED: &str = "RDA change feed call terminated.";

/// Progress of one run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamProgress {
    /// Messages received and transformed
    pub processed: u64,
    /// Claims written by committed batches
    pub committed: u64,
    /// Last committed checkpoint
    pub checkpoint: Option<i64>,
}

/// Why the receive loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Idle,
    Finished,
    BatchLimit,
}

pub struct RdaLoadJob {
    claim_type: ClaimType,
    job_type: String,
    options: RdaLoadOptions,
    source: Arc<dyn ClaimStreamSource>,
    sink: Arc<dyn ClaimSink>,
    transformer: Arc<ClaimTransformer>,
    last_progress: StreamProgress,
}

impl RdaLoadJob {
    pub fn new(
        claim_type: ClaimType,
        options: RdaLoadOptions,
        source: Arc<dyn ClaimStreamSource>,
        sink: Arc<dyn ClaimSink>,
        transformer: Arc<ClaimTransformer>,
    ) -> Self {
        Self {
            claim_type,
            job_type: format!("RdaLoadJob[{}]", claim_type),
            options,
            source,
            sink,
            transformer,
            last_progress: StreamProgress::default(),
        }
    }

    pub fn claim_type(&self) -> ClaimType {
        self.claim_type
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(self.options.job_interval())
    }

    pub fn is_interruptible(&self) -> bool {
        false
    }

    /// Progress of the most recent run
    pub fn last_progress(&self) -> StreamProgress {
        self.last_progress
    }

    /// Passes when the API answers its version call
    pub async fn is_smoke_test_successful(&self) -> bool {
        match self.source.call_version_service().await {
            Ok(version) => {
                info!(job = %self.job_type, %version, "RDA API reachable");
                true
            },
            Err(e) => {
                error!("Smoke test failed for {}: {:#}", self.job_type, e);
                false
            },
        }
    }

    pub async fn call(&mut self) -> Result<JobOutcome> {
        let claim_type = self.claim_type;
        let checkpoint = self.sink.last_sequence_number(claim_type).await?;
        let start = starting_sequence_number(checkpoint, self.options.starting_sequence_number);

        info!(
            %claim_type,
            checkpoint = ?checkpoint,
            starting_sequence_number = start,
            "{}",
            LOG_MESSAGE_STREAM_STARTED
        );

        let mut progress = StreamProgress {
            checkpoint,
            ..StreamProgress::default()
        };
        let result = self.consume(start, &mut progress).await;
        self.last_progress = progress;

        match &result {
            Ok(end) => info!(
                %claim_type,
                processed = progress.processed,
                committed = progress.committed,
                checkpoint = ?progress.checkpoint,
                reason = ?end,
                "{}",
                LOG_MESSAGE_STREAM_TERMINATED
            ),
            Err(e) => error!(
                %claim_type,
                processed = progress.processed,
                committed = progress.committed,
                checkpoint = ?progress.checkpoint,
                "{} Failed: {:#}",
                LOG_MESSAGE_STREAM_TERMINATED,
                e
            ),
        }

        result?;
        if progress.processed > 0 {
            Ok(JobOutcome::WorkDone)
        } else {
            Ok(JobOutcome::NothingToDo)
        }
    }

    pub async fn shutdown(&mut self) {
        debug!(job = %self.job_type, "Shut down");
    }

    async fn consume(&self, start: i64, progress: &mut StreamProgress) -> Result<StreamEnd> {
        let claim_type = self.claim_type;
        let idle_timeout: Duration = self.options.idle_timeout();
        let batch_size = self.options.batch_size;
        let committed_before = progress.checkpoint;

        let mut stream = self.source.call_service(claim_type, start).await?;
        let mut batch: Vec<RdaClaim> = Vec::with_capacity(batch_size);
        let mut previous: Option<i64> = None;
        let mut batches = 0usize;

        let end = loop {
            let change = match tokio::time::timeout(idle_timeout, stream.next()).await {
                Err(_) => {
                    debug!(%claim_type, ?idle_timeout, "No message within idle timeout");
                    break StreamEnd::Idle;
                },
                Ok(None) => break StreamEnd::Finished,
                Ok(Some(Err(e))) => {
                    if !batch.is_empty() {
                        warn!(
                            %claim_type,
                            discarded = batch.len(),
                            "Discarding uncommitted partial batch"
                        );
                    }
                    return Err(PipelineError::StreamTransport {
                        claim_type: claim_type.to_string(),
                        processed: progress.processed,
                        committed: progress.committed,
                        message: format!("{:#}", e),
                    }
                    .into());
                },
                Ok(Some(Ok(change))) => change,
            };

            if change.claim_type != claim_type {
                bail!(
                    "{} change feed delivered a {} claim at sequence {}",
                    claim_type,
                    change.claim_type,
                    change.sequence_number
                );
            }

            if let Some(previous) = previous {
                if change.sequence_number <= previous {
                    return Err(PipelineError::SequenceOutOfOrder {
                        claim_type: claim_type.to_string(),
                        previous,
                        received: change.sequence_number,
                    }
                    .into());
                }
            }
            previous = Some(change.sequence_number);

            if change.sequence_number < start {
                warn!(
                    %claim_type,
                    start,
                    received = change.sequence_number,
                    "Feed replayed from before the requested start; skipping"
                );
                continue;
            }
            if already_committed(committed_before, change.sequence_number) {
                debug!(%claim_type, sequence_number = change.sequence_number, "Skipping committed message");
                continue;
            }

            batch.push(self.transformer.transform(&change)?);
            progress.processed += 1;

            if batch.len() >= batch_size {
                self.commit(&mut batch, progress).await?;
                batches += 1;
                if self
                    .options
                    .max_batches_per_call
                    .is_some_and(|max| batches >= max)
                {
                    break StreamEnd::BatchLimit;
                }
            }
        };

        if !batch.is_empty() {
            self.commit(&mut batch, progress).await?;
        }
        Ok(end)
    }

    async fn commit(&self, batch: &mut Vec<RdaClaim>, progress: &mut StreamProgress) -> Result<()> {
        let checkpoint = self.sink.commit_batch(self.claim_type, batch).await?;
        progress.committed += batch.len() as u64;
        progress.checkpoint = Some(checkpoint.sequence_number);
        debug!(
            claim_type = %self.claim_type,
            claims = batch.len(),
            checkpoint = checkpoint.sequence_number,
            "Committed batch"
        );
        batch.clear();
        Ok(())
    }
}
