//! The CCW RIF load job
//!
//! Each run loads at most one data set:
//!
//! 1. refresh the [`DataSetQueue`] from the bucket
//! 2. pick the oldest pending data set
//! 3. wait until every file it lists has been uploaded
//! 4. run pre-validation, if the data set asks for it
//! 5. hand the files to the [`RecordSink`] and wait for it to finish
//! 6. prefetch the next data set when it is ready and disk space allows
//! 7. mark the data set processed and move it to its done location
//!
//! A sink failure propagates out of [`CcwRifLoadJob::call`]. The data set stays
//! pending, and reloading it relies on the sink being idempotent.

use anyhow::Result;
use std::{collections::HashSet, sync::Arc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    manifest::{DataSetManifest, S3_PREFIX_PENDING_DATA_SETS},
    prevalidate::PreValidator,
    queue::DataSetQueue,
    sink::{RecordSink, RifFile, RifFilesEvent},
};
use crate::{
    config::CcwRifLoadOptions,
    pipeline::{JobOutcome, JobSchedule},
    storage::task_manager::S3TaskManager,
};

/// Logged when a run finds nothing to load.
pub const LOG_MESSAGE_NO_DATA_SETS: &str = "No data sets to process found.";

/// Logged when a data set is fully uploaded and loading starts.
pub const LOG_MESSAGE_DATA_SET_READY: &str = "Data set ready. Processing it...";

/// Logged when a data set has been loaded.
pub const LOG_MESSAGE_DATA_SET_COMPLETE: &str = "Data set processing complete.";

/// Logged once per run while a data set is still uploading.
pub const LOG_MESSAGE_DATA_SET_NOT_READY: &str =
    "Data set not ready. Waiting for it to finish uploading...";

pub const JOB_TYPE: &str = "CcwRifLoadJob";

pub struct CcwRifLoadJob {
    options: CcwRifLoadOptions,
    task_manager: Arc<S3TaskManager>,
    queue: DataSetQueue,
    sink: Arc<dyn RecordSink>,
    pre_validator: Option<Arc<dyn PreValidator>>,
}

impl CcwRifLoadJob {
    pub fn new(
        options: CcwRifLoadOptions,
        task_manager: Arc<S3TaskManager>,
        sink: Arc<dyn RecordSink>,
        pre_validator: Option<Arc<dyn PreValidator>>,
    ) -> Result<Self> {
        let queue = DataSetQueue::new(Arc::clone(task_manager.store()))?;
        Ok(Self {
            options,
            task_manager,
            queue,
            sink,
            pre_validator,
        })
    }

    pub fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(std::time::Duration::from_secs(1))
    }

    pub fn is_interruptible(&self) -> bool {
        false
    }

    pub fn queue(&self) -> &DataSetQueue {
        &self.queue
    }

    /// Passes when the bucket can be listed
    pub async fn is_smoke_test_successful(&self) -> bool {
        let store = self.task_manager.store();
        match store.list(&format!("{}/", S3_PREFIX_PENDING_DATA_SETS)).await {
            Ok(_) => true,
            Err(e) => {
                error!(bucket = store.bucket(), "Smoke test failed for {}: {:#}", JOB_TYPE, e);
                false
            },
        }
    }

    pub async fn call(&mut self) -> Result<JobOutcome> {
        debug!("Scanning for data sets to process...");

        self.queue.update_pending_data_sets().await?;

        let Some(mut manifest) = self.queue.next_data_set_to_process() else {
            debug!("{}", LOG_MESSAGE_NO_DATA_SETS);
            return Ok(JobOutcome::NothingToDo);
        };

        info!(
            "Found data set to process: '{}'. There were '{}' total pending data sets and '{}' completed ones.",
            manifest,
            self.queue.pending_manifests_count(),
            self.queue.completed_manifests_count()
        );

        if !self.await_availability(&manifest).await? {
            return Ok(JobOutcome::NothingToDo);
        }

        info!("{}", LOG_MESSAGE_DATA_SET_READY);
        info!("Data set syntheticData indicator is: {}", manifest.synthetic_data);

        let pre_validation_ok = match &manifest.pre_validation_properties {
            Some(_) if !self.options.idempotency_required => {
                self.check_pre_validation(&manifest).await?
            },
            _ => true,
        };

        if pre_validation_ok {
            let files: Vec<RifFile> = manifest
                .entries
                .iter()
                .map(|entry| RifFile {
                    entry: entry.clone(),
                    handle: self.task_manager.download_async(&manifest, entry),
                })
                .collect();

            let event = RifFilesEvent {
                manifest_id: manifest.id,
                synthetic_data: manifest.synthetic_data,
                files,
            };

            self.prefetch_next_data_set().await?;

            // Block until loaded; two data sets must never load concurrently.
            self.sink.process(&event).await?;
            info!("{}", LOG_MESSAGE_DATA_SET_COMPLETE);
        } else {
            warn!(
                manifest = %manifest.id,
                "Pre-validation failed; moving data set to its failed location"
            );
            manifest.redirect_to_failed();
        }

        // A prefetch of this data set may have started even if it never loaded.
        self.task_manager.cleanup(&manifest).await;

        self.queue.mark_processed(&manifest);
        self.task_manager.submit_move(manifest);

        Ok(JobOutcome::WorkDone)
    }

    /// Drain outstanding S3 moves
    pub async fn shutdown(&mut self) {
        self.task_manager.shutdown().await;
    }

    /// Poll until every listed file exists. `Ok(false)` when the configured
    /// timeout elapses first.
    async fn await_availability(&self, manifest: &DataSetManifest) -> Result<bool> {
        let started = Instant::now();
        let mut logged_waiting = false;

        while !self.data_set_is_available(manifest).await? {
            if !logged_waiting {
                info!("{}", LOG_MESSAGE_DATA_SET_NOT_READY);
                logged_waiting = true;
            }
            if let Some(timeout) = self.options.availability_timeout() {
                if started.elapsed() >= timeout {
                    warn!(
                        manifest = %manifest.id,
                        "Data set still incomplete after {:?}; will retry on a later run",
                        timeout
                    );
                    return Ok(false);
                }
            }
            tokio::time::sleep(self.options.availability_poll_interval()).await;
        }

        Ok(true)
    }

    async fn data_set_is_available(&self, manifest: &DataSetManifest) -> Result<bool> {
        let prefix = manifest.incoming_data_set_prefix();
        let present: HashSet<String> = self
            .task_manager
            .store()
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|object| object.key.strip_prefix(&prefix).map(str::to_string))
            .collect();

        for entry in &manifest.entries {
            if !present.contains(&entry.name) {
                debug!("Waiting for file '{}', part of data set: '{}'.", entry.name, manifest);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn check_pre_validation(&self, manifest: &DataSetManifest) -> Result<bool> {
        info!(
            "PreValidationProperties found in manifest, ID: {}; verifying efficacy...",
            manifest.id
        );

        if !manifest.synthetic_data {
            return Ok(true);
        }

        match &self.pre_validator {
            Some(validator) => validator.is_valid(manifest).await,
            None => {
                warn!("No pre-validator configured; accepting synthetic data set {}", manifest.id);
                Ok(true)
            },
        }
    }

    /// Start downloading the next data set early when it is already complete
    /// and there is room for it.
    async fn prefetch_next_data_set(&self) -> Result<()> {
        let Some(next) = self.queue.second_data_set_to_process() else {
            return Ok(());
        };
        if !self.data_set_is_available(&next).await? {
            return Ok(());
        }

        let free = self.task_manager.free_scratch_space().unwrap_or(0);
        if free < self.options.prefetch_min_free_bytes {
            debug!(
                free,
                required = self.options.prefetch_min_free_bytes,
                "Not enough scratch space to prefetch {}",
                next.id
            );
            return Ok(());
        }

        info!(manifest = %next.id, "Prefetching next data set");
        for entry in &next.entries {
            self.task_manager.download_async(&next, entry);
        }
        Ok(())
    }
}
