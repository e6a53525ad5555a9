//! Shared fixtures for the pipeline integration tests
//!
//! Everything here runs in-process: an in-memory bucket, recording sinks, and
//! an in-process change feed. Nothing needs Postgres or S3.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use bfd_common::hashing::{IdHasher, IdHasherConfig, MbiCache};
use bfd_pipeline::{
    ccw::{
        manifest::{DataSetManifest, DataSetManifestEntry, DataSetManifestId},
        prevalidate::PreValidator,
        CcwRifLoadJob, RecordSink, RifFilesEvent,
    },
    config::{CcwRifLoadOptions, RdaLoadOptions},
    rda::{
        ChangeType, ClaimChange, ClaimSink, ClaimStreamSource, ClaimTransformer, ClaimType,
        RdaClaimPayload, RdaLoadJob,
    },
    storage::{task_manager::S3TaskManager, InMemoryObjectStore, ObjectStore},
};
use bytes::Bytes;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

pub const TEST_BUCKET: &str = "bfd-test-bucket";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bfd_pipeline=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// What a [`RecordingSink`] saw for one data set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDataSet {
    pub manifest_id: DataSetManifestId,
    pub synthetic_data: bool,
    /// `(file name, file contents)` in manifest order
    pub files: Vec<(String, String)>,
}

/// Record sink that waits for every download and keeps what it read
#[derive(Default)]
pub struct RecordingSink {
    loaded: Mutex<Vec<LoadedDataSet>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn loaded(&self) -> Vec<LoadedDataSet> {
        self.loaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn process(&self, event: &RifFilesEvent) -> Result<()> {
        if self.fail {
            bail!("record loader unavailable");
        }

        let mut files = Vec::new();
        for file in &event.files {
            let downloaded = file.handle.wait().await?;
            let contents = tokio::fs::read_to_string(&downloaded.path).await?;
            files.push((file.entry.name.clone(), contents));
        }

        self.loaded.lock().unwrap().push(LoadedDataSet {
            manifest_id: event.manifest_id,
            synthetic_data: event.synthetic_data,
            files,
        });
        Ok(())
    }
}

/// Pre-validator with a fixed answer
pub struct FixedValidator {
    valid: bool,
    calls: AtomicUsize,
}

impl FixedValidator {
    pub fn new(valid: bool) -> Arc<Self> {
        Arc::new(Self {
            valid,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PreValidator for FixedValidator {
    async fn is_valid(&self, _manifest: &DataSetManifest) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.valid)
    }
}

/// Upload the manifest and the named entry files. Entries without contents
/// are left out, as if still uploading.
pub async fn upload_data_set(
    store: &InMemoryObjectStore,
    manifest: &DataSetManifest,
    files: &[(&str, &str)],
) {
    for (name, contents) in files {
        let entry = manifest
            .entries
            .iter()
            .find(|entry| entry.name == *name)
            .expect("file is listed in the manifest");
        store
            .put(&manifest.entry_key_incoming(entry), Bytes::from(contents.to_string()))
            .await
            .unwrap();
    }
    store
        .put(&manifest.manifest_key_incoming(), Bytes::from(manifest.to_xml().unwrap()))
        .await
        .unwrap();
}

pub fn manifest(
    location: &str,
    timestamp: &str,
    sequence_id: u32,
    entries: Vec<DataSetManifestEntry>,
) -> DataSetManifest {
    DataSetManifest::new(
        location,
        timestamp,
        sequence_id,
        location.starts_with("Synthetic"),
        entries,
    )
    .unwrap()
}

/// CCW options that poll quickly and never prefetch
pub fn ccw_options(scratch_dir: &Path) -> CcwRifLoadOptions {
    let mut options = CcwRifLoadOptions::for_bucket(TEST_BUCKET);
    options.scratch_dir = scratch_dir.to_path_buf();
    options.availability_poll_millis = 100;
    options.availability_timeout_secs = 5;
    options.prefetch_min_free_bytes = u64::MAX;
    options
}

pub fn ccw_job(
    store: Arc<InMemoryObjectStore>,
    options: CcwRifLoadOptions,
    sink: Arc<dyn RecordSink>,
    validator: Option<Arc<dyn PreValidator>>,
) -> CcwRifLoadJob {
    let task_manager = Arc::new(
        S3TaskManager::new(store, options.scratch_dir.clone(), options.s3_worker_threads).unwrap(),
    );
    CcwRifLoadJob::new(options, task_manager, sink, validator).unwrap()
}

pub fn claim_change(sequence_number: i64, claim_type: ClaimType) -> ClaimChange {
    ClaimChange {
        sequence_number,
        claim_type,
        change_type: ChangeType::Upsert,
        claim: RdaClaimPayload {
            claim_id: format!("{}-{}", claim_type.as_str().to_lowercase(), sequence_number),
            mbi: Some(format!("1EG4TE5MK{:02}", sequence_number % 7)),
            details: serde_json::Map::from_iter([(
                "totalCharge".to_string(),
                serde_json::json!(format!("{}.00", sequence_number)),
            )]),
        },
    }
}

pub fn claim_changes(range: std::ops::RangeInclusive<i64>, claim_type: ClaimType) -> Vec<ClaimChange> {
    range.map(|n| claim_change(n, claim_type)).collect()
}

pub fn rda_options(batch_size: usize, idle_timeout_secs: u64) -> RdaLoadOptions {
    let mut options = RdaLoadOptions::for_api("http://localhost:0", "test-pepper");
    options.batch_size = batch_size;
    options.idle_timeout_secs = idle_timeout_secs;
    options.hash_iterations = 1;
    options
}

pub fn rda_job(
    claim_type: ClaimType,
    options: RdaLoadOptions,
    source: Arc<dyn ClaimStreamSource>,
    sink: Arc<dyn ClaimSink>,
) -> RdaLoadJob {
    let cache = Arc::new(MbiCache::computed(
        IdHasher::new(IdHasherConfig::new(options.hash_iterations, options.hash_pepper.clone())),
        options.mbi_cache_size,
    ));
    RdaLoadJob::new(
        claim_type,
        options,
        source,
        sink,
        Arc::new(ClaimTransformer::new(cache)),
    )
}
