//! Asynchronous S3 tasks for the CCW loader
//!
//! Downloads and data set moves run on a worker pool bounded by a semaphore so
//! that one large data set cannot fan out into hundreds of concurrent
//! requests. Nothing here retries; failures surface through the download
//! handle or, for moves, in the log.

use anyhow::{anyhow, Context, Result};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use sysinfo::Disks;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn};

use super::ObjectStore;
use crate::ccw::manifest::{DataSetManifest, DataSetManifestEntry};

/// A file downloaded into the scratch directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
}

type SharedDownload = Shared<BoxFuture<'static, Result<Arc<DownloadedFile>, Arc<anyhow::Error>>>>;

/// Handle to an in-flight or finished download. Cheap to clone; every clone
/// observes the same download.
#[derive(Clone)]
pub struct DownloadHandle {
    key: String,
    download: SharedDownload,
}

impl DownloadHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the download to finish
    pub async fn wait(&self) -> Result<Arc<DownloadedFile>> {
        self.download
            .clone()
            .await
            .map_err(|e| anyhow!("Download of '{}' failed: {:#}", self.key, e))
    }

    /// True once the download has finished, successfully or not
    pub fn is_finished(&self) -> bool {
        self.download.peek().is_some()
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("key", &self.key)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Runs S3 downloads and moves for one bucket
pub struct S3TaskManager {
    store: Arc<dyn ObjectStore>,
    scratch_dir: PathBuf,
    workers: Arc<Semaphore>,
    downloads: Mutex<HashMap<String, DownloadHandle>>,
    moves: Mutex<Vec<JoinHandle<()>>>,
}

impl S3TaskManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        scratch_dir: impl Into<PathBuf>,
        worker_threads: usize,
    ) -> Result<Self> {
        let scratch_dir = scratch_dir.into();
        std::fs::create_dir_all(&scratch_dir).with_context(|| {
            format!("Failed to create scratch directory {}", scratch_dir.display())
        })?;

        info!(
            bucket = store.bucket(),
            scratch_dir = %scratch_dir.display(),
            worker_threads,
            "S3 task manager started"
        );

        Ok(Self {
            store,
            scratch_dir,
            workers: Arc::new(Semaphore::new(worker_threads.max(1))),
            downloads: Mutex::new(HashMap::new()),
            moves: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Start downloading `entry` of `manifest`, or return the download already
    /// started for the same object.
    pub fn download_async(
        &self,
        manifest: &DataSetManifest,
        entry: &DataSetManifestEntry,
    ) -> DownloadHandle {
        let key = manifest.entry_key_incoming(entry);
        let mut downloads = self.downloads.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(handle) = downloads.get(&key) {
            debug!(key = %key, "Reusing existing download");
            return handle.clone();
        }

        let store = Arc::clone(&self.store);
        let workers = Arc::clone(&self.workers);
        let path = self.scratch_dir.join(scratch_file_name(&key));
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .context("S3 worker pool closed")?;
            debug!(key = %task_key, "Downloading");
            let size = store.download_to(&task_key, &path).await?;
            info!(key = %task_key, size, "Downloaded data set file");
            Ok::<_, anyhow::Error>(Arc::new(DownloadedFile {
                key: task_key,
                path,
                size,
            }))
        });

        let download = async move {
            match task.await {
                Ok(result) => result.map_err(Arc::new),
                Err(join_error) => Err(Arc::new(anyhow!("Download task aborted: {}", join_error))),
            }
        }
        .boxed()
        .shared();

        let handle = DownloadHandle {
            key: key.clone(),
            download,
        };
        downloads.insert(key, handle.clone());
        handle
    }

    /// Number of downloads currently tracked
    pub fn tracked_downloads(&self) -> usize {
        self.downloads.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Forget the downloads of `manifest` and delete their scratch files
    #[instrument(skip(self, manifest), fields(manifest = %manifest.id))]
    pub async fn cleanup(&self, manifest: &DataSetManifest) {
        let handles: Vec<DownloadHandle> = {
            let mut downloads = self.downloads.lock().unwrap_or_else(|e| e.into_inner());
            manifest
                .entries
                .iter()
                .filter_map(|entry| downloads.remove(&manifest.entry_key_incoming(entry)))
                .collect()
        };

        for handle in handles {
            // An unfinished download would otherwise write its file after removal.
            if !handle.is_finished() {
                if let Err(e) = handle.wait().await {
                    debug!("Abandoned download did not complete: {:#}", e);
                }
            }
            let path = self.scratch_dir.join(scratch_file_name(handle.key()));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed scratch file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => warn!(path = %path.display(), "Failed to remove scratch file: {}", e),
            }
        }
    }

    /// Move `manifest` and its files to their done (or failed) location in the
    /// background. Failures are logged and not retried.
    pub fn submit_move(&self, manifest: DataSetManifest) {
        let task = DataSetMoveTask {
            store: Arc::clone(&self.store),
            manifest,
        };
        let workers = Arc::clone(&self.workers);

        let handle = tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                error!(manifest = %task.manifest.id, "S3 worker pool closed; data set not moved");
                return;
            };
            if let Err(e) = task.run().await {
                error!(manifest = %task.manifest.id, "Failed to move data set: {:#}", e);
            }
        });

        let mut moves = self.moves.lock().unwrap_or_else(|e| e.into_inner());
        moves.retain(|m| !m.is_finished());
        moves.push(handle);
    }

    /// Free space on the file system holding the scratch directory
    pub fn free_scratch_space(&self) -> Option<u64> {
        let scratch = std::fs::canonicalize(&self.scratch_dir).ok()?;
        Disks::new_with_refreshed_list()
            .iter()
            .filter(|disk| scratch.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }

    /// Wait for every submitted move to finish
    pub async fn shutdown(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut moves = self.moves.lock().unwrap_or_else(|e| e.into_inner());
            moves.drain(..).collect()
        };

        if !pending.is_empty() {
            info!("Waiting for {} data set move(s) to finish", pending.len());
        }
        for handle in pending {
            if let Err(e) = handle.await {
                error!("Data set move task panicked: {}", e);
            }
        }
    }
}

/// Relocates a data set from its incoming to its done location
struct DataSetMoveTask {
    store: Arc<dyn ObjectStore>,
    manifest: DataSetManifest,
}

impl DataSetMoveTask {
    /// Copies everything first, then deletes, so a failure part way never
    /// leaves an object with no copy at all.
    async fn run(&self) -> Result<()> {
        let manifest = &self.manifest;
        let mut moves: Vec<(String, String)> = manifest
            .entries
            .iter()
            .map(|entry| (manifest.entry_key_incoming(entry), manifest.entry_key_done(entry)))
            .collect();
        moves.push((manifest.manifest_key_incoming(), manifest.manifest_key_done()));

        for (source, dest) in &moves {
            self.store.copy(source, dest).await?;
        }
        for (source, _) in &moves {
            self.store.delete(source).await?;
        }

        info!(
            manifest = %manifest.id,
            destination = manifest.done_location(),
            "Data set moved"
        );
        Ok(())
    }
}

fn scratch_file_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        ccw::manifest::{RifFileType, S3_PREFIX_PENDING_DATA_SETS},
        storage::InMemoryObjectStore,
    };
    use bytes::Bytes;

    fn manifest() -> DataSetManifest {
        DataSetManifest::new(
            S3_PREFIX_PENDING_DATA_SETS,
            "2024-01-02T03:04:05Z",
            0,
            false,
            vec![
                DataSetManifestEntry::new("beneficiaries.rif", RifFileType::Beneficiary),
                DataSetManifestEntry::new("carrier.rif", RifFileType::Carrier),
            ],
        )
        .unwrap()
    }

    async fn seeded_store(manifest: &DataSetManifest) -> Arc<InMemoryObjectStore> {
        let store = Arc::new(InMemoryObjectStore::new("test-bucket"));
        store
            .put(&manifest.manifest_key_incoming(), Bytes::from(manifest.to_xml().unwrap()))
            .await
            .unwrap();
        for entry in &manifest.entries {
            store
                .put(&manifest.entry_key_incoming(entry), Bytes::from(format!("{}\n", entry.name)))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_download_is_shared_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest();
        let store = seeded_store(&manifest).await;
        let manager = S3TaskManager::new(store, dir.path(), 2).unwrap();

        let first = manager.download_async(&manifest, &manifest.entries[0]);
        let second = manager.download_async(&manifest, &manifest.entries[0]);
        assert_eq!(manager.tracked_downloads(), 1);

        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(std::fs::read_to_string(&a.path).unwrap(), "beneficiaries.rif\n");
    }

    #[tokio::test]
    async fn test_missing_object_fails_download() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest();
        let store = Arc::new(InMemoryObjectStore::new("test-bucket"));
        let manager = S3TaskManager::new(store, dir.path(), 1).unwrap();

        let handle = manager.download_async(&manifest, &manifest.entries[1]);
        let err = handle.wait().await.unwrap_err();
        assert!(err.to_string().contains("carrier.rif"));
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_cleanup_removes_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest();
        let store = seeded_store(&manifest).await;
        let manager = S3TaskManager::new(store, dir.path(), 2).unwrap();

        let handles: Vec<_> = manifest
            .entries
            .iter()
            .map(|entry| manager.download_async(&manifest, entry))
            .collect();
        let mut paths = Vec::new();
        for handle in &handles {
            paths.push(handle.wait().await.unwrap().path.clone());
        }

        manager.cleanup(&manifest).await;

        assert_eq!(manager.tracked_downloads(), 0);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_move_relocates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest();
        let store = seeded_store(&manifest).await;
        let manager = S3TaskManager::new(store.clone(), dir.path(), 2).unwrap();

        manager.submit_move(manifest.clone());
        manager.shutdown().await;

        assert!(store.contains("Done/2024-01-02T03:04:05Z/0_manifest.xml"));
        assert!(store.contains("Done/2024-01-02T03:04:05Z/beneficiaries.rif"));
        assert!(store.contains("Done/2024-01-02T03:04:05Z/carrier.rif"));
        assert!(store.list("Incoming/").await.unwrap().is_empty());
    }

    #[test]
    fn test_scratch_file_name() {
        assert_eq!(
            scratch_file_name("Incoming/2024-01-02T03:04:05Z/carrier.rif"),
            "Incoming_2024-01-02T03_04_05Z_carrier.rif"
        );
    }
}
