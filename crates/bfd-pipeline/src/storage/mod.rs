//! Object storage
//!
//! [`ObjectStore`] is the small set of primitives the loaders need from a
//! bucket. [`s3::S3ObjectStore`] talks to S3 (or MinIO); [`InMemoryObjectStore`]
//! backs tests and dry runs. [`task_manager::S3TaskManager`] layers the
//! asynchronous download and move tasks of the CCW loader on top.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::BTreeMap, path::Path, sync::RwLock};
use tracing::debug;

pub mod config;
pub mod s3;
pub mod task_manager;

/// One entry of a bucket listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the bucket, for log messages
    fn bucket(&self) -> &str;

    /// Every object under `prefix`, across all result pages
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Write an object to a local file, returning the number of bytes written
    async fn download_to(&self, key: &str, path: &Path) -> Result<u64> {
        let data = self.get(key).await?;
        tokio::fs::write(path, &data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(data.len() as u64)
    }

    /// Copy then delete. Not atomic; a failed delete leaves both copies.
    async fn move_object(&self, source_key: &str, dest_key: &str) -> Result<()> {
        self.copy(source_key, dest_key).await?;
        self.delete(source_key).await
    }
}

/// Bucket held in memory
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn poisoned() -> anyhow::Error {
        anyhow!("In-memory object store lock poisoned")
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| ObjectSummary {
                key: key.clone(),
                size: data.len() as i64,
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("No such object: {}/{}", self.bucket, key))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        debug!("Storing {} bytes at {}/{}", data.len(), self.bucket, key);
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        let data = objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| anyhow!("No such object: {}/{}", self.bucket, source_key))?;
        objects.insert(dest_key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.remove(key);
        Ok(())
    }
}
