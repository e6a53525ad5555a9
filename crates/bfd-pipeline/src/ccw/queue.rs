//! Queue of data sets waiting to be loaded

use anyhow::{Context, Result};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};
use tracing::{debug, warn};

use super::manifest::{
    DataSetManifest, DataSetManifestId, ManifestKeyPatterns, S3_PREFIX_COMPLETED_DATA_SETS,
    S3_PREFIX_COMPLETED_SYNTHETIC_DATA_SETS, S3_PREFIX_PENDING_DATA_SETS,
    S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS,
};
use crate::storage::ObjectStore;

/// Pending and completed data sets, as last seen in the bucket.
///
/// Completed identities are remembered in memory as well as read from the
/// done prefixes. S3 moves are only eventually consistent, so a data set that
/// was just loaded may still be listed as incoming for a while.
pub struct DataSetQueue {
    store: Arc<dyn ObjectStore>,
    patterns: ManifestKeyPatterns,
    pending: BTreeMap<DataSetManifestId, DataSetManifest>,
    /// Every manifest parsed so far, so each is downloaded only once
    known_manifests: HashMap<DataSetManifestId, DataSetManifest>,
    processed: BTreeSet<DataSetManifestId>,
    completed_in_bucket: BTreeSet<DataSetManifestId>,
}

impl DataSetQueue {
    pub fn new(store: Arc<dyn ObjectStore>) -> Result<Self> {
        Ok(Self {
            store,
            patterns: ManifestKeyPatterns::new()?,
            pending: BTreeMap::new(),
            known_manifests: HashMap::new(),
            processed: BTreeSet::new(),
            completed_in_bucket: BTreeSet::new(),
        })
    }

    /// Re-list the bucket and rebuild the pending set
    pub async fn update_pending_data_sets(&mut self) -> Result<()> {
        let mut completed = BTreeSet::new();
        for prefix in [S3_PREFIX_COMPLETED_DATA_SETS, S3_PREFIX_COMPLETED_SYNTHETIC_DATA_SETS] {
            for object in self.store.list(&format!("{}/", prefix)).await? {
                if let Some(key) = self.patterns.parse_completed(&object.key) {
                    completed.insert(key.id);
                }
            }
        }
        self.completed_in_bucket = completed;

        let mut pending = BTreeMap::new();
        for prefix in [S3_PREFIX_PENDING_DATA_SETS, S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS] {
            for object in self.store.list(&format!("{}/", prefix)).await? {
                let Some(key) = self.patterns.parse_pending(&object.key) else {
                    continue;
                };
                if self.is_completed(&key.id) {
                    debug!(key = %key.key, "Skipping already-processed data set");
                    continue;
                }

                let manifest = match self.known_manifests.get(&key.id) {
                    Some(manifest) => manifest.clone(),
                    None => {
                        let xml = self
                            .store
                            .get(&key.key)
                            .await
                            .with_context(|| format!("Failed to read manifest {}", key.key))?;
                        let xml = String::from_utf8(xml.to_vec())
                            .with_context(|| format!("Manifest {} is not UTF-8", key.key))?;
                        let manifest = DataSetManifest::parse(&key, &xml)?;
                        debug!(manifest = %manifest, "Found new data set manifest");
                        self.known_manifests.insert(key.id, manifest.clone());
                        manifest
                    },
                };

                if let Some(previous) = pending.insert(key.id, manifest) {
                    warn!(
                        "Data set {} found under two incoming prefixes; using {}",
                        previous.id,
                        key.key
                    );
                }
            }
        }

        self.known_manifests.retain(|id, _| pending.contains_key(id));
        self.pending = pending;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_manifests_count(&self) -> usize {
        self.pending.len()
    }

    /// Data sets loaded by this process or found under a done prefix
    pub fn completed_manifests_count(&self) -> usize {
        self.processed.union(&self.completed_in_bucket).count()
    }

    /// The oldest pending data set
    pub fn next_data_set_to_process(&self) -> Option<DataSetManifest> {
        self.pending.values().next().cloned()
    }

    /// The data set after [`Self::next_data_set_to_process`], for prefetching
    pub fn second_data_set_to_process(&self) -> Option<DataSetManifest> {
        self.pending.values().nth(1).cloned()
    }

    /// Record `manifest` as processed; it will not be returned again even if
    /// it is still listed as incoming.
    pub fn mark_processed(&mut self, manifest: &DataSetManifest) {
        self.processed.insert(manifest.id);
        self.pending.remove(&manifest.id);
        self.known_manifests.remove(&manifest.id);
    }

    fn is_completed(&self, id: &DataSetManifestId) -> bool {
        self.processed.contains(id) || self.completed_in_bucket.contains(id)
    }
}
