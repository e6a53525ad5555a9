//! Deterministic identifier hashing
//!
//! Beneficiary identifiers (MBIs) are never stored in the clear. Every loader
//! hashes them with the same pepper and iteration count so that a hash computed
//! by the batch pipeline matches one computed by the streaming pipeline.
//!
//! Hashing is deliberately slow, and the same MBI shows up on many claims, so
//! lookups go through [`MbiCache`], an LRU memo in front of the [`IdHasher`].

use crate::error::{BfdError, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

/// Default number of hash rounds
pub const DEFAULT_HASH_ITERATIONS: u32 = 1000;

/// Default number of identifiers kept in an [`MbiCache`]
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

/// Hashing parameters. Changing either value changes every hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdHasherConfig {
    pub iterations: u32,
    pub pepper: String,
}

impl IdHasherConfig {
    pub fn new(iterations: u32, pepper: impl Into<String>) -> Self {
        Self {
            iterations,
            pepper: pepper.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(BfdError::Config(
                "hash iterations must be greater than 0".to_string(),
            ));
        }
        if self.pepper.is_empty() {
            return Err(BfdError::Config("hash pepper cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Iterated, peppered SHA-256 hasher
#[derive(Debug, Clone)]
pub struct IdHasher {
    config: IdHasherConfig,
}

impl IdHasher {
    pub fn new(config: IdHasherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IdHasherConfig {
        &self.config
    }

    /// Hash an identifier, returning lowercase hex
    pub fn compute_identifier_hash(&self, identifier: &str) -> Result<String> {
        if identifier.is_empty() {
            return Err(BfdError::InvalidIdentifier(
                "cannot hash an empty identifier".to_string(),
            ));
        }

        let pepper = self.config.pepper.as_bytes();
        let mut digest = Sha256::new()
            .chain_update(pepper)
            .chain_update(identifier.as_bytes())
            .finalize();

        for _ in 1..self.config.iterations {
            digest = Sha256::new()
                .chain_update(pepper)
                .chain_update(digest)
                .finalize();
        }

        Ok(hex::encode(digest))
    }
}

/// Lookup seam used by claim transformers.
pub trait IdHashCache: Send + Sync {
    fn lookup(&self, identifier: &str) -> Result<String>;
}

/// LRU cache of MBI hashes, shared by every job that hashes MBIs.
pub struct MbiCache {
    hasher: IdHasher,
    entries: Mutex<LruCache<String, String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MbiCache {
    /// Cache that computes missing hashes with `hasher`
    pub fn computed(hasher: IdHasher, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            hasher,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Pre-populate the cache with known `(mbi, hash)` pairs
    pub fn seed<I>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BfdError::Hashing("MBI cache lock poisoned".to_string()))?;
        for (mbi, hash) in pairs {
            entries.put(mbi, hash);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl IdHashCache for MbiCache {
    fn lookup(&self, identifier: &str) -> Result<String> {
        {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| BfdError::Hashing("MBI cache lock poisoned".to_string()))?;
            if let Some(hash) = entries.get(identifier) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hash.clone());
            }
        }

        // Hash outside the lock; two racing misses compute the same value.
        self.misses.fetch_add(1, Ordering::Relaxed);
        let hash = self.hasher.compute_identifier_hash(identifier)?;

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BfdError::Hashing("MBI cache lock poisoned".to_string()))?;
        entries.put(identifier.to_string(), hash.clone());
        Ok(hash)
    }
}
