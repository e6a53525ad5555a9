//! Claim persistence
//!
//! A batch of claims and the checkpoint that covers it are written in one
//! transaction. After a crash, the feed is replayed from the checkpoint, so
//! at most the uncommitted batch is processed twice and never lost.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};
use tracing::{debug, instrument};

use super::{checkpoint::StreamCheckpoint, source::ClaimType, transform::RdaClaim};

#[async_trait]
pub trait ClaimSink: Send + Sync {
    /// Sequence number of the last committed batch, if any
    async fn last_sequence_number(&self, claim_type: ClaimType) -> Result<Option<i64>>;

    /// Write `claims` and advance the checkpoint to the last of them, atomically
    async fn commit_batch(
        &self,
        claim_type: ClaimType,
        claims: &[RdaClaim],
    ) -> Result<StreamCheckpoint>;
}

/// Postgres claim store
#[derive(Clone)]
pub struct PgClaimSink {
    pool: PgPool,
}

impl PgClaimSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Known `(mbi, hash)` pairs, for seeding the MBI cache at startup
    pub async fn load_mbi_hashes(&self, limit: usize) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT mbi, mbi_hash FROM rda_claims \
             WHERE mbi IS NOT NULL AND mbi_hash IS NOT NULL \
             LIMIT $1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("Failed to load MBI hashes")?;
        Ok(rows)
    }
}

#[async_trait]
impl ClaimSink for PgClaimSink {
    async fn last_sequence_number(&self, claim_type: ClaimType) -> Result<Option<i64>> {
        let sequence: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT last_sequence_number FROM rda_progress WHERE claim_type = $1",
        )
        .bind(claim_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read RDA progress")?;
        Ok(sequence.flatten())
    }

    #[instrument(skip(self, claims), fields(claims = claims.len()))]
    async fn commit_batch(
        &self,
        claim_type: ClaimType,
        claims: &[RdaClaim],
    ) -> Result<StreamCheckpoint> {
        let Some(batch_last) = claims.iter().map(|c| c.sequence_number).max() else {
            bail!("Refusing to commit an empty {} batch", claim_type);
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO rda_progress (claim_type, last_sequence_number) VALUES ($1, NULL) \
             ON CONFLICT (claim_type) DO NOTHING",
        )
        .bind(claim_type.as_str())
        .execute(&mut *tx)
        .await?;

        // Serializes concurrent writers of the same claim type.
        sqlx::query("SELECT last_sequence_number FROM rda_progress WHERE claim_type = $1 FOR UPDATE")
            .bind(claim_type.as_str())
            .execute(&mut *tx)
            .await?;

        for claim in claims {
            sqlx::query(
                r#"
                INSERT INTO rda_claims
                    (claim_type, claim_id, sequence_number, mbi, mbi_hash, payload, last_updated)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (claim_type, claim_id) DO UPDATE SET
                    sequence_number = EXCLUDED.sequence_number,
                    mbi = EXCLUDED.mbi,
                    mbi_hash = EXCLUDED.mbi_hash,
                    payload = EXCLUDED.payload,
                    last_updated = EXCLUDED.last_updated
                WHERE rda_claims.sequence_number < EXCLUDED.sequence_number
                "#,
            )
            .bind(claim_type.as_str())
            .bind(&claim.claim_id)
            .bind(claim.sequence_number)
            .bind(&claim.mbi)
            .bind(&claim.mbi_hash)
            .bind(&claim.payload)
            .bind(claim.last_updated)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to upsert claim {}", claim.claim_id))?;
        }

        let sequence_number: i64 = sqlx::query_scalar(
            "UPDATE rda_progress \
             SET last_sequence_number = GREATEST(last_sequence_number, $2), updated_at = now() \
             WHERE claim_type = $1 \
             RETURNING last_sequence_number",
        )
        .bind(claim_type.as_str())
        .bind(batch_last)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(%claim_type, sequence_number, "Committed claim batch");
        Ok(StreamCheckpoint {
            claim_type,
            sequence_number,
        })
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    claims: HashMap<(ClaimType, String), RdaClaim>,
    checkpoints: HashMap<ClaimType, i64>,
    commits: usize,
}

/// Claim store held in memory, with the same commit semantics as
/// [`PgClaimSink`]
#[derive(Debug, Default)]
pub struct InMemoryClaimSink {
    state: Mutex<InMemoryState>,
    fail_next_commit: AtomicBool,
}

impl InMemoryClaimSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing checkpoint
    pub fn with_checkpoint(self, claim_type: ClaimType, sequence_number: i64) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.checkpoints.insert(claim_type, sequence_number);
        }
        self
    }

    /// Make the next commit fail without writing anything
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn checkpoint(&self, claim_type: ClaimType) -> Option<i64> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.checkpoints.get(&claim_type).copied())
    }

    pub fn claim(&self, claim_type: ClaimType, claim_id: &str) -> Option<RdaClaim> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.claims.get(&(claim_type, claim_id.to_string())).cloned())
    }

    pub fn claim_count(&self) -> usize {
        self.state.lock().map(|state| state.claims.len()).unwrap_or(0)
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().map(|state| state.commits).unwrap_or(0)
    }
}

#[async_trait]
impl ClaimSink for InMemoryClaimSink {
    async fn last_sequence_number(&self, claim_type: ClaimType) -> Result<Option<i64>> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("Claim sink lock poisoned"))?;
        Ok(state.checkpoints.get(&claim_type).copied())
    }

    async fn commit_batch(
        &self,
        claim_type: ClaimType,
        claims: &[RdaClaim],
    ) -> Result<StreamCheckpoint> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            bail!("Simulated commit failure for {}", claim_type);
        }
        let Some(batch_last) = claims.iter().map(|c| c.sequence_number).max() else {
            bail!("Refusing to commit an empty {} batch", claim_type);
        };

        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("Claim sink lock poisoned"))?;

        for claim in claims {
            let key = (claim_type, claim.claim_id.clone());
            let newer = state
                .claims
                .get(&key)
                .is_none_or(|stored| stored.sequence_number < claim.sequence_number);
            if newer {
                state.claims.insert(key, claim.clone());
            }
        }

        let checkpoint = state.checkpoints.entry(claim_type).or_insert(batch_last);
        *checkpoint = (*checkpoint).max(batch_last);
        let sequence_number = *checkpoint;
        state.commits += 1;

        Ok(StreamCheckpoint {
            claim_type,
            sequence_number,
        })
    }
}
