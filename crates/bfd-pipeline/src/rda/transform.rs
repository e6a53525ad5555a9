//! Conversion of feed messages into stored claims

use bfd_common::hashing::IdHashCache;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::source::{ClaimChange, ClaimType};
use crate::error::{PipelineError, PipelineResult};

/// Longest claim id the claim tables accept
pub const MAX_CLAIM_ID_LENGTH: usize = 43;

/// Longest MBI the claim tables accept
pub const MAX_MBI_LENGTH: usize = 13;

/// Source of "now" for `last_updated`
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A claim ready to be written
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RdaClaim {
    pub claim_type: ClaimType,
    pub claim_id: String,
    pub sequence_number: i64,
    pub mbi: Option<String>,
    pub mbi_hash: Option<String>,
    pub payload: serde_json::Value,
    pub last_updated: DateTime<Utc>,
}

pub struct ClaimTransformer {
    hash_cache: Arc<dyn IdHashCache>,
    clock: Clock,
}

impl ClaimTransformer {
    pub fn new(hash_cache: Arc<dyn IdHashCache>) -> Self {
        Self::with_clock(hash_cache, Arc::new(Utc::now))
    }

    pub fn with_clock(hash_cache: Arc<dyn IdHashCache>, clock: Clock) -> Self {
        Self { hash_cache, clock }
    }

    pub fn transform(&self, change: &ClaimChange) -> PipelineResult<RdaClaim> {
        let claim_id = change.claim.claim_id.trim();
        let error = |reason: String| PipelineError::Transform {
            claim_id: claim_id.to_string(),
            reason,
        };

        if claim_id.is_empty() {
            return Err(error("claim id is required".to_string()));
        }
        if claim_id.len() > MAX_CLAIM_ID_LENGTH {
            return Err(error(format!(
                "claim id is {} characters; at most {} allowed",
                claim_id.len(),
                MAX_CLAIM_ID_LENGTH
            )));
        }

        let mbi = change
            .claim
            .mbi
            .as_deref()
            .map(str::trim)
            .filter(|mbi| !mbi.is_empty());
        if let Some(mbi) = mbi {
            if mbi.len() > MAX_MBI_LENGTH {
                return Err(error(format!(
                    "MBI is {} characters; at most {} allowed",
                    mbi.len(),
                    MAX_MBI_LENGTH
                )));
            }
        }

        let mbi_hash = mbi
            .map(|mbi| self.hash_cache.lookup(mbi))
            .transpose()
            .map_err(|e| error(format!("failed to hash MBI: {}", e)))?;

        let payload = serde_json::to_value(&change.claim)
            .map_err(|e| error(format!("failed to serialize claim: {}", e)))?;

        Ok(RdaClaim {
            claim_type: change.claim_type,
            claim_id: claim_id.to_string(),
            sequence_number: change.sequence_number,
            mbi: mbi.map(str::to_string),
            mbi_hash,
            payload,
            last_updated: (self.clock)(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::rda::source::{ChangeType, RdaClaimPayload};
    use bfd_common::hashing::{IdHasher, IdHasherConfig, MbiCache};
    use chrono::TimeZone;

    fn transformer() -> (ClaimTransformer, Arc<MbiCache>) {
        let cache = Arc::new(MbiCache::computed(
            IdHasher::new(IdHasherConfig::new(2, "pepper")),
            16,
        ));
        let fixed = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        (
            ClaimTransformer::with_clock(cache.clone(), Arc::new(move || fixed)),
            cache,
        )
    }

    fn change(claim_id: &str, mbi: Option<&str>) -> ClaimChange {
        ClaimChange {
            sequence_number: 7,
            claim_type: ClaimType::Fiss,
            change_type: ChangeType::Insert,
            claim: RdaClaimPayload {
                claim_id: claim_id.to_string(),
                mbi: mbi.map(str::to_string),
                details: serde_json::Map::new(),
            },
        }
    }

    #[test]
    fn test_transform_hashes_mbi_through_cache() {
        let (transformer, cache) = transformer();

        let first = transformer.transform(&change("c1", Some("1EG4TE5MK73"))).unwrap();
        let second = transformer.transform(&change("c2", Some("1EG4TE5MK73"))).unwrap();

        assert_eq!(first.mbi_hash, second.mbi_hash);
        assert_eq!(first.mbi_hash.as_ref().unwrap().len(), 64);
        assert_eq!(cache.stats(), (1, 1));
        assert_eq!(first.last_updated, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        assert_eq!(first.sequence_number, 7);
    }

    #[test]
    fn test_transform_without_mbi() {
        let (transformer, _) = transformer();
        let claim = transformer.transform(&change("c1", Some("  "))).unwrap();
        assert_eq!(claim.mbi, None);
        assert_eq!(claim.mbi_hash, None);
    }

    #[test]
    fn test_transform_rejects_bad_identifiers() {
        let (transformer, _) = transformer();
        assert!(matches!(
            transformer.transform(&change("", None)),
            Err(PipelineError::Transform { .. })
        ));
        assert!(transformer.transform(&change(&"x".repeat(44), None)).is_err());
        assert!(transformer.transform(&change("c1", Some("12345678901234"))).is_err());
    }
}
