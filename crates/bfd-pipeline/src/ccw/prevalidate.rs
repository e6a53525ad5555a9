//! Checks run on a data set before it is loaded

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};

use super::manifest::{DataSetManifest, PreValidationProperties};

/// First beneficiary id a synthetic data set will insert
pub const PROPERTY_BENE_ID_START: &str = "bene_id_start";

/// Last beneficiary id a synthetic data set will insert
pub const PROPERTY_BENE_ID_END: &str = "bene_id_end";

#[async_trait]
pub trait PreValidator: Send + Sync {
    /// `Ok(false)` sends the data set to the failed location without loading it
    async fn is_valid(&self, manifest: &DataSetManifest) -> Result<bool>;
}

/// Rejects a synthetic data set whose beneficiary id range overlaps
/// beneficiaries that are already loaded.
#[derive(Clone)]
pub struct PgBeneIdRangeValidator {
    pool: PgPool,
}

impl PgBeneIdRangeValidator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreValidator for PgBeneIdRangeValidator {
    async fn is_valid(&self, manifest: &DataSetManifest) -> Result<bool> {
        let Some((low, high)) = manifest
            .pre_validation_properties
            .as_ref()
            .and_then(bene_id_range)
        else {
            warn!(
                manifest = %manifest.id,
                "Pre-validation properties lack a usable {}/{} range",
                PROPERTY_BENE_ID_START,
                PROPERTY_BENE_ID_END
            );
            return Ok(false);
        };

        let collides: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM ccw_beneficiary_ids WHERE bene_id BETWEEN $1 AND $2)",
        )
        .bind(low)
        .bind(high)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check beneficiary id range")?;

        info!(
            manifest = %manifest.id,
            low,
            high,
            collides,
            "Checked synthetic beneficiary id range"
        );
        Ok(!collides)
    }
}

/// The inclusive id range named by the properties, lowest first. Synthetic
/// ids are negative and often listed high to low.
pub fn bene_id_range(properties: &PreValidationProperties) -> Option<(i64, i64)> {
    let start: i64 = properties.get(PROPERTY_BENE_ID_START)?.trim().parse().ok()?;
    let end: i64 = properties.get(PROPERTY_BENE_ID_END)?.trim().parse().ok()?;
    Some((start.min(end), start.max(end)))
}
