//! CCW data set manifests
//!
//! Every data set lives under a timestamp directory in the bucket:
//!
//! ```text
//! Incoming/2024-01-02T03:04:05Z/0_manifest.xml
//! Incoming/2024-01-02T03:04:05Z/beneficiaries.rif
//! Incoming/2024-01-02T03:04:05Z/carrier.rif
//! ```
//!
//! Once loaded, the manifest and its files move to the matching done (or, for
//! failed synthetic pre-validation, failed) prefix under the same timestamp.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::error::{PipelineError, PipelineResult};

/// Prefix that pending data sets are pulled from.
pub const S3_PREFIX_PENDING_DATA_SETS: &str = "Incoming";

/// Second pending prefix, used to keep synthetic data sets apart. Not
/// functionally different from [`S3_PREFIX_PENDING_DATA_SETS`].
pub const S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS: &str = "Synthetic/Incoming";

/// Prefix that completed data sets are moved to.
pub const S3_PREFIX_COMPLETED_DATA_SETS: &str = "Done";

/// Prefix that completed synthetic data sets are moved to.
pub const S3_PREFIX_COMPLETED_SYNTHETIC_DATA_SETS: &str = "Synthetic/Done";

/// Prefix that synthetic data sets failing pre-validation are moved to.
pub const S3_PREFIX_FAILED_SYNTHETIC_DATA_SETS: &str = "Synthetic/Failed";

/// RIF record layouts that may appear in a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RifFileType {
    Beneficiary,
    BeneficiaryHistory,
    MedicareBeneficiaryIdHistory,
    Pde,
    Carrier,
    Inpatient,
    Outpatient,
    Snf,
    Hospice,
    Hha,
    Dme,
}

impl RifFileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RifFileType::Beneficiary => "BENEFICIARY",
            RifFileType::BeneficiaryHistory => "BENEFICIARY_HISTORY",
            RifFileType::MedicareBeneficiaryIdHistory => "MEDICARE_BENEFICIARY_ID_HISTORY",
            RifFileType::Pde => "PDE",
            RifFileType::Carrier => "CARRIER",
            RifFileType::Inpatient => "INPATIENT",
            RifFileType::Outpatient => "OUTPATIENT",
            RifFileType::Snf => "SNF",
            RifFileType::Hospice => "HOSPICE",
            RifFileType::Hha => "HHA",
            RifFileType::Dme => "DME",
        }
    }
}

impl fmt::Display for RifFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RifFileType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let file_type = match s.trim().to_uppercase().as_str() {
            "BENEFICIARY" => RifFileType::Beneficiary,
            "BENEFICIARY_HISTORY" => RifFileType::BeneficiaryHistory,
            "MEDICARE_BENEFICIARY_ID_HISTORY" => RifFileType::MedicareBeneficiaryIdHistory,
            "PDE" => RifFileType::Pde,
            "CARRIER" => RifFileType::Carrier,
            "INPATIENT" => RifFileType::Inpatient,
            "OUTPATIENT" => RifFileType::Outpatient,
            "SNF" => RifFileType::Snf,
            "HOSPICE" => RifFileType::Hospice,
            "HHA" => RifFileType::Hha,
            "DME" => RifFileType::Dme,
            other => anyhow::bail!("Unknown RIF file type: {}", other),
        };
        Ok(file_type)
    }
}

/// Identity of a data set manifest, ordered oldest first with the sequence
/// number breaking ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataSetManifestId {
    pub timestamp: DateTime<Utc>,
    pub sequence_id: u32,
}

impl fmt::Display for DataSetManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            self.sequence_id
        )
    }
}

/// A manifest object key, split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestKey {
    pub key: String,
    /// `Incoming`, `Synthetic/Done`, ...
    pub location: String,
    /// Timestamp directory exactly as it appears in the key
    pub timestamp_text: String,
    pub id: DataSetManifestId,
}

/// Compiled manifest key patterns
#[derive(Debug, Clone)]
pub struct ManifestKeyPatterns {
    pending: Regex,
    completed: Regex,
}

impl ManifestKeyPatterns {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pending: Regex::new(&format!(
                r"^({}|{})/(.*)/([0-9]+)_manifest\.xml$",
                regex::escape(S3_PREFIX_PENDING_DATA_SETS),
                regex::escape(S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS)
            ))?,
            completed: Regex::new(&format!(
                r"^({}|{})/(.*)/([0-9]+)_manifest\.xml$",
                regex::escape(S3_PREFIX_COMPLETED_DATA_SETS),
                regex::escape(S3_PREFIX_COMPLETED_SYNTHETIC_DATA_SETS)
            ))?,
        })
    }

    /// Parse a key under one of the incoming prefixes
    pub fn parse_pending(&self, key: &str) -> Option<ManifestKey> {
        Self::parse_with(&self.pending, key)
    }

    /// Parse a key under one of the done prefixes
    pub fn parse_completed(&self, key: &str) -> Option<ManifestKey> {
        Self::parse_with(&self.completed, key)
    }

    fn parse_with(pattern: &Regex, key: &str) -> Option<ManifestKey> {
        let captures = pattern.captures(key)?;
        let location = captures.get(1)?.as_str();
        let timestamp_text = captures.get(2)?.as_str();
        let sequence_id = captures.get(3)?.as_str().parse().ok()?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp_text)
            .ok()?
            .with_timezone(&Utc);

        Some(ManifestKey {
            key: key.to_string(),
            location: location.to_string(),
            timestamp_text: timestamp_text.to_string(),
            id: DataSetManifestId {
                timestamp,
                sequence_id,
            },
        })
    }
}

/// One file of a data set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetManifestEntry {
    pub name: String,
    pub file_type: RifFileType,
}

impl DataSetManifestEntry {
    pub fn new(name: impl Into<String>, file_type: RifFileType) -> Self {
        Self {
            name: name.into(),
            file_type,
        }
    }
}

/// Name/value pairs a data set can carry for checks before loading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreValidationProperties(BTreeMap<String, String>);

impl PreValidationProperties {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A parsed data set manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetManifest {
    pub id: DataSetManifestId,
    pub timestamp_text: String,
    pub synthetic_data: bool,
    pub entries: Vec<DataSetManifestEntry>,
    pub pre_validation_properties: Option<PreValidationProperties>,
    incoming_location: String,
    done_location: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct ManifestXml {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    #[serde(rename = "@sequenceId", default)]
    sequence_id: Option<u32>,
    #[serde(rename = "@syntheticData", default)]
    synthetic_data: bool,
    #[serde(rename = "entry", default)]
    entries: Vec<EntryXml>,
    #[serde(
        rename = "preValidationProperties",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pre_validation_properties: Option<PropertiesXml>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EntryXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@type")]
    file_type: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct PropertiesXml {
    #[serde(rename = "property", default)]
    properties: Vec<PropertyXml>,
}

#[derive(Debug, Deserialize, Serialize)]
struct PropertyXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@value")]
    value: String,
}

impl DataSetManifest {
    /// Build a manifest in `incoming_location` (one of the pending prefixes)
    pub fn new(
        incoming_location: &str,
        timestamp_text: impl Into<String>,
        sequence_id: u32,
        synthetic_data: bool,
        entries: Vec<DataSetManifestEntry>,
    ) -> PipelineResult<Self> {
        let timestamp_text = timestamp_text.into();
        let timestamp = DateTime::parse_from_rfc3339(&timestamp_text)
            .map_err(|e| PipelineError::ManifestParse {
                key: timestamp_text.clone(),
                reason: format!("invalid timestamp: {}", e),
            })?
            .with_timezone(&Utc);

        Ok(Self {
            id: DataSetManifestId {
                timestamp,
                sequence_id,
            },
            timestamp_text,
            synthetic_data,
            entries,
            pre_validation_properties: None,
            incoming_location: incoming_location.to_string(),
            done_location: done_location_for(incoming_location).to_string(),
        })
    }

    /// Parse manifest XML found at `key`. Identity and location come from the key.
    pub fn parse(key: &ManifestKey, xml: &str) -> PipelineResult<Self> {
        let parse_error = |reason: String| PipelineError::ManifestParse {
            key: key.key.clone(),
            reason,
        };

        let raw: ManifestXml = quick_xml::de::from_str(xml)
            .map_err(|e| parse_error(format!("malformed XML: {}", e)))?;

        DateTime::parse_from_rfc3339(raw.timestamp.trim())
            .map_err(|e| parse_error(format!("invalid timestamp '{}': {}", raw.timestamp, e)))?;
        if let Some(sequence_id) = raw.sequence_id {
            if sequence_id != key.id.sequence_id {
                tracing::warn!(
                    key = %key.key,
                    "Manifest sequenceId {} does not match its key; using the key",
                    sequence_id
                );
            }
        }

        if raw.entries.is_empty() {
            return Err(parse_error("manifest lists no entries".to_string()));
        }

        let entries = raw
            .entries
            .into_iter()
            .map(|entry| {
                let file_type = entry
                    .file_type
                    .parse()
                    .map_err(|e: anyhow::Error| parse_error(e.to_string()))?;
                Ok(DataSetManifestEntry::new(entry.name, file_type))
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        let pre_validation_properties = raw.pre_validation_properties.map(|props| {
            let mut parsed = PreValidationProperties::default();
            for property in props.properties {
                parsed.insert(property.name, property.value);
            }
            parsed
        });

        Ok(Self {
            id: key.id,
            timestamp_text: key.timestamp_text.clone(),
            synthetic_data: raw.synthetic_data,
            entries,
            pre_validation_properties,
            incoming_location: key.location.clone(),
            done_location: done_location_for(&key.location).to_string(),
        })
    }

    pub fn with_pre_validation_properties(mut self, properties: PreValidationProperties) -> Self {
        self.pre_validation_properties = Some(properties);
        self
    }

    /// Render as manifest XML
    pub fn to_xml(&self) -> Result<String> {
        let raw = ManifestXml {
            timestamp: self.timestamp_text.clone(),
            sequence_id: Some(self.id.sequence_id),
            synthetic_data: self.synthetic_data,
            entries: self
                .entries
                .iter()
                .map(|entry| EntryXml {
                    name: entry.name.clone(),
                    file_type: entry.file_type.to_string(),
                })
                .collect(),
            pre_validation_properties: self.pre_validation_properties.as_ref().map(|props| {
                PropertiesXml {
                    properties: props
                        .iter()
                        .map(|(name, value)| PropertyXml {
                            name: name.to_string(),
                            value: value.to_string(),
                        })
                        .collect(),
                }
            }),
        };

        let body = quick_xml::se::to_string_with_root("dataSetManifest", &raw)
            .with_context(|| format!("Failed to serialize manifest {}", self.id))?;
        Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}\n", body))
    }

    pub fn incoming_location(&self) -> &str {
        &self.incoming_location
    }

    pub fn done_location(&self) -> &str {
        &self.done_location
    }

    /// Send this data set to the failed prefix instead of the done prefix
    pub fn redirect_to_failed(&mut self) {
        self.done_location = S3_PREFIX_FAILED_SYNTHETIC_DATA_SETS.to_string();
    }

    /// `Incoming/<timestamp>/`
    pub fn incoming_data_set_prefix(&self) -> String {
        format!("{}/{}/", self.incoming_location, self.timestamp_text)
    }

    pub fn manifest_key_incoming(&self) -> String {
        format!("{}{}_manifest.xml", self.incoming_data_set_prefix(), self.id.sequence_id)
    }

    pub fn manifest_key_done(&self) -> String {
        format!(
            "{}/{}/{}_manifest.xml",
            self.done_location, self.timestamp_text, self.id.sequence_id
        )
    }

    pub fn entry_key_incoming(&self, entry: &DataSetManifestEntry) -> String {
        format!("{}{}", self.incoming_data_set_prefix(), entry.name)
    }

    pub fn entry_key_done(&self, entry: &DataSetManifestEntry) -> String {
        format!("{}/{}/{}", self.done_location, self.timestamp_text, entry.name)
    }
}

impl fmt::Display for DataSetManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DataSetManifest [{}, {} entries, synthetic: {}]",
            self.manifest_key_incoming(),
            self.entries.len(),
            self.synthetic_data
        )
    }
}

fn done_location_for(incoming_location: &str) -> &'static str {
    if incoming_location == S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS {
        S3_PREFIX_COMPLETED_SYNTHETIC_DATA_SETS
    } else {
        S3_PREFIX_COMPLETED_DATA_SETS
    }
}
