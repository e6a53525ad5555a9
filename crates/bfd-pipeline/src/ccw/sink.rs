//! Hand-off of downloaded data sets to the record loader

use anyhow::{Context, Result};
use async_trait::async_trait;
use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use futures::StreamExt;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio::io::AsyncRead;
use tracing::{info, instrument};

use super::manifest::{DataSetManifestEntry, DataSetManifestId, RifFileType};
use crate::storage::task_manager::{DownloadHandle, DownloadedFile};

/// Column that carries the beneficiary id in RIF headers
const BENE_ID_COLUMN: &str = "BENE_ID";

/// RIF files are pipe-delimited
const RIF_DELIMITER: u8 = b'|';

/// Rows per INSERT statement
const DEFAULT_CHUNK_SIZE: usize = 1000;

/// One file of a data set, possibly still downloading
#[derive(Debug, Clone)]
pub struct RifFile {
    pub entry: DataSetManifestEntry,
    pub handle: DownloadHandle,
}

/// Every file of one data set, handed to the sink as a single unit
#[derive(Debug, Clone)]
pub struct RifFilesEvent {
    pub manifest_id: DataSetManifestId,
    pub synthetic_data: bool,
    pub files: Vec<RifFile>,
}

/// Loads data sets. Returns once the whole data set has been loaded.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn process(&self, event: &RifFilesEvent) -> Result<()>;
}

/// Stages RIF records in Postgres, one row per record, each stored as a
/// `{column: value}` object built from the file's header.
///
/// Rows are keyed by (data set, file, record number) and inserted with
/// `ON CONFLICT DO NOTHING`, so reloading a data set after a crash does not
/// duplicate anything.
#[derive(Clone)]
pub struct PgStagingRecordSink {
    pool: PgPool,
    chunk_size: usize,
}

impl PgStagingRecordSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    #[instrument(skip_all, fields(manifest = %event.manifest_id, file = %file.entry.name))]
    async fn load_file(
        &self,
        event: &RifFilesEvent,
        file: &RifFile,
        downloaded: &DownloadedFile,
    ) -> Result<u64> {
        let key = StagingKey::new(event, &file.entry)?;
        let input = tokio::fs::File::open(&downloaded.path)
            .await
            .with_context(|| format!("Failed to open {}", downloaded.path.display()))?;
        let mut reader = rif_reader(input);

        let headers = reader
            .headers()
            .await
            .with_context(|| format!("Failed to read RIF header of {}", file.entry.name))?
            .clone();
        if headers.is_empty() {
            info!("Empty RIF file; nothing to load");
            return Ok(0);
        }
        let bene_id_index = if is_beneficiary_file(file.entry.file_type) {
            bene_id_column(&headers)
        } else {
            None
        };

        let mut tx = self.pool.begin().await?;
        let mut chunk: Vec<(i64, serde_json::Value)> = Vec::with_capacity(self.chunk_size);
        let mut bene_ids: Vec<i64> = Vec::new();
        let mut record_number: i64 = 0;
        let mut staged: u64 = 0;

        let mut records = reader.records();
        while let Some(record) = records.next().await {
            record_number += 1;
            let record = record.with_context(|| {
                format!("Malformed RIF record {} in {}", record_number, file.entry.name)
            })?;
            if let Some(id) = bene_id_index.and_then(|i| parse_bene_id(&record, i)) {
                bene_ids.push(id);
            }
            chunk.push((record_number, record_json(&headers, &record)));
            if chunk.len() >= self.chunk_size {
                staged += self.insert_chunk(&mut tx, &key, &chunk).await?;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            staged += self.insert_chunk(&mut tx, &key, &chunk).await?;
        }

        if !bene_ids.is_empty() {
            sqlx::query(
                "INSERT INTO ccw_beneficiary_ids (bene_id) \
                 SELECT * FROM UNNEST($1::BIGINT[]) ON CONFLICT DO NOTHING",
            )
            .bind(&bene_ids)
            .execute(&mut *tx)
            .await
            .context("Failed to record beneficiary ids")?;
        }

        tx.commit().await?;

        info!(records = record_number, staged, "Loaded RIF file");
        Ok(staged)
    }

    async fn insert_chunk(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        key: &StagingKey<'_>,
        chunk: &[(i64, serde_json::Value)],
    ) -> Result<u64> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO ccw_staged_records \
             (data_set_timestamp, data_set_sequence, file_name, file_type, record_number, record, synthetic) ",
        );
        builder.push_values(chunk, |mut row, (record_number, record)| {
            row.push_bind(key.timestamp)
                .push_bind(key.sequence)
                .push_bind(key.file_name)
                .push_bind(key.file_type)
                .push_bind(*record_number)
                .push_bind(record.clone())
                .push_bind(key.synthetic);
        });
        builder.push(" ON CONFLICT DO NOTHING");

        let result = builder
            .build()
            .execute(&mut **tx)
            .await
            .context("Failed to stage RIF records")?;
        Ok(result.rows_affected())
    }
}

/// Columns shared by every staged row of one file
struct StagingKey<'a> {
    timestamp: chrono::DateTime<chrono::Utc>,
    sequence: i32,
    file_name: &'a str,
    file_type: &'static str,
    synthetic: bool,
}

impl<'a> StagingKey<'a> {
    fn new(event: &RifFilesEvent, entry: &'a DataSetManifestEntry) -> Result<Self> {
        let sequence = i32::try_from(event.manifest_id.sequence_id).with_context(|| {
            format!(
                "Data set sequence id {} does not fit the staging table",
                event.manifest_id.sequence_id
            )
        })?;
        Ok(Self {
            timestamp: event.manifest_id.timestamp,
            sequence,
            file_name: &entry.name,
            file_type: entry.file_type.as_str(),
            synthetic: event.synthetic_data,
        })
    }
}

#[async_trait]
impl RecordSink for PgStagingRecordSink {
    async fn process(&self, event: &RifFilesEvent) -> Result<()> {
        for file in &event.files {
            let downloaded = file.handle.wait().await?;
            self.load_file(event, file, &downloaded).await?;
        }
        Ok(())
    }
}

/// Reader for pipe-delimited RIF content with a header row. Every record
/// must have as many fields as the header.
fn rif_reader<R>(input: R) -> AsyncReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    AsyncReaderBuilder::new()
        .delimiter(RIF_DELIMITER)
        .has_headers(true)
        .flexible(false)
        .create_reader(input)
}

/// Position of the beneficiary id column in a RIF header
fn bene_id_column(headers: &StringRecord) -> Option<usize> {
    headers
        .iter()
        .position(|column| column.trim().eq_ignore_ascii_case(BENE_ID_COLUMN))
}

fn parse_bene_id(record: &StringRecord, index: usize) -> Option<i64> {
    record.get(index)?.trim().parse().ok()
}

/// A record as a `{column: value}` object
fn record_json(headers: &StringRecord, record: &StringRecord) -> serde_json::Value {
    headers
        .iter()
        .zip(record.iter())
        .map(|(column, value)| (column.to_string(), serde_json::Value::from(value)))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

/// Whether records of this type introduce beneficiaries
fn is_beneficiary_file(file_type: RifFileType) -> bool {
    matches!(
        file_type,
        RifFileType::Beneficiary | RifFileType::BeneficiaryHistory
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn read_all(data: &str) -> (StringRecord, Vec<csv_async::Result<StringRecord>>) {
        let mut reader = rif_reader(data.as_bytes());
        let headers = reader.headers().await.unwrap().clone();
        let records = reader.records().collect().await;
        (headers, records)
    }

    #[test]
    fn test_bene_id_column_lookup() {
        assert_eq!(
            bene_id_column(&StringRecord::from(vec!["DML_IND", "BENE_ID", "STATE_CODE"])),
            Some(1)
        );
        assert_eq!(bene_id_column(&StringRecord::from(vec!["DML_IND", "CLM_ID"])), None);
    }

    #[test]
    fn test_parse_bene_id() {
        let record = StringRecord::from(vec!["INSERT", "-19990000000001", "01"]);
        assert_eq!(parse_bene_id(&record, 1), Some(-19990000000001));
        assert_eq!(parse_bene_id(&StringRecord::from(vec!["INSERT", "", "01"]), 1), None);
        assert_eq!(parse_bene_id(&StringRecord::from(vec!["INSERT"]), 1), None);
    }

    #[tokio::test]
    async fn test_quoted_delimiter_keeps_columns_aligned() {
        let (headers, records) = read_all(
            "DML_IND|BENE_SRNM_NAME|BENE_ID\nINSERT|\"SMITH|JONES\"|-19990000000001\n",
        )
        .await;
        let index = bene_id_column(&headers).unwrap();
        let record = records.into_iter().next().unwrap().unwrap();

        assert_eq!(parse_bene_id(&record, index), Some(-19990000000001));
        let json = record_json(&headers, &record);
        assert_eq!(json["BENE_SRNM_NAME"], "SMITH|JONES");
        assert_eq!(json["DML_IND"], "INSERT");
    }

    #[tokio::test]
    async fn test_record_with_wrong_column_count_is_an_error() {
        let (_, records) = read_all("DML_IND|BENE_ID\nINSERT|1\nINSERT|2|extra\n").await;

        assert_eq!(records.len(), 2);
        assert!(records[0].is_ok());
        assert!(records[1].is_err());
    }

    #[tokio::test]
    async fn test_empty_file_has_no_header() {
        let (headers, records) = read_all("").await;
        assert!(headers.is_empty());
        assert!(records.is_empty());
    }

    #[test]
    fn test_staging_key_rejects_sequence_beyond_column_range() {
        let event = |sequence_id| RifFilesEvent {
            manifest_id: DataSetManifestId {
                timestamp: "2024-05-01T00:00:00Z".parse().unwrap(),
                sequence_id,
            },
            synthetic_data: true,
            files: Vec::new(),
        };
        let entry = DataSetManifestEntry::new("carrier.rif", RifFileType::Carrier);

        let key = StagingKey::new(&event(7), &entry).unwrap();
        assert_eq!(key.sequence, 7);
        assert_eq!(key.file_type, "CARRIER");
        assert!(key.synthetic);

        let err = StagingKey::new(&event(u32::MAX), &entry).err().unwrap();
        assert!(err.to_string().contains("4294967295"));
    }

    #[test]
    fn test_is_beneficiary_file() {
        assert!(is_beneficiary_file(RifFileType::Beneficiary));
        assert!(!is_beneficiary_file(RifFileType::Carrier));
    }
}
