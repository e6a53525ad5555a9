//! CCW RIF batch ingestion
//!
//! Data sets pushed by the Chronic Conditions Warehouse into S3 are discovered
//! through their manifests, loaded one at a time and retired to a done prefix.

pub mod job;
pub mod manifest;
pub mod prevalidate;
pub mod queue;
pub mod sink;

pub use job::CcwRifLoadJob;
pub use manifest::{DataSetManifest, DataSetManifestEntry, DataSetManifestId, RifFileType};
pub use queue::DataSetQueue;
pub use sink::{PgStagingRecordSink, RecordSink, RifFile, RifFilesEvent};
