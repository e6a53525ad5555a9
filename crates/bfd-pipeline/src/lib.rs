//! BFD Pipeline Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads Medicare claims data into the BFD database from two sources.
//!
//! # Overview
//!
//! - **CCW**: batch data sets pushed into S3 by the Chronic Conditions
//!   Warehouse, described by XML manifests and loaded one data set at a time
//! - **RDA**: a sequenced change feed of FISS and MCS claims, consumed in
//!   batches and committed together with a per-claim-type checkpoint
//! - **Scheduler**: runs each configured job on its own interval, never
//!   overlapping a job with itself, and stops cleanly on SIGINT/SIGTERM
//!
//! # Architecture
//!
//! Both loaders are [`pipeline::PipelineJob`]s. A run of a job is one bounded
//! unit of work: one data set, or one call of the change feed. Runs are not
//! interruptible; stopping the [`pipeline::PipelineManager`] only prevents
//! the next run.
//!
//! The loaders reach the outside world through small traits:
//! [`storage::ObjectStore`], [`ccw::RecordSink`], [`ccw::prevalidate::PreValidator`],
//! [`rda::ClaimStreamSource`] and [`rda::ClaimSink`]. Each has a Postgres, S3
//! or HTTP implementation and an in-memory one for tests.
//!
//! # Example
//!
//! ```no_run
//! use bfd_pipeline::{app, config::AppConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_env()?;
//!     let pool = app::connect_database(&config.database).await?;
//!     let jobs = app::build_jobs(&config, &pool).await?;
//!     app::run_jobs(config.scheduler.clone(), jobs, app::shutdown_signal()).await
//! }
//! ```

pub mod app;
pub mod ccw;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod rda;
pub mod storage;

// Re-export commonly used types
pub use error::{PipelineError, PipelineResult};
