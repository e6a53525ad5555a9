//! RDA stream ingestion
//!
//! Claim changes from the RDA API are consumed per claim type, transformed,
//! and committed in batches alongside a per-claim-type checkpoint.

pub mod checkpoint;
pub mod job;
pub mod sink;
pub mod source;
pub mod transform;

pub use checkpoint::StreamCheckpoint;
pub use job::RdaLoadJob;
pub use sink::{ClaimSink, InMemoryClaimSink, PgClaimSink};
pub use source::{
    ChangeType, ClaimChange, ClaimStreamSource, ClaimType, HttpClaimStreamSource,
    InProcessClaimSource, RdaClaimPayload,
};
pub use transform::{ClaimTransformer, RdaClaim};
