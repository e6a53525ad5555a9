//! Pipeline error types
//!
//! Job bodies and collaborator seams return `anyhow::Result`; the variants here
//! are the failures that the scheduler and the process entry point classify
//! with `downcast_ref`.

use thiserror::Error;

/// Result type alias for typed pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Pipeline error types
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Smoke test failed for job(s): {}", .0.join(", "))]
    SmokeTestFailed(Vec<String>),

    #[error("Invalid manifest '{key}': {reason}")]
    ManifestParse { key: String, reason: String },

    #[error(
        "Out-of-order sequence number for {claim_type}: received {received} after {previous}"
    )]
    SequenceOutOfOrder {
        claim_type: String,
        previous: i64,
        received: i64,
    },

    #[error("Failed to transform claim '{claim_id}': {reason}")]
    Transform { claim_id: String, reason: String },

    #[error(
        "Stream for {claim_type} failed after {processed} message(s), {committed} committed: {message}"
    )]
    StreamTransport {
        claim_type: String,
        processed: u64,
        committed: u64,
        message: String,
    },
}
