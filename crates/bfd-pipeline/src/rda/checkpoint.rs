//! Stream progress

use serde::{Deserialize, Serialize};

use super::source::ClaimType;

/// Last sequence number committed for one claim type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    pub claim_type: ClaimType,
    pub sequence_number: i64,
}

/// Where the next call of the feed should start.
///
/// With a checkpoint the feed restarts at the checkpoint itself; the
/// replayed message is skipped by the consumer. Without one, the configured
/// start (or the beginning of the feed) is used.
pub fn starting_sequence_number(checkpoint: Option<i64>, configured_start: Option<i64>) -> i64 {
    checkpoint.or(configured_start).unwrap_or(0)
}

/// True for messages at or before the checkpoint, which were committed by an
/// earlier run.
pub fn already_committed(checkpoint: Option<i64>, sequence_number: i64) -> bool {
    checkpoint.is_some_and(|committed| sequence_number <= committed)
}
