//! BFD Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the BFD pipeline.
//!
//! # Overview
//!
//! - **Error Handling**: [`BfdError`] and the crate-wide [`Result`] alias
//! - **Logging**: tracing subscriber bootstrap driven by `LOG_*` variables
//! - **Hashing**: deterministic, peppered identifier hashing and the MBI hash cache
//!
//! # Example
//!
//! ```no_run
//! use bfd_common::hashing::{IdHashCache, IdHasher, IdHasherConfig, MbiCache};
//!
//! let hasher = IdHasher::new(IdHasherConfig::new(1000, "pepper"));
//! let cache = MbiCache::computed(hasher, 10_000);
//! let hash = cache.lookup("1EG4TE5MK73").unwrap();
//! assert_eq!(hash.len(), 64);
//! ```

pub mod error;
pub mod hashing;
pub mod logging;

// Re-export commonly used types
pub use error::{BfdError, Result};
