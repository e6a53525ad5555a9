//! Change feed clients
//!
//! The RDA API streams claim changes in sequence-number order. A call names a
//! claim type and a starting sequence number; the feed replays from that
//! number inclusive and then keeps the stream open as new changes arrive.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{
    future,
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use tokio_util::{
    codec::{FramedRead, LinesCodec},
    io::StreamReader,
};
use tracing::{debug, instrument};

/// Longest line accepted from the feed
const MAX_LINE_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClaimType {
    Fiss,
    Mcs,
}

impl ClaimType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimType::Fiss => "FISS",
            ClaimType::Mcs => "MCS",
        }
    }

    fn path_segment(&self) -> &'static str {
        match self {
            ClaimType::Fiss => "fiss",
            ClaimType::Mcs => "mcs",
        }
    }
}

impl fmt::Display for ClaimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fiss" => Ok(ClaimType::Fiss),
            "mcs" => Ok(ClaimType::Mcs),
            _ => Err(anyhow!("Invalid claim type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Upsert,
}

/// The claim carried by a change. Fields beyond the identifiers are kept as
/// JSON and stored as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RdaClaimPayload {
    pub claim_id: String,
    #[serde(default)]
    pub mbi: Option<String>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// One message of the change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimChange {
    pub sequence_number: i64,
    pub claim_type: ClaimType,
    pub change_type: ChangeType,
    pub claim: RdaClaimPayload,
}

pub type ClaimStream = BoxStream<'static, Result<ClaimChange>>;

#[async_trait]
pub trait ClaimStreamSource: Send + Sync {
    /// Version of the API serving the feed
    async fn call_version_service(&self) -> Result<String>;

    /// Open the feed for `claim_type` starting at `starting_sequence_number`
    /// (inclusive). Dropping the stream cancels the call.
    async fn call_service(
        &self,
        claim_type: ClaimType,
        starting_sequence_number: i64,
    ) -> Result<ClaimStream>;
}

/// Change feed over HTTP, one JSON document per line
#[derive(Clone)]
pub struct HttpClaimStreamSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

impl HttpClaimStreamSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("bfd-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ClaimStreamSource for HttpClaimStreamSource {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn call_version_service(&self) -> Result<String> {
        let response: VersionResponse = self
            .client
            .get(format!("{}/v1/version", self.base_url))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("Failed to call RDA version service")?
            .error_for_status()
            .context("RDA version service returned an error")?
            .json()
            .await
            .context("Failed to parse RDA version response")?;
        Ok(response.version)
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn call_service(
        &self,
        claim_type: ClaimType,
        starting_sequence_number: i64,
    ) -> Result<ClaimStream> {
        let url = format!("{}/v1/{}/changes", self.base_url, claim_type.path_segment());
        debug!(%url, starting_sequence_number, "Opening change feed");

        let response = self
            .client
            .get(&url)
            .query(&[("startingSequenceNumber", starting_sequence_number)])
            .send()
            .await
            .with_context(|| format!("Failed to open {} change feed", claim_type))?
            .error_for_status()
            .with_context(|| format!("{} change feed returned an error", claim_type))?;

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );

        let changes = lines
            .try_filter(|line| future::ready(!line.trim().is_empty()))
            .map(|line| {
                let line = line.context("Change feed transport error")?;
                serde_json::from_str::<ClaimChange>(&line)
                    .with_context(|| format!("Malformed change message: {}", truncate(&line, 200)))
            });

        Ok(changes.boxed())
    }
}

/// Replays a fixed list of changes. Used by tests and direct loads.
#[derive(Debug, Clone, Default)]
pub struct InProcessClaimSource {
    changes: Vec<ClaimChange>,
    fail_after: Option<usize>,
    hold_open: bool,
    version: String,
}

impl InProcessClaimSource {
    pub fn new(changes: Vec<ClaimChange>) -> Self {
        Self {
            changes,
            fail_after: None,
            hold_open: false,
            version: "in-process".to_string(),
        }
    }

    /// End every call with a transport error after `count` messages
    pub fn with_failure_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Keep the stream open after the last change instead of ending it, the
    /// way a live feed does
    pub fn holding_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[async_trait]
impl ClaimStreamSource for InProcessClaimSource {
    async fn call_version_service(&self) -> Result<String> {
        Ok(self.version.clone())
    }

    async fn call_service(
        &self,
        claim_type: ClaimType,
        starting_sequence_number: i64,
    ) -> Result<ClaimStream> {
        let mut changes: Vec<ClaimChange> = self
            .changes
            .iter()
            .filter(|c| c.claim_type == claim_type && c.sequence_number >= starting_sequence_number)
            .cloned()
            .collect();
        changes.sort_by_key(|c| c.sequence_number);

        let messages: BoxStream<'static, Result<ClaimChange>> = match self.fail_after {
            Some(count) => stream::iter(changes.into_iter().take(count).map(Ok))
                .chain(stream::once(future::ready(Err(anyhow!(
                    "UNAVAILABLE: change feed connection reset"
                )))))
                .boxed(),
            None => stream::iter(changes.into_iter().map(Ok)).boxed(),
        };

        if self.hold_open && self.fail_after.is_none() {
            Ok(messages.chain(stream::pending()).boxed())
        } else {
            Ok(messages)
        }
    }
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}
