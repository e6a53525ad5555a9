use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::Region,
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::{config::StorageConfig, ObjectStore, ObjectSummary};

/// [`ObjectStore`] backed by one S3 bucket
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: &StorageConfig, bucket: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        debug!(
            "Initializing S3 client (region: {}, endpoint: {:?}, path style: {})",
            config.region, config.endpoint, config.path_style
        );

        let mut s3_config_builder = match config.static_credentials() {
            Some((access_key, secret_key)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "bfd-pipeline",
                )),
            None => {
                let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        s3_config_builder = s3_config_builder
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("S3 client initialized for bucket: {}", bucket);

        Ok(Self { client, bucket })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", self.bucket, prefix))?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0),
                })
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                },
                _ => break,
            }
        }

        debug!("Listed {} object(s) under s3://{}/{}", objects.len(), self.bucket, prefix);
        Ok(objects)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download from S3: {}", key))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);
        Ok(data)
    }

    #[instrument(skip(self, data), fields(bucket = %self.bucket, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("Failed to upload to S3: {}", key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn copy(&self, source_key: &str, dest_key: &str) -> Result<()> {
        let copy_source = format!("{}/{}", self.bucket, encode_copy_source(source_key));

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(dest_key)
            .send()
            .await
            .with_context(|| format!("Failed to copy S3 object {} to {}", source_key, dest_key))?;

        debug!("Copied s3://{}/{} to {}", self.bucket, source_key, dest_key);
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to delete from S3: {}", key))?;
        Ok(())
    }

    /// Streams the body to disk instead of buffering it; RIF files run to many GB.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn download_to(&self, key: &str, path: &Path) -> Result<u64> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download from S3: {}", key))?;

        let mut reader = response.body.into_async_read();
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .with_context(|| format!("Failed to stream s3://{}/{} to disk", self.bucket, key))?;
        file.sync_all().await?;

        debug!("Downloaded {} bytes from s3://{}/{} to {}", written, self.bucket, key, path.display());
        Ok(written)
    }
}

/// Percent-encode an object key for the `x-amz-copy-source` header.
/// Path separators stay literal.
fn encode_copy_source(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_copy_source() {
        assert_eq!(
            encode_copy_source("Incoming/2024-01-02T03:04:05Z/0_manifest.xml"),
            "Incoming/2024-01-02T03%3A04%3A05Z/0_manifest.xml"
        );
        assert_eq!(encode_copy_source("a b+c"), "a%20b%2Bc");
    }

    #[test]
    fn test_encode_copy_source_keeps_separators() {
        assert_eq!(
            encode_copy_source("Synthetic/Incoming/caf\u{e9}|1.rif"),
            "Synthetic/Incoming/caf%C3%A9%7C1.rif"
        );
        assert_eq!(encode_copy_source("a//b/"), "a//b/");
    }
}
