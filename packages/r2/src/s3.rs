//! Cloudflare R2 through the S3-compatible API.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};

use crate::{BlobClient, BlobError, BlobObject, REQUEST_TIMEOUT, require_env};

/// Default bucket for cache snapshots.
const DEFAULT_BUCKET: &str = "compliance-map-cache";

/// Maximum number of download attempts (initial + retries).
const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

/// Base delay between download retries (doubles each attempt).
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// R2 client for snapshot objects.
pub struct R2BlobClient {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl R2BlobClient {
    /// Creates a client from `CLOUDFLARE_ACCOUNT_ID`, `R2_ACCESS_KEY_ID`,
    /// `R2_SECRET_ACCESS_KEY`, and optionally `R2_BUCKET`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::MissingEnv`] if any required variable is unset.
    pub fn from_env() -> Result<Self, BlobError> {
        let account_id = require_env("CLOUDFLARE_ACCOUNT_ID")?;
        let access_key = require_env("R2_ACCESS_KEY_ID")?;
        let secret_key = require_env("R2_SECRET_ACCESS_KEY")?;
        let bucket = require_env("R2_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string());

        let endpoint = format!("https://{account_id}.r2.cloudflarestorage.com");
        let creds = Credentials::new(&access_key, &secret_key, None, None, "r2-env");

        let config = aws_sdk_s3::Config::builder()
            .endpoint_url(&endpoint)
            .region(Region::new("auto"))
            .credentials_provider(creds)
            .force_path_style(true)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(REQUEST_TIMEOUT)
                    .build(),
            )
            .build();

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket,
        })
    }

    /// Bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get_once(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobError::Download {
                key: key.to_string(),
                source: Box::new(e),
            })?;

        let bytes = output.body.collect().await.map_err(|e| BlobError::Download {
            key: key.to_string(),
            source: Box::new(e),
        })?;

        Ok(bytes.into_bytes().to_vec())
    }
}

#[async_trait]
impl BlobClient for R2BlobClient {
    fn name(&self) -> &'static str {
        "r2"
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), BlobError> {
        #[allow(clippy::cast_precision_loss)] // display-only MB value
        let mb = body.len() as f64 / 1_048_576.0;
        log::info!("Pushing s3://{}/{key} ({mb:.1} MB)", self.bucket);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| BlobError::Upload {
                key: key.to_string(),
                source: Box::new(e),
            })?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, BlobError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(|e| BlobError::List {
                prefix: prefix.to_string(),
                source: Box::new(e),
            })?;

            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    objects.push(BlobObject {
                        key: key.to_string(),
                        url: None,
                        size: obj.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                    });
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn get(&self, object: &BlobObject) -> Result<Vec<u8>, BlobError> {
        let mut attempt = 1;
        loop {
            match self.get_once(&object.key).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < MAX_DOWNLOAD_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                    log::warn!(
                        "{}: download attempt {attempt}/{MAX_DOWNLOAD_ATTEMPTS} failed ({e}), \
                         retrying in {delay:.1?}...",
                        object.key
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
