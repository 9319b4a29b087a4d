#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Remote blob storage for cache snapshots.
//!
//! The cache keeps one JSON document per source under a fixed key. Two
//! remote stores are supported behind the [`BlobClient`] trait:
//!
//! - [`R2BlobClient`]: Cloudflare R2 through the S3-compatible API.
//! - [`HttpBlobClient`]: a bearer-token HTTP blob store with `PUT` by
//!   pathname and a JSON listing endpoint.
//!
//! # Environment Variables
//!
//! | Variable | Required | Description |
//! |---|---|---|
//! | `BLOB_READ_WRITE_TOKEN` | For HTTP | Bearer token; selects [`HttpBlobClient`] |
//! | `BLOB_API_URL` | No | HTTP blob API root |
//! | `CLOUDFLARE_ACCOUNT_ID` | For R2 | Cloudflare account ID (builds the R2 endpoint) |
//! | `R2_ACCESS_KEY_ID` | For R2 | S3-compatible access key for R2 |
//! | `R2_SECRET_ACCESS_KEY` | For R2 | S3-compatible secret key for R2 |
//! | `R2_BUCKET` | No | Bucket name (default `compliance-map-cache`) |

mod http;
#[cfg(any(test, feature = "test-utils"))]
mod memory;
mod s3;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpBlobClient;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryBlobClient;
pub use s3::R2BlobClient;

/// Upper bound on any single remote request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors that can occur during blob operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },

    /// HTTP transport failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("{key}: blob store returned {status}")]
    Status {
        /// Object key or prefix.
        key: String,
        /// HTTP status code.
        status: u16,
    },

    /// Upload failed.
    #[error("Failed to upload {key}: {source}")]
    Upload {
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Download failed.
    #[error("Failed to download {key}: {source}")]
    Download {
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Listing failed.
    #[error("Failed to list {prefix}: {source}")]
    List {
        /// Key prefix.
        prefix: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// A stored object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobObject {
    /// Object key (pathname).
    pub key: String,
    /// Public download URL, when the store issues one.
    pub url: Option<String>,
    /// Size in bytes.
    pub size: u64,
}

/// A remote object store.
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// Short name for logs (`"r2"`, `"http"`, ...).
    fn name(&self) -> &'static str;

    /// Writes `body` at `key`, overwriting any existing object.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError`] if the upload fails.
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), BlobError>;

    /// Lists objects whose key starts with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError`] if the listing fails.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, BlobError>;

    /// Downloads a listed object.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError`] if the download fails.
    async fn get(&self, object: &BlobObject) -> Result<Vec<u8>, BlobError>;
}

/// Picks the remote store from the environment.
///
/// `BLOB_READ_WRITE_TOKEN` selects [`HttpBlobClient`]; otherwise complete R2
/// credentials select [`R2BlobClient`]. Returns `None` when neither is
/// configured.
#[must_use]
pub fn from_env() -> Option<Arc<dyn BlobClient>> {
    match HttpBlobClient::from_env() {
        Ok(client) => {
            log::info!("Remote snapshot store: HTTP blob API");
            return Some(Arc::new(client));
        }
        Err(e) => log::debug!("HTTP blob store not configured: {e}"),
    }

    match R2BlobClient::from_env() {
        Ok(client) => {
            log::info!("Remote snapshot store: R2 bucket {}", client.bucket());
            Some(Arc::new(client))
        }
        Err(e) => {
            if std::env::var_os("CLOUDFLARE_ACCOUNT_ID").is_some() {
                log::warn!("R2 partially configured, remote tier disabled: {e}");
            } else {
                log::info!("No remote snapshot store configured");
            }
            None
        }
    }
}

/// Reads a required environment variable.
pub(crate) fn require_env(name: &str) -> Result<String, BlobError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BlobError::MissingEnv {
            name: name.to_string(),
        })
}
