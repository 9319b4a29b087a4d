#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Origin fetchers for environmental-compliance data providers.
//!
//! Each upstream provider is described by a TOML [`source_def::SourceDefinition`]
//! and served through the [`OriginFetcher`] trait. A fetcher pulls one
//! region's records, normalizes them into [`Entity`] values, and caps the
//! result while keeping every flagged entity it can.
//!
//! [`Entity`]: compliance_map_source_models::Entity

pub mod arcgis;
pub mod capacity;
pub mod echo;
pub mod envirofacts;
pub mod fetcher;
pub mod normalize;
pub mod nwis;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod source_def;

use std::time::Duration;

use async_trait::async_trait;
use compliance_map_source_models::RegionSummary;

/// `User-Agent` sent with every upstream request.
pub const USER_AGENT: &str = concat!("compliance-map/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while fetching or normalizing a region.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The region fetch did not finish within its timeout.
    #[error("{region}: timed out after {timeout:?}")]
    Timeout {
        /// Region that timed out.
        region: String,
        /// Timeout that was exceeded.
        timeout: Duration,
    },

    /// Upstream returned something we could not interpret.
    #[error("Normalization error: {message}")]
    Normalization {
        /// Description of what went wrong.
        message: String,
    },

    /// Source definition is unusable.
    #[error("Config error: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },
}

impl SourceError {
    /// Convenience constructor for [`SourceError::Normalization`].
    pub fn normalization(message: impl Into<String>) -> Self {
        Self::Normalization {
            message: message.into(),
        }
    }

    /// Returns `true` if the failure was a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A per-source adapter that retrieves and normalizes one region at a time.
///
/// Implementations must bound their own network I/O by `timeout` and
/// report every failure as a [`SourceError`]; nothing may panic across
/// this boundary.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Returns the identifier of the source this fetcher serves.
    fn source_id(&self) -> &str;

    /// Fetches, normalizes, and caps one region's entities.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the upstream call fails, times out, or
    /// returns an unusable payload.
    async fn fetch_region(
        &self,
        region: &str,
        timeout: Duration,
    ) -> Result<RegionSummary, SourceError>;
}

/// Builds the shared HTTP client used by every fetcher.
///
/// # Errors
///
/// Returns [`SourceError::Http`] if the TLS backend cannot be initialized.
pub fn http_client() -> Result<reqwest::Client, SourceError> {
    Ok(reqwest::Client::builder().user_agent(USER_AGENT).build()?)
}
