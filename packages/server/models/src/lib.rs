#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the compliance map server.
//!
//! These types are serialized to JSON for the REST API. They are kept
//! separate from the cache types so the API contract can evolve on its
//! own.

use std::collections::BTreeMap;

use compliance_map_alerts::{Alert, Reading};
use compliance_map_cache::{CacheStatus, LocationGrade, LookupResult, grade_location};
use compliance_map_grid::GridCell;
use compliance_map_source_models::Entity;
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHealth {
    /// Whether the server is healthy.
    pub healthy: bool,
    /// Server version.
    pub version: String,
    /// Number of configured sources.
    pub sources: usize,
}

/// Error body.
#[derive(Debug, Serialize)]
pub struct ApiError {
    /// What went wrong.
    pub error: String,
}

impl ApiError {
    /// Creates an error body.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Query parameters for the lookup endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LookupParams {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

/// Outcome of a point lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiLookupStatus {
    /// The source has not finished its first build.
    Cold,
    /// The source is loaded but has nothing near the point.
    NoData,
    /// Entities were found.
    Found,
}

/// Point lookup response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLookup {
    /// Source id.
    pub source: String,
    /// Outcome.
    pub status: ApiLookupStatus,
    /// Entities grouped by kind.
    pub entities: GridCell,
    /// Location grade; absent while cold.
    pub grade: Option<LocationGrade>,
    /// Cache status at the time of the lookup.
    pub cache: CacheStatus,
}

impl ApiLookup {
    /// Builds the response from a lookup result and the cache status.
    #[must_use]
    pub fn new(result: LookupResult, cache: CacheStatus) -> Self {
        let (status, entities) = match result {
            LookupResult::Cold => (ApiLookupStatus::Cold, GridCell::default()),
            LookupResult::NoData => (ApiLookupStatus::NoData, GridCell::default()),
            LookupResult::Found(cell) => (ApiLookupStatus::Found, cell),
        };
        let grade = (status != ApiLookupStatus::Cold).then(|| grade_location(&entities));

        Self {
            source: cache.source.clone(),
            status,
            entities,
            grade,
            cache,
        }
    }
}

/// Bulk region response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRegion {
    /// Source id.
    pub source: String,
    /// Region code as requested.
    pub region: String,
    /// Whether the region failed in the last build.
    pub missing: bool,
    /// Entities fetched for the region.
    pub entities: Vec<Entity>,
}

/// Build trigger response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiBuildTriggered {
    /// Source id.
    pub source: String,
    /// `false` if a build was already running and was joined instead.
    pub started: bool,
    /// Cache status after the trigger.
    pub cache: CacheStatus,
}

/// Alert evaluation request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEvaluateRequest {
    /// Readings to check.
    pub readings: Vec<Reading>,
    /// Site id to display name.
    #[serde(default)]
    pub site_names: BTreeMap<String, String>,
    /// Site id to state code.
    #[serde(default)]
    pub site_states: BTreeMap<String, String>,
    /// Previously stored alerts to merge with the new ones.
    #[serde(default)]
    pub existing: Vec<Alert>,
}

/// Alert evaluation response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEvaluateResponse {
    /// Alerts fired by this batch.
    pub fired: Vec<Alert>,
    /// `existing` merged with `fired`, deduplicated and expired.
    pub merged: Vec<Alert>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_request_defaults_site_maps() {
        let request: ApiEvaluateRequest = serde_json::from_str(
            r#"{ "readings": [{ "siteId": "s1", "parameter": "ph", "value": 9.5 }] }"#,
        )
        .unwrap();
        assert_eq!(request.readings.len(), 1);
        assert!(request.site_names.is_empty());
        assert!(request.existing.is_empty());
    }

    #[test]
    fn lookup_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ApiLookupStatus::NoData).unwrap(),
            "no_data"
        );
    }
}
