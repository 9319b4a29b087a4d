#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Normalized compliance entity format shared by every origin fetcher.
//!
//! Every upstream provider (assessment registries, permit systems,
//! drinking-water systems, groundwater networks, facility registries)
//! produces [`Entity`] records bucketed into a [`Bucket`], grouped per
//! region into a [`RegionSummary`].

pub mod regions;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Classification used for filtering and capacity capping.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Bucket {
    /// Water body listed as impaired (303(d) / category 4-5).
    Impaired,
    /// Permit or system with an open violation.
    Violation,
    /// Not in violation but trending badly (declining wells, expiring
    /// permits, significant noncompliance history).
    Watch,
    /// Assessed and meeting standards.
    Good,
    /// No assessment available.
    Unassessed,
}

impl Bucket {
    /// Returns `true` for buckets that must survive capacity capping.
    #[must_use]
    pub const fn is_flagged(self) -> bool {
        matches!(self, Self::Impaired | Self::Violation | Self::Watch)
    }
}

/// The kind of thing an entity describes. One grid cell holds one list per
/// kind.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    /// ATTAINS assessment unit (stream reach, lake, estuary segment).
    AssessmentUnit,
    /// NPDES discharge permit.
    Permit,
    /// Public drinking-water system.
    WaterSystem,
    /// Groundwater monitoring well.
    Well,
    /// Regulated facility from a compliance registry.
    Facility,
}

/// A normalized fact about a location.
///
/// Entities are produced once by a fetcher and replaced wholesale on the
/// next build of their source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Upstream identifier, unique within a source.
    pub id: String,
    /// Display name. Falls back to the identifier when unknown.
    pub name: String,
    /// Region (state code) the entity was fetched for.
    pub region: String,
    /// What the entity describes.
    pub kind: EntityKind,
    /// Latitude (WGS84). `None` when the origin has no coordinates.
    pub lat: Option<f64>,
    /// Longitude (WGS84). `None` when the origin has no coordinates.
    pub lng: Option<f64>,
    /// Filter classification.
    pub bucket: Bucket,
    /// Source-specific summary fields requested by the source config.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Entity {
    /// Returns the coordinate pair when both halves are present and finite.
    #[must_use]
    pub fn coords(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() => Some((lat, lng)),
            _ => None,
        }
    }

    /// Returns `true` if the entity's bucket is flagged.
    #[must_use]
    pub const fn is_flagged(&self) -> bool {
        self.bucket.is_flagged()
    }
}

/// Which query path produced a region's data.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FetchPath {
    /// Single bulk request against the standard endpoint.
    #[default]
    Standard,
    /// Paginated, field-limited requests after a record count exceeded the
    /// large-region threshold.
    LargeRegion,
}

/// One region's worth of normalized data for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSummary {
    /// Region code.
    pub region: String,
    /// Number of entities normalized before capping.
    pub total: u64,
    /// Counts by bucket, computed before capping.
    pub counts: BTreeMap<Bucket, u64>,
    /// Entities retained after capping.
    pub entities: Vec<Entity>,
    /// Whether capping dropped any entities.
    pub truncated: bool,
    /// Query path used.
    pub path: FetchPath,
}

impl RegionSummary {
    /// Number of flagged entities before capping.
    #[must_use]
    pub fn flagged(&self) -> u64 {
        self.counts
            .iter()
            .filter(|(bucket, _)| bucket.is_flagged())
            .map(|(_, count)| *count)
            .sum()
    }
}
