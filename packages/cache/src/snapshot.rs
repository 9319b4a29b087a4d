//! The unit of atomic replacement: one source's grid plus build metadata.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use compliance_map_grid::GridIndex;
use compliance_map_source_models::{FetchPath, RegionSummary};
use serde::{Deserialize, Serialize};

/// Per-region counts from the fetch that produced the region's data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionStats {
    /// Entities normalized before capping.
    pub total: u64,
    /// Entities kept after capping.
    pub kept: u64,
    /// Flagged entities before capping.
    pub flagged: u64,
    /// Whether capping dropped anything.
    pub truncated: bool,
    /// Query path used.
    pub path: FetchPath,
}

impl From<&RegionSummary> for RegionStats {
    fn from(summary: &RegionSummary) -> Self {
        Self {
            total: summary.total,
            kept: summary.entities.len() as u64,
            flagged: summary.flagged(),
            truncated: summary.truncated,
            path: summary.path,
        }
    }
}

/// Build metadata stored alongside the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    /// Source id.
    pub source: String,
    /// When the build that produced this snapshot finished.
    pub built_at: DateTime<Utc>,
    /// Regions present in the grid, in worklist order.
    pub loaded_regions: Vec<String>,
    /// Regions that failed both passes of the last build.
    pub missing_regions: Vec<String>,
    /// Regions the source covers.
    pub total_regions: usize,
    /// Entities in the grid, located or not.
    pub entity_count: usize,
    /// Entities placed in a cell.
    pub located_count: usize,
    /// Occupied cells.
    pub cell_count: usize,
    /// Counts per loaded region.
    #[serde(default)]
    pub region_stats: BTreeMap<String, RegionStats>,
    /// Consecutive failed builds per region. Cleared when the region loads.
    #[serde(default)]
    pub region_failures: BTreeMap<String, u32>,
}

/// An immutable `{ meta, grid }` pair for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Build metadata.
    pub meta: SnapshotMeta,
    /// Spatial index.
    pub grid: GridIndex,
}

impl CacheSnapshot {
    /// Returns `true` while `now - built_at` is within `ttl`.
    #[must_use]
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(ttl)
            .map_or(true, |ttl| now.signed_duration_since(self.meta.built_at) <= ttl)
    }

    /// Returns `true` if no region is missing.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.meta.missing_regions.is_empty()
    }

    /// Serializes to the on-disk and remote JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses the on-disk and remote JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if `bytes` is not a snapshot.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{entity, snapshot};

    #[test]
    fn freshness_follows_ttl() {
        let snap = snapshot("attains", vec![entity("a", "MD", 38.9, -77.0)], &["MD"], &[]);
        let ttl = Duration::from_secs(3600);
        let built = snap.meta.built_at;
        assert!(snap.is_fresh(ttl, built + chrono::Duration::minutes(59)));
        assert!(!snap.is_fresh(ttl, built + chrono::Duration::minutes(61)));
    }

    #[test]
    fn json_form_has_meta_and_grid() {
        let snap = snapshot("sdwis", vec![entity("a", "MD", 38.9, -77.0)], &["MD"], &["VA"]);
        let json: serde_json::Value = serde_json::from_slice(&snap.to_json().unwrap()).unwrap();
        assert_eq!(json["meta"]["source"], "sdwis");
        assert_eq!(json["meta"]["missingRegions"][0], "VA");
        assert!(json["grid"]["cells"].is_object());
        assert_eq!(CacheSnapshot::from_json(&snap.to_json().unwrap()).unwrap(), snap);
        assert!(!snap.is_complete());
    }

    #[test]
    fn corrupt_json_is_an_error() {
        assert!(CacheSnapshot::from_json(b"{\"meta\":").is_err());
    }
}
