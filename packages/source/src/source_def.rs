//! Config-driven source definition.
//!
//! [`SourceDefinition`] captures everything unique about an upstream
//! provider in a serializable config struct: which API to call, how to
//! page through it, how to map its fields onto [`Entity`] values, how long
//! a built snapshot stays fresh, and how the build should be paced.
//!
//! [`Entity`]: compliance_map_source_models::Entity

use std::collections::BTreeMap;
use std::time::Duration;

use compliance_map_source_models::{Bucket, EntityKind, regions};
use serde::Deserialize;

use crate::SourceError;
use crate::normalize::{BucketRule, FieldMapping};

/// Default per-region entity cap.
pub const DEFAULT_MAX_ENTITIES_PER_REGION: usize = 2000;

// ── Top-level source definition ──────────────────────────────────────────

/// A complete, config-driven source definition.
///
/// Loaded from TOML files embedded at compile time.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDefinition {
    /// Unique identifier (e.g., `"attains"`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Kind of entity this source produces.
    pub kind: EntityKind,
    /// How long a built snapshot stays fresh.
    pub ttl_hours: u64,
    /// Regions to fetch. Defaults to every state and territory.
    #[serde(default)]
    pub regions: Option<Vec<String>>,
    /// Regions fetched first (high data volume or importance).
    #[serde(default)]
    pub priority_regions: Vec<String>,
    /// Entity cap per region; flagged entities are kept first.
    #[serde(default = "default_max_entities")]
    pub max_entities_per_region: usize,
    /// How to fetch raw data from the upstream API.
    pub fetcher: FetcherConfig,
    /// Field name mappings for normalization.
    pub fields: FieldMapping,
    /// Ordered bucket rules; first match wins.
    #[serde(default)]
    pub buckets: Vec<BucketRule>,
    /// Bucket for records no rule matches.
    #[serde(default = "default_bucket")]
    pub default_bucket: Bucket,
    /// Optional build pacing overrides.
    #[serde(default)]
    pub build: BuildTuning,
}

const fn default_max_entities() -> usize {
    DEFAULT_MAX_ENTITIES_PER_REGION
}

const fn default_bucket() -> Bucket {
    Bucket::Good
}

const fn default_page_size() -> u64 {
    1000
}

fn default_period() -> String {
    "P1Y".to_string()
}

// ── Fetcher config ───────────────────────────────────────────────────────

/// How to fetch raw data from the source API.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FetcherConfig {
    /// `ArcGIS` REST `query` endpoint, one region per `where` clause.
    Arcgis {
        /// Layer query URL (ending in `/query`).
        query_url: String,
        /// Attribute holding the region code.
        region_field: String,
        /// Extra `where` clause ANDed with the region filter.
        #[serde(default)]
        where_clause: Option<String>,
        /// Records per page on the large-region path.
        #[serde(default = "default_page_size")]
        page_size: u64,
        /// Count above which the paginated path is used.
        large_region_threshold: u64,
        /// Fields requested on the large-region path.
        #[serde(default)]
        lite_fields: Vec<String>,
    },
    /// EPA Envirofacts REST tables (`/{table}/{column}/{value}/JSON`).
    Envirofacts {
        /// Service root (e.g., `https://data.epa.gov/efservice`).
        base_url: String,
        /// Primary table.
        table: String,
        /// Column filtered by region code.
        region_column: String,
        /// Rows per page on the large-region path.
        #[serde(default = "default_page_size")]
        page_size: u64,
        /// Count above which the paginated path is used.
        large_region_threshold: u64,
        /// Secondary table supplying names and coordinates.
        #[serde(default)]
        join: Option<JoinConfig>,
    },
    /// EPA ECHO facility search (`get_facilities` then `get_qid`).
    Echo {
        /// Service root (e.g., `https://echodata.epa.gov/echo`).
        base_url: String,
        /// Program service prefix (`cwa`, `sdw`, `air`, `rcra`).
        #[serde(default = "default_echo_program")]
        program: String,
        /// Rows per page on the large-region path.
        #[serde(default = "default_page_size")]
        page_size: u64,
        /// Row count above which the paginated path is used.
        large_region_threshold: u64,
        /// Column ids requested on the large-region path.
        #[serde(default)]
        lite_columns: Option<String>,
    },
    /// USGS NWIS groundwater levels, reduced to one record per well.
    NwisGroundwater {
        /// Service root (e.g., `https://waterservices.usgs.gov/nwis`).
        base_url: String,
        /// ISO-8601 lookback period.
        #[serde(default = "default_period")]
        period: String,
    },
}

fn default_echo_program() -> String {
    "cwa".to_string()
}

impl FetcherConfig {
    /// Returns the short fetcher type name, for logs.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Arcgis { .. } => "arcgis",
            Self::Envirofacts { .. } => "envirofacts",
            Self::Echo { .. } => "echo",
            Self::NwisGroundwater { .. } => "nwis_groundwater",
        }
    }
}

/// Secondary Envirofacts table joined locally by key.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinConfig {
    /// Secondary table name.
    pub table: String,
    /// Column of the secondary table filtered by region code.
    pub region_column: String,
    /// Extra `column = value` path filters.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    /// Key field on the primary record.
    pub key: String,
    /// Key field on the secondary record. Defaults to [`Self::key`].
    #[serde(default)]
    pub join_key: Option<String>,
    /// Name field on the secondary record.
    pub name_field: String,
    /// Latitude field on the secondary record.
    #[serde(default)]
    pub lat_field: Option<String>,
    /// Longitude field on the secondary record.
    #[serde(default)]
    pub lng_field: Option<String>,
}

impl JoinConfig {
    /// Key field to read from secondary records.
    #[must_use]
    pub fn secondary_key(&self) -> &str {
        self.join_key.as_deref().unwrap_or(&self.key)
    }
}

// ── Build tuning ─────────────────────────────────────────────────────────

/// Optional per-source overrides for build pacing. Unset values fall back
/// to the orchestrator defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildTuning {
    /// Concurrent fetches per batch.
    pub batch_size: Option<usize>,
    /// Delay between batches.
    pub batch_delay_secs: Option<u64>,
    /// Per-fetch timeout on the main pass.
    pub main_timeout_secs: Option<u64>,
    /// Per-fetch timeout on the retry pass.
    pub retry_timeout_secs: Option<u64>,
    /// Delay between sequential retries.
    pub retry_delay_secs: Option<u64>,
}

// ── Accessors ────────────────────────────────────────────────────────────

impl SourceDefinition {
    /// Returns the unique source identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the human-readable source name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }

    /// Regions this source covers, in configured order.
    #[must_use]
    pub fn region_codes(&self) -> Vec<String> {
        self.regions.clone().unwrap_or_else(regions::all_codes)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] if the cap is zero, a region code is
    /// unknown, or a priority region is not in the region list.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.max_entities_per_region == 0 {
            return Err(self.config_error("max_entities_per_region must be positive"));
        }
        if self.fields.id.is_empty() {
            return Err(self.config_error("fields.id must name at least one field"));
        }

        let codes = self.region_codes();
        if let Some(unknown) = codes.iter().find(|c| regions::by_code(c).is_none()) {
            return Err(self.config_error(&format!("unknown region {unknown}")));
        }
        if let Some(stray) = self
            .priority_regions
            .iter()
            .find(|p| !codes.iter().any(|c| c == *p))
        {
            return Err(self.config_error(&format!("priority region {stray} is not fetched")));
        }
        Ok(())
    }

    fn config_error(&self, message: &str) -> SourceError {
        SourceError::Config {
            message: format!("{}: {message}", self.id),
        }
    }
}

/// Parses a [`SourceDefinition`] from a TOML string.
///
/// # Errors
///
/// Returns an error if the TOML is malformed or missing required fields.
pub fn parse_source_toml(toml_str: &str) -> Result<SourceDefinition, String> {
    toml::de::from_str(toml_str).map_err(|e| e.to_string())
}
