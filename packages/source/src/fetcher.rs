//! [`OriginFetcher`] implementation driven by a [`SourceDefinition`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use compliance_map_source_models::{FetchPath, RegionSummary};

use crate::arcgis::ArcGisQuery;
use crate::capacity::summarize;
use crate::echo::EchoQuery;
use crate::envirofacts::EnvirofactsQuery;
use crate::normalize::normalize_records;
use crate::source_def::{FetcherConfig, SourceDefinition};
use crate::{OriginFetcher, SourceError, arcgis, echo, envirofacts, nwis};

/// The single generic fetcher behind every configured source.
pub struct ConfiguredFetcher {
    definition: Arc<SourceDefinition>,
    client: reqwest::Client,
}

impl ConfiguredFetcher {
    /// Creates a fetcher sharing `client` with other sources.
    #[must_use]
    pub const fn new(definition: Arc<SourceDefinition>, client: reqwest::Client) -> Self {
        Self { definition, client }
    }

    /// Returns the source definition.
    #[must_use]
    pub fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    async fn fetch_raw(
        &self,
        region: &str,
    ) -> Result<(Vec<serde_json::Value>, FetchPath), SourceError> {
        match &self.definition.fetcher {
            FetcherConfig::Arcgis {
                query_url,
                region_field,
                where_clause,
                page_size,
                large_region_threshold,
                lite_fields,
            } => {
                arcgis::fetch_region(
                    &self.client,
                    &ArcGisQuery {
                        query_url,
                        region_field,
                        where_clause: where_clause.as_deref(),
                        page_size: *page_size,
                        large_region_threshold: *large_region_threshold,
                        lite_fields,
                    },
                    region,
                )
                .await
            }
            FetcherConfig::Envirofacts {
                base_url,
                table,
                region_column,
                page_size,
                large_region_threshold,
                join,
            } => {
                envirofacts::fetch_region(
                    &self.client,
                    &EnvirofactsQuery {
                        base_url,
                        table,
                        region_column,
                        page_size: *page_size,
                        large_region_threshold: *large_region_threshold,
                        join: join.as_ref(),
                    },
                    region,
                )
                .await
            }
            FetcherConfig::Echo {
                base_url,
                program,
                page_size,
                large_region_threshold,
                lite_columns,
            } => {
                echo::fetch_region(
                    &self.client,
                    &EchoQuery {
                        base_url,
                        program,
                        page_size: *page_size,
                        large_region_threshold: *large_region_threshold,
                        lite_columns: lite_columns.as_deref(),
                    },
                    region,
                )
                .await
            }
            FetcherConfig::NwisGroundwater { base_url, period } => {
                nwis::fetch_region(&self.client, base_url, period, region).await
            }
        }
    }
}

#[async_trait]
impl OriginFetcher for ConfiguredFetcher {
    fn source_id(&self) -> &str {
        self.definition.id()
    }

    async fn fetch_region(
        &self,
        region: &str,
        timeout: Duration,
    ) -> Result<RegionSummary, SourceError> {
        let id = self.definition.id();
        let start = Instant::now();

        let (records, path) = tokio::time::timeout(timeout, self.fetch_raw(region))
            .await
            .map_err(|_| SourceError::Timeout {
                region: region.to_string(),
                timeout,
            })??;

        let entities = normalize_records(&self.definition, region, &records);
        let summary = summarize(
            region,
            entities,
            self.definition.max_entities_per_region,
            path,
        );

        log::info!(
            "{id}/{region}: {} entities ({} flagged, {} kept) via {} path in {:.1?}",
            summary.total,
            summary.flagged(),
            summary.entities.len(),
            summary.path,
            start.elapsed(),
        );
        Ok(summary)
    }
}
