//! EPA Envirofacts REST fetcher.
//!
//! Envirofacts exposes tables as path-encoded queries:
//! `{base}/{table}/{column}/{value}/JSON`, with `/COUNT/JSON` for a cheap
//! row count and `/rows/{first}:{last}/JSON` for inclusive row windows.
//! Large regions are paged by row window; small ones are one request.
//!
//! Several tables carry only identifiers. A configured [`JoinConfig`]
//! pulls a secondary table for the same region and joins names and
//! coordinates locally by key. If the secondary table is unavailable the
//! region still succeeds, with identifiers as names and no coordinates.

use std::collections::HashMap;

use compliance_map_source_models::FetchPath;

use crate::capacity::choose_path;
use crate::normalize::{GEOMETRY_LAT, GEOMETRY_LNG, JOINED_NAME, get_field, value_to_f64, value_to_string};
use crate::source_def::JoinConfig;
use crate::{SourceError, retry};

/// Configuration for one Envirofacts region fetch.
pub struct EnvirofactsQuery<'a> {
    /// Service root.
    pub base_url: &'a str,
    /// Primary table.
    pub table: &'a str,
    /// Column filtered by region code.
    pub region_column: &'a str,
    /// Rows per page on the large-region path.
    pub page_size: u64,
    /// Count above which rows are paged.
    pub large_region_threshold: u64,
    /// Optional secondary table.
    pub join: Option<&'a JoinConfig>,
}

/// Name and coordinates from a secondary table row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinedSite {
    /// Display name.
    pub name: Option<String>,
    /// Latitude.
    pub lat: Option<f64>,
    /// Longitude.
    pub lng: Option<f64>,
}

/// Builds `{base}/{table}/{col}/{val}/...` from ordered filters.
#[must_use]
pub fn table_url(base_url: &str, table: &str, filters: &[(&str, &str)]) -> String {
    let mut url = format!("{}/{table}", base_url.trim_end_matches('/'));
    for (column, value) in filters {
        url.push('/');
        url.push_str(column);
        url.push('/');
        url.push_str(value);
    }
    url
}

/// Fetches one region's rows, joining names and coordinates when
/// configured.
///
/// # Errors
///
/// Returns [`SourceError`] if the primary table request fails. Count request
/// and join failures are logged and tolerated.
pub async fn fetch_region(
    client: &reqwest::Client,
    query: &EnvirofactsQuery<'_>,
    region: &str,
) -> Result<(Vec<serde_json::Value>, FetchPath), SourceError> {
    let url = table_url(query.base_url, query.table, &[(query.region_column, region)]);

    let count = match retry::send_json(|| client.get(format!("{url}/COUNT/JSON")))
        .await
        .and_then(|body| parse_count(&body))
    {
        Ok(count) => Some(count),
        Err(e) => {
            log::warn!("{region}: {} count request failed ({e}), using bulk query", query.table);
            None
        }
    };

    let path = choose_path(count, query.large_region_threshold);
    let mut records = match (path, count) {
        (FetchPath::LargeRegion, Some(count)) => {
            log::info!(
                "{region}: {count} {} rows exceeds {}, paging",
                query.table,
                query.large_region_threshold
            );
            fetch_rows(client, &url, query.page_size, count).await?
        }
        _ => {
            let body = retry::send_json(|| client.get(format!("{url}/JSON"))).await?;
            as_records(body)?
        }
    };

    if let Some(join) = query.join {
        match fetch_join(client, query.base_url, join, region).await {
            Ok(sites) => {
                let matched = apply_join(&mut records, join, &sites);
                log::debug!(
                    "{region}: joined {matched}/{} rows from {}",
                    records.len(),
                    join.table
                );
            }
            Err(e) => {
                log::warn!(
                    "{region}: join table {} unavailable ({e}), using identifiers as names",
                    join.table
                );
            }
        }
    }

    Ok((records, path))
}

/// Pages `/rows/{first}:{last}/JSON` until `count` rows or an empty page.
async fn fetch_rows(
    client: &reqwest::Client,
    url: &str,
    page_size: u64,
    count: u64,
) -> Result<Vec<serde_json::Value>, SourceError> {
    let page_size = page_size.max(1);
    let mut records = Vec::new();
    let mut first: u64 = 0;

    while first < count {
        let last = first + page_size - 1;
        let body = retry::send_json(|| client.get(format!("{url}/rows/{first}:{last}/JSON"))).await?;
        let page = as_records(body)?;
        if page.is_empty() {
            break;
        }
        first += page.len() as u64;
        records.extend(page);
    }

    Ok(records)
}

async fn fetch_join(
    client: &reqwest::Client,
    base_url: &str,
    join: &JoinConfig,
    region: &str,
) -> Result<HashMap<String, JoinedSite>, SourceError> {
    let mut filters: Vec<(&str, &str)> = join
        .filters
        .iter()
        .map(|(column, value)| (column.as_str(), value.as_str()))
        .collect();
    filters.push((join.region_column.as_str(), region));

    let url = table_url(base_url, &join.table, &filters);
    let body = retry::send_json(|| client.get(format!("{url}/JSON"))).await?;
    Ok(index_join_rows(&as_records(body)?, join))
}

/// Reads `[{"TOTALQUERYRESULTS": n}]`.
///
/// # Errors
///
/// Returns [`SourceError::Normalization`] if the body has no count.
pub fn parse_count(body: &serde_json::Value) -> Result<u64, SourceError> {
    body.as_array()
        .and_then(|rows| rows.first())
        .and_then(|row| get_field(row, "TOTALQUERYRESULTS"))
        .and_then(value_to_f64)
        .filter(|n| *n >= 0.0)
        .map(count_from_f64)
        .ok_or_else(|| SourceError::normalization("COUNT response had no TOTALQUERYRESULTS"))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn count_from_f64(n: f64) -> u64 {
    n as u64
}

fn as_records(body: serde_json::Value) -> Result<Vec<serde_json::Value>, SourceError> {
    match body {
        serde_json::Value::Array(rows) => Ok(rows),
        other => {
            let message = get_field(&other, "error")
                .and_then(value_to_string)
                .unwrap_or_else(|| "expected a JSON array".to_string());
            Err(SourceError::normalization(format!("Envirofacts: {message}")))
        }
    }
}

/// Indexes secondary rows by key. The first row per key wins.
#[must_use]
pub fn index_join_rows(
    rows: &[serde_json::Value],
    join: &JoinConfig,
) -> HashMap<String, JoinedSite> {
    let mut sites = HashMap::new();
    for row in rows {
        let Some(key) = get_field(row, join.secondary_key()).and_then(value_to_string) else {
            continue;
        };
        sites.entry(key).or_insert_with(|| JoinedSite {
            name: get_field(row, &join.name_field).and_then(value_to_string),
            lat: join
                .lat_field
                .as_deref()
                .and_then(|f| get_field(row, f))
                .and_then(value_to_f64),
            lng: join
                .lng_field
                .as_deref()
                .and_then(|f| get_field(row, f))
                .and_then(value_to_f64),
        });
    }
    sites
}

/// Copies joined names and coordinates onto matching primary records.
/// Returns how many records matched.
pub fn apply_join(
    records: &mut [serde_json::Value],
    join: &JoinConfig,
    sites: &HashMap<String, JoinedSite>,
) -> usize {
    let mut matched = 0;
    for record in records.iter_mut() {
        let Some(site) = get_field(record, &join.key)
            .and_then(value_to_string)
            .and_then(|key| sites.get(&key))
        else {
            continue;
        };
        let Some(obj) = record.as_object_mut() else {
            continue;
        };
        matched += 1;
        if let Some(name) = &site.name {
            obj.insert(JOINED_NAME.to_string(), name.clone().into());
        }
        if let (Some(lat), Some(lng)) = (site.lat, site.lng) {
            obj.insert(GEOMETRY_LAT.to_string(), lat.into());
            obj.insert(GEOMETRY_LNG.to_string(), lng.into());
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn join() -> JoinConfig {
        JoinConfig {
            table: "FRS_PROGRAM_FACILITY".to_string(),
            region_column: "STATE_CODE".to_string(),
            filters: BTreeMap::from([("PGM_SYS_ACRNM".to_string(), "NPDES".to_string())]),
            key: "EXTERNAL_PERMIT_NMBR".to_string(),
            join_key: Some("PGM_SYS_ID".to_string()),
            name_field: "PRIMARY_NAME".to_string(),
            lat_field: Some("LATITUDE83".to_string()),
            lng_field: Some("LONGITUDE83".to_string()),
        }
    }

    #[test]
    fn builds_path_encoded_urls() {
        assert_eq!(
            table_url(
                "https://data.epa.gov/efservice/",
                "WATER_SYSTEM",
                &[("STATE_CODE", "MD")]
            ),
            "https://data.epa.gov/efservice/WATER_SYSTEM/STATE_CODE/MD"
        );
    }

    #[test]
    fn parses_count_as_number_or_string() {
        assert_eq!(
            parse_count(&serde_json::json!([{"TOTALQUERYRESULTS": 12345}])).unwrap(),
            12345
        );
        assert_eq!(
            parse_count(&serde_json::json!([{"totalqueryresults": "77"}])).unwrap(),
            77
        );
        assert!(parse_count(&serde_json::json!([])).is_err());
    }

    #[test]
    fn non_array_body_is_an_error() {
        let err = as_records(serde_json::json!({"error": "table not found"})).unwrap_err();
        assert!(err.to_string().contains("table not found"));
    }

    #[test]
    fn joins_names_and_coordinates_by_key() {
        let join = join();
        let sites = index_join_rows(
            &[
                serde_json::json!({"PGM_SYS_ID": "MD0000001", "PRIMARY_NAME": "Plant A",
                                   "LATITUDE83": "39.2", "LONGITUDE83": "-76.6"}),
                serde_json::json!({"PGM_SYS_ID": "MD0000001", "PRIMARY_NAME": "Duplicate"}),
                serde_json::json!({"PGM_SYS_ID": "MD0000002", "PRIMARY_NAME": "Plant B"}),
            ],
            &join,
        );
        assert_eq!(sites.len(), 2);
        assert_eq!(sites["MD0000001"].name.as_deref(), Some("Plant A"));

        let mut records = vec![
            serde_json::json!({"EXTERNAL_PERMIT_NMBR": "MD0000001"}),
            serde_json::json!({"EXTERNAL_PERMIT_NMBR": "MD0000002"}),
            serde_json::json!({"EXTERNAL_PERMIT_NMBR": "MD0000003"}),
        ];
        assert_eq!(apply_join(&mut records, &join, &sites), 2);
        assert_eq!(records[0]["_joined_name"], "Plant A");
        assert_eq!(records[0]["_lat"], 39.2);
        assert_eq!(records[1]["_joined_name"], "Plant B");
        assert!(records[1].get("_lat").is_none());
        assert!(records[2].get("_joined_name").is_none());
    }
}
