//! USGS NWIS groundwater-level fetcher.
//!
//! The `gwlevels` service returns one time series per site and parameter.
//! Each well is reduced to one record: its latest depth to water, the
//! first depth in the period, and the change between them. A positive
//! change means the water table dropped.

use std::collections::BTreeMap;

use compliance_map_source_models::FetchPath;

use crate::normalize::value_to_f64;
use crate::{SourceError, retry};

#[derive(Default)]
struct WellSeries {
    name: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    observations: Vec<(String, f64)>,
}

/// Fetches and reduces one state's groundwater levels.
///
/// # Errors
///
/// Returns [`SourceError`] if the request fails or the payload has no
/// `value.timeSeries` array.
pub async fn fetch_region(
    client: &reqwest::Client,
    base_url: &str,
    period: &str,
    region: &str,
) -> Result<(Vec<serde_json::Value>, FetchPath), SourceError> {
    let url = format!("{}/gwlevels/", base_url.trim_end_matches('/'));
    let body = retry::send_json(|| {
        client.get(&url).query(&[
            ("format", "json"),
            ("stateCd", region),
            ("period", period),
            ("siteStatus", "all"),
        ])
    })
    .await?;

    Ok((reduce_series(&body)?, FetchPath::Standard))
}

/// Groups time series by site and reduces each to one well record.
///
/// # Errors
///
/// Returns [`SourceError::Normalization`] if the payload has no
/// `value.timeSeries` array.
pub fn reduce_series(body: &serde_json::Value) -> Result<Vec<serde_json::Value>, SourceError> {
    let series = body
        .get("value")
        .and_then(|v| v.get("timeSeries"))
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| SourceError::normalization("NWIS response had no value.timeSeries"))?;

    let mut wells: BTreeMap<String, WellSeries> = BTreeMap::new();

    for ts in series {
        let info = &ts["sourceInfo"];
        let Some(site_no) = info["siteCode"][0]["value"].as_str() else {
            continue;
        };
        let well = wells.entry(site_no.to_string()).or_default();
        if well.name.is_none() {
            well.name = info["siteName"].as_str().map(str::to_string);
        }
        let geo = &info["geoLocation"]["geogLocation"];
        well.lat = well.lat.or_else(|| value_to_f64(&geo["latitude"]));
        well.lng = well.lng.or_else(|| value_to_f64(&geo["longitude"]));

        let values = ts["values"][0]["value"].as_array().map_or(&[][..], Vec::as_slice);
        for obs in values {
            if let (Some(at), Some(level)) = (obs["dateTime"].as_str(), value_to_f64(&obs["value"])) {
                well.observations.push((at.to_string(), level));
            }
        }
    }

    Ok(wells
        .into_iter()
        .filter(|(_, well)| !well.observations.is_empty())
        .map(|(site_no, mut well)| {
            // ISO-8601 timestamps sort lexically.
            well.observations.sort_by(|a, b| a.0.cmp(&b.0));
            let (first_at, first) = well.observations[0].clone();
            let (latest_at, latest) = well.observations[well.observations.len() - 1].clone();
            serde_json::json!({
                "site_no": site_no,
                "station_nm": well.name,
                "dec_lat_va": well.lat,
                "dec_long_va": well.lng,
                "first_level": first,
                "first_at": first_at,
                "latest_level": latest,
                "latest_at": latest_at,
                "level_change": latest - first,
                "observations": well.observations.len(),
            })
        })
        .collect())
}
