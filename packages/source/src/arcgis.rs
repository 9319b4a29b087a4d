//! `ArcGIS` REST `query` fetcher.
//!
//! One region is one `where` clause against a `FeatureServer`/`MapServer`
//! layer. A `returnCountOnly` query decides the path: small regions are
//! served by a single standard query with full geometry; regions above the
//! configured threshold are paged with a reduced field list and
//! server-computed centroids, because the standard query times out or
//! truncates on them.

use compliance_map_source_models::FetchPath;

use crate::capacity::choose_path;
use crate::normalize::{GEOMETRY_LAT, GEOMETRY_LNG};
use crate::{SourceError, retry};

/// Configuration for one `ArcGIS` region fetch.
pub struct ArcGisQuery<'a> {
    /// Layer query URL.
    pub query_url: &'a str,
    /// Attribute holding the region code.
    pub region_field: &'a str,
    /// Extra clause ANDed with the region filter.
    pub where_clause: Option<&'a str>,
    /// Records per page on the large-region path.
    pub page_size: u64,
    /// Count above which the large-region path is used.
    pub large_region_threshold: u64,
    /// Fields requested on the large-region path (`*` when empty).
    pub lite_fields: &'a [String],
}

impl ArcGisQuery<'_> {
    fn region_where(&self, region: &str) -> String {
        let region = region.replace('\'', "''");
        match self.where_clause {
            Some(extra) => format!("{} = '{region}' AND ({extra})", self.region_field),
            None => format!("{} = '{region}'", self.region_field),
        }
    }

    fn lite_out_fields(&self) -> String {
        if self.lite_fields.is_empty() {
            "*".to_string()
        } else {
            self.lite_fields.join(",")
        }
    }
}

/// Fetches one region's features as flattened attribute records.
///
/// A failed count request is not fatal; the standard path is used instead.
///
/// # Errors
///
/// Returns [`SourceError`] if the feature query fails or the service
/// reports an error payload.
pub async fn fetch_region(
    client: &reqwest::Client,
    query: &ArcGisQuery<'_>,
    region: &str,
) -> Result<(Vec<serde_json::Value>, FetchPath), SourceError> {
    let where_clause = query.region_where(region);

    // ── Count ─────────────────────────────────────────────────────────
    let count = match query_count(client, query.query_url, &where_clause).await {
        Ok(count) => Some(count),
        Err(e) => {
            log::warn!("{region}: count request failed ({e}), using standard query");
            None
        }
    };

    let path = choose_path(count, query.large_region_threshold);
    let records = match path {
        FetchPath::LargeRegion => {
            log::info!(
                "{region}: {} features exceeds {}, paging with centroids",
                count.unwrap_or_default(),
                query.large_region_threshold
            );
            fetch_paged(client, query, &where_clause, region).await?
        }
        FetchPath::Standard => fetch_standard(client, query.query_url, &where_clause).await?,
    };
    Ok((records, path))
}

/// Issues a `returnCountOnly=true` query.
async fn query_count(
    client: &reqwest::Client,
    query_url: &str,
    where_clause: &str,
) -> Result<u64, SourceError> {
    let body = retry::send_json(|| {
        client.get(query_url).query(&[
            ("where", where_clause),
            ("returnCountOnly", "true"),
            ("f", "json"),
        ])
    })
    .await?;
    check_error(&body)?;

    body.get("count")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| SourceError::normalization("count query returned no count"))
}

/// Single bulk query with full geometry.
async fn fetch_standard(
    client: &reqwest::Client,
    query_url: &str,
    where_clause: &str,
) -> Result<Vec<serde_json::Value>, SourceError> {
    let body = retry::send_json(|| {
        client.get(query_url).query(&[
            ("where", where_clause),
            ("outFields", "*"),
            ("returnGeometry", "true"),
            ("outSR", "4326"),
            ("f", "json"),
        ])
    })
    .await?;
    check_error(&body)?;

    Ok(features(&body).iter().filter_map(flatten_feature).collect())
}

/// Paginated, field-limited query with centroids instead of geometry.
async fn fetch_paged(
    client: &reqwest::Client,
    query: &ArcGisQuery<'_>,
    where_clause: &str,
    region: &str,
) -> Result<Vec<serde_json::Value>, SourceError> {
    let out_fields = query.lite_out_fields();
    let page_size = query.page_size.to_string();
    let mut records = Vec::new();
    let mut offset: u64 = 0;

    loop {
        let offset_str = offset.to_string();
        let body = retry::send_json(|| {
            client.get(query.query_url).query(&[
                ("where", where_clause),
                ("outFields", out_fields.as_str()),
                ("returnGeometry", "false"),
                ("returnCentroid", "true"),
                ("outSR", "4326"),
                ("resultOffset", offset_str.as_str()),
                ("resultRecordCount", page_size.as_str()),
                ("f", "json"),
            ])
        })
        .await?;
        check_error(&body)?;

        let page = features(&body);
        if page.is_empty() {
            break;
        }
        offset += page.len() as u64;
        records.extend(page.iter().filter_map(flatten_feature));
        log::debug!("{region}: {offset} features fetched");

        // `exceededTransferLimit` is the canonical continuation signal; a
        // short page is not, because servers cap at their own maxRecordCount.
        let exceeded = body
            .get("exceededTransferLimit")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !exceeded {
            break;
        }
    }

    Ok(records)
}

fn features(body: &serde_json::Value) -> &[serde_json::Value] {
    body.get("features")
        .and_then(serde_json::Value::as_array)
        .map_or(&[][..], Vec::as_slice)
}

/// `ArcGIS` reports many failures as HTTP 200 with an `error` object.
fn check_error(body: &serde_json::Value) -> Result<(), SourceError> {
    match body.get("error") {
        Some(err) => {
            let message = err
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error");
            let code = err.get("code").and_then(serde_json::Value::as_i64).unwrap_or(0);
            Err(SourceError::normalization(format!(
                "ArcGIS error {code}: {message}"
            )))
        }
        None => Ok(()),
    }
}

/// Flattens `{ attributes, geometry | centroid }` into the attribute
/// object, adding a representative point under [`GEOMETRY_LAT`] /
/// [`GEOMETRY_LNG`].
///
/// Point geometry is used as-is, then an explicit centroid, then the mean
/// of polygon ring or polyline path vertices.
#[must_use]
pub fn flatten_feature(feature: &serde_json::Value) -> Option<serde_json::Value> {
    let mut record = feature.get("attributes")?.clone();
    let point = feature
        .get("geometry")
        .and_then(point_of)
        .or_else(|| feature.get("centroid").and_then(point_of))
        .or_else(|| feature.get("geometry").and_then(vertex_mean));

    if let Some((x, y)) = point
        && let Some(obj) = record.as_object_mut()
    {
        obj.insert(GEOMETRY_LNG.to_string(), x.into());
        obj.insert(GEOMETRY_LAT.to_string(), y.into());
    }
    Some(record)
}

fn point_of(geometry: &serde_json::Value) -> Option<(f64, f64)> {
    let x = geometry.get("x")?.as_f64()?;
    let y = geometry.get("y")?.as_f64()?;
    Some((x, y))
}

fn vertex_mean(geometry: &serde_json::Value) -> Option<(f64, f64)> {
    let parts = geometry
        .get("rings")
        .or_else(|| geometry.get("paths"))?
        .as_array()?;

    let (mut sx, mut sy, mut n) = (0.0, 0.0, 0_u32);
    for vertex in parts.iter().filter_map(serde_json::Value::as_array).flatten() {
        if let Some([x, y, ..]) = vertex.as_array().map(Vec::as_slice)
            && let (Some(x), Some(y)) = (x.as_f64(), y.as_f64())
        {
            sx += x;
            sy += y;
            n += 1;
        }
    }

    (n > 0).then(|| (sx / f64::from(n), sy / f64::from(n)))
}
