//! EPA ECHO facility-search fetcher.
//!
//! ECHO searches are two-step: `{program}_rest_services.get_facilities`
//! runs the query and returns a `QueryID` plus `QueryRows`, then
//! `get_qid` serves the rows page by page. The row count from the first
//! step is the large-region check: above the threshold the pages are
//! requested with a reduced column list.

use compliance_map_source_models::FetchPath;

use crate::capacity::choose_path;
use crate::normalize::{get_field, value_to_f64, value_to_string};
use crate::{SourceError, retry};

/// Upper bound on pages per region, in case `QueryRows` is wrong.
const MAX_PAGES: u64 = 200;

/// Configuration for one ECHO region fetch.
pub struct EchoQuery<'a> {
    /// Service root.
    pub base_url: &'a str,
    /// Program service prefix (`cwa`, `sdw`, ...).
    pub program: &'a str,
    /// Rows per page.
    pub page_size: u64,
    /// Row count above which the reduced-column path is used.
    pub large_region_threshold: u64,
    /// Column ids for the reduced-column path.
    pub lite_columns: Option<&'a str>,
}

/// Result of the `get_facilities` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoSearch {
    /// Query handle for `get_qid`.
    pub query_id: String,
    /// Total matching rows.
    pub rows: u64,
}

impl EchoQuery<'_> {
    fn service_url(&self, method: &str) -> String {
        format!(
            "{}/{}_rest_services.{method}",
            self.base_url.trim_end_matches('/'),
            self.program
        )
    }
}

/// Fetches one region's facilities.
///
/// # Errors
///
/// Returns [`SourceError`] if either step fails or the search returns no
/// query id.
pub async fn fetch_region(
    client: &reqwest::Client,
    query: &EchoQuery<'_>,
    region: &str,
) -> Result<(Vec<serde_json::Value>, FetchPath), SourceError> {
    let search_url = query.service_url("get_facilities");
    let body = retry::send_json(|| {
        client
            .get(&search_url)
            .query(&[("output", "JSON"), ("p_st", region)])
    })
    .await?;
    let search = parse_search(&body)?;

    if search.rows == 0 {
        return Ok((Vec::new(), FetchPath::Standard));
    }

    let path = choose_path(Some(search.rows), query.large_region_threshold);
    let large = path == FetchPath::LargeRegion;
    let columns = if large { query.lite_columns } else { None };
    if large {
        log::info!(
            "{region}: {} facilities exceeds {}, paging with reduced columns",
            search.rows,
            query.large_region_threshold
        );
    }

    let qid_url = query.service_url("get_qid");
    let page_size = query.page_size.max(1);
    let pages = search.rows.div_ceil(page_size).min(MAX_PAGES);
    let page_size_str = page_size.to_string();
    let mut records = Vec::new();

    for page in 1..=pages {
        let page_str = page.to_string();
        let body = retry::send_json(|| {
            let mut params = vec![
                ("output", "JSON"),
                ("qid", search.query_id.as_str()),
                ("pageno", page_str.as_str()),
                ("responseset", page_size_str.as_str()),
            ];
            if let Some(columns) = columns {
                params.push(("qcolumns", columns));
            }
            client.get(&qid_url).query(&params)
        })
        .await?;

        let facilities = facilities(&body);
        if facilities.is_empty() {
            break;
        }
        records.extend_from_slice(facilities);
    }

    Ok((records, path))
}

/// Reads `Results.QueryID` and `Results.QueryRows`.
///
/// # Errors
///
/// Returns [`SourceError::Normalization`] if the search failed or has no
/// query id.
pub fn parse_search(body: &serde_json::Value) -> Result<EchoSearch, SourceError> {
    let results = body
        .get("Results")
        .ok_or_else(|| SourceError::normalization("ECHO response had no Results"))?;

    if let Some(message) = results
        .get("Error")
        .and_then(|e| get_field(e, "ErrorMessage"))
        .and_then(value_to_string)
    {
        return Err(SourceError::normalization(format!("ECHO: {message}")));
    }

    let query_id = get_field(results, "QueryID")
        .and_then(value_to_string)
        .ok_or_else(|| SourceError::normalization("ECHO search returned no QueryID"))?;
    let rows = get_field(results, "QueryRows")
        .and_then(value_to_f64)
        .filter(|n| *n >= 0.0)
        .map_or(0, rows_from_f64);

    Ok(EchoSearch { query_id, rows })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn rows_from_f64(n: f64) -> u64 {
    n as u64
}

fn facilities(body: &serde_json::Value) -> &[serde_json::Value] {
    body.get("Results")
        .and_then(|r| r.get("Facilities"))
        .and_then(serde_json::Value::as_array)
        .map_or(&[][..], Vec::as_slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_program_service_urls() {
        let query = EchoQuery {
            base_url: "https://echodata.epa.gov/echo/",
            program: "cwa",
            page_size: 1000,
            large_region_threshold: 5000,
            lite_columns: None,
        };
        assert_eq!(
            query.service_url("get_qid"),
            "https://echodata.epa.gov/echo/cwa_rest_services.get_qid"
        );
    }

    #[test]
    fn parses_search_with_string_row_count() {
        let body = serde_json::json!({
            "Results": {"QueryID": "571", "QueryRows": "8123"}
        });
        assert_eq!(
            parse_search(&body).unwrap(),
            EchoSearch {
                query_id: "571".to_string(),
                rows: 8123
            }
        );
    }

    #[test]
    fn search_error_is_reported() {
        let body = serde_json::json!({
            "Results": {"Error": {"ErrorMessage": "Invalid state"}}
        });
        assert!(parse_search(&body).unwrap_err().to_string().contains("Invalid state"));
    }

    #[test]
    fn reads_facility_rows() {
        let body = serde_json::json!({
            "Results": {"Facilities": [{"SourceID": "MD0021601"}, {"SourceID": "MD0020001"}]}
        });
        assert_eq!(facilities(&body).len(), 2);
        assert!(facilities(&serde_json::json!({})).is_empty());
    }
}
