//! Bearer-token HTTP blob store.
//!
//! Objects are written with `PUT {api}/{pathname}` (no random suffix,
//! overwrite allowed) and listed with `GET {api}?prefix=...`, which answers
//! `{"blobs": [{"pathname", "url", "size"}], "hasMore", "cursor"}`.
//! Downloads go to the public `url` from the listing.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{BlobClient, BlobError, BlobObject, REQUEST_TIMEOUT, require_env};

/// Default API root.
const DEFAULT_API_URL: &str = "https://blob.vercel-storage.com";

/// API version header value.
const API_VERSION: &str = "7";

/// Safety stop for runaway cursors.
const MAX_LIST_PAGES: usize = 50;

/// HTTP blob store client.
pub struct HttpBlobClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    blobs: Vec<ListedBlob>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedBlob {
    pathname: String,
    url: String,
    #[serde(default)]
    size: u64,
}

impl HttpBlobClient {
    /// Creates a client for `api_url` authenticated with `token`. Every
    /// request is bounded by [`REQUEST_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Http`] if the HTTP client cannot be built.
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self, BlobError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Creates a client from `BLOB_READ_WRITE_TOKEN` and optionally
    /// `BLOB_API_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::MissingEnv`] if the token is unset.
    pub fn from_env() -> Result<Self, BlobError> {
        let token = require_env("BLOB_READ_WRITE_TOKEN")?;
        let api_url = require_env("BLOB_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        Self::new(api_url, token)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.api_url, key.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("x-api-version", API_VERSION)
    }
}

/// Parses one listing page into objects plus the next cursor.
///
/// # Errors
///
/// Returns [`serde_json::Error`] if the body is not a listing.
fn parse_list(body: &[u8]) -> Result<(Vec<BlobObject>, Option<String>), serde_json::Error> {
    let page: ListResponse = serde_json::from_slice(body)?;
    let next = if page.has_more { page.cursor } else { None };
    let objects = page
        .blobs
        .into_iter()
        .map(|b| BlobObject {
            key: b.pathname,
            url: Some(b.url),
            size: b.size,
        })
        .collect();
    Ok((objects, next))
}

fn check_status(response: &reqwest::Response, key: &str) -> Result<(), BlobError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(BlobError::Status {
            key: key.to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl BlobClient for HttpBlobClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), BlobError> {
        log::info!("Pushing {key} to blob store ({} bytes)", body.len());
        let response = self
            .authorized(self.client.put(self.object_url(key)))
            .header("x-add-random-suffix", "0")
            .header("x-allow-overwrite", "1")
            .header("x-content-type", "application/json")
            .body(body)
            .send()
            .await?;
        check_status(&response, key)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, BlobError> {
        let mut objects = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let mut params = vec![("prefix", prefix.to_string()), ("limit", "1000".to_string())];
            if let Some(cursor) = &cursor {
                params.push(("cursor", cursor.clone()));
            }

            let response = self
                .authorized(self.client.get(&self.api_url))
                .query(&params)
                .send()
                .await?;
            check_status(&response, prefix)?;

            let body = response.bytes().await?;
            let (page, next) = parse_list(&body).map_err(|e| BlobError::List {
                prefix: prefix.to_string(),
                source: Box::new(e),
            })?;
            objects.extend(page);

            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn get(&self, object: &BlobObject) -> Result<Vec<u8>, BlobError> {
        let url = object.url.clone().unwrap_or_else(|| self.object_url(&object.key));
        let response = self.client.get(url).send().await?;
        check_status(&response, &object.key)?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing_page() {
        let body = br#"{
            "blobs": [
                {"pathname": "cache/attains.json", "url": "https://x.public.blob/cache/attains.json", "size": 1024,
                 "uploadedAt": "2024-05-01T00:00:00.000Z"}
            ],
            "hasMore": true,
            "cursor": "abc"
        }"#;
        let (objects, next) = parse_list(body).unwrap();
        assert_eq!(
            objects,
            [BlobObject {
                key: "cache/attains.json".to_string(),
                url: Some("https://x.public.blob/cache/attains.json".to_string()),
                size: 1024,
            }]
        );
        assert_eq!(next.as_deref(), Some("abc"));
    }

    #[test]
    fn cursor_is_ignored_without_has_more() {
        let (objects, next) = parse_list(br#"{"blobs": [], "cursor": "stale"}"#).unwrap();
        assert!(objects.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn rejects_non_listing_body() {
        assert!(parse_list(b"<html>").is_err());
    }

    #[test]
    fn object_urls_join_cleanly() {
        let client = HttpBlobClient::new("https://blob.example.com/", "t").unwrap();
        assert_eq!(
            client.object_url("/cache/sdwis.json"),
            "https://blob.example.com/cache/sdwis.json"
        );
    }
}
