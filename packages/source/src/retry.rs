//! HTTP retry helpers for transient upstream errors.
//!
//! Every fetcher goes through [`send_json`] instead of calling
//! `reqwest::RequestBuilder::send()` directly. Retries here are short and
//! few: the build orchestrator owns the long-timeout retry pass, so this
//! layer only smooths over connection resets and brief 429/5xx bursts.
//!
//! ```ignore
//! let body = retry::send_json(|| client.get(&url).query(&params)).await?;
//! ```

use std::time::Duration;

use crate::SourceError;

/// Retry attempts after the first request for transient failures.
const MAX_RETRIES: u32 = 2;

/// First backoff delay. Doubles per attempt (1s, 2s).
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Maximum length of the response body preview included in error logs.
const BODY_PREVIEW_LEN: usize = 300;

/// Sends an HTTP request and parses the response body as JSON.
///
/// The `build_request` closure is called on each attempt to construct a
/// fresh [`reqwest::RequestBuilder`], since builders are consumed by
/// `.send()`.
///
/// Connection errors, timeouts, HTTP 429 and HTTP 5xx are retried up to
/// [`MAX_RETRIES`] times. Other 4xx responses are permanent.
///
/// # Errors
///
/// Returns [`SourceError`] if the request fails after all retries, the
/// server returns a non-retryable status, or the body is not valid JSON.
#[allow(clippy::future_not_send)]
pub async fn send_json<F>(build_request: F) -> Result<serde_json::Value, SourceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let response = send_inner(&build_request).await?;
    let url = response.url().to_string();
    let status = response.status();
    let text = response.text().await?;

    serde_json::from_str(&text).map_err(|e| {
        log::warn!(
            "JSON parse failed\n  url: {url}\n  status: {status}\n  \
             received: {} bytes\n  body preview: {}",
            text.len(),
            preview(&text),
        );
        SourceError::Json(e)
    })
}

/// Core retry loop. Returns the first 2xx/3xx response.
#[allow(clippy::future_not_send)]
async fn send_inner<F>(build_request: &F) -> Result<reqwest::Response, SourceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            log::debug!("  retry {attempt}/{MAX_RETRIES} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && attempt < MAX_RETRIES {
                    log::warn!("  transient error: {e}");
                    attempt += 1;
                    continue;
                }
                return Err(SourceError::Http(e));
            }
            Ok(response) => {
                let status = response.status();

                if is_retryable_status(status) {
                    if attempt < MAX_RETRIES {
                        log::warn!("  HTTP {status} from {}", response.url());
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::normalization(format!(
                        "HTTP {status} after {MAX_RETRIES} retries"
                    )));
                }

                if status.is_client_error() {
                    return Err(SourceError::normalization(format!("HTTP {status}")));
                }

                return Ok(response);
            }
        }
    }
}

/// Delay before retry number `attempt` (1-based).
fn backoff_delay(attempt: u32) -> Duration {
    BASE_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// 429 and every 5xx are worth another attempt.
fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
}

fn preview(text: &str) -> &str {
    if text.len() <= BODY_PREVIEW_LEN {
        return text;
    }
    let mut end = BODY_PREVIEW_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
    }

    #[test]
    fn retries_rate_limit_and_server_errors_only() {
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(reqwest::StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(reqwest::StatusCode::OK));
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let text = "é".repeat(400);
        let p = preview(&text);
        assert!(p.len() <= BODY_PREVIEW_LEN);
        assert!(text.starts_with(p));
    }
}
