//! Shared HTTP client, headers, and status mapping.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};

use crate::error::StewardError;

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
///
/// The client carries only a connect timeout; the overall request timeout is
/// applied per request so long streams are bounded by task settings.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "falling back to default HTTP client");
                reqwest::Client::new()
            })
    })
}

/// Headers for Bearer-token APIs (indexed-delta providers).
pub fn bearer_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(AUTHORIZATION, val);
    }
    headers
}

/// Headers for the event-typed provider (x-api-key + version).
pub fn anthropic_headers(api_key: &str, version: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(api_key) {
        headers.insert("x-api-key", val);
    }
    if let Ok(val) = HeaderValue::from_str(version) {
        headers.insert("anthropic-version", val);
    }
    headers
}

/// POST a streaming request and fail fast on non-2xx responses.
pub async fn post_stream(
    url: &str,
    headers: HeaderMap,
    body: &serde_json::Value,
    request_timeout: Duration,
) -> Result<reqwest::Response, StewardError> {
    let resp = shared_client()
        .post(url)
        .headers(headers)
        .timeout(request_timeout)
        .json(body)
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let retry_after_header = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|secs| (secs * 1000.0) as u64);
        let body_text = resp.text().await.unwrap_or_default();
        return Err(status_to_error(status.as_u16(), &body_text, retry_after_header));
    }
    Ok(resp)
}

/// Map an HTTP error status to a classified error.
pub fn status_to_error(status: u16, body: &str, retry_after_ms: Option<u64>) -> StewardError {
    match status {
        401 | 403 => StewardError::Authentication(body.to_string()),
        429 => StewardError::RateLimited {
            retry_after_ms: retry_after_ms.or_else(|| extract_retry_after(body)),
        },
        _ => StewardError::api(status, body),
    }
}

fn extract_retry_after(body: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|r| r.as_f64())
                .map(|s| (s * 1000.0) as u64)
        })
}
