//! Request execution: auth, timeouts, retries, envelope validation

use crate::error::{classify, ApiError, ErrorClass};
use crate::models::{ApiErrorEntry, Envelope, ResultInfo};
use crate::pagination::Paginated;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Production API endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// Deadline for a single HTTP attempt
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries per failure condition; each condition keeps its own counter.
const MAX_NETWORK_RETRIES: u32 = 1;
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const MAX_SERVER_ERROR_RETRIES: u32 = 1;

/// Fixed delay after a network failure
const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Fallback delay when `Retry-After` is absent or unparseable
const RATE_LIMIT_FALLBACK_DELAY: Duration = Duration::from_secs(1);

/// Outcome of a request whose envelope validated.
///
/// Recoverable provider errors (conflicts) come back in-band so the caller
/// can branch on the conflicting resource; fatal and exhausted-transient
/// failures are raised as [`ApiError`].
#[derive(Debug)]
pub enum ApiOutcome<T> {
    Success {
        result: T,
        result_info: Option<ResultInfo>,
    },
    Recoverable {
        status: u16,
        errors: Vec<ApiErrorEntry>,
        result: Option<serde_json::Value>,
    },
}

impl<T> ApiOutcome<T> {
    /// Unwrap the success payload, raising a provider error on a conflict the
    /// caller did not expect.
    pub fn into_result(self) -> Result<T, ApiError> {
        match self {
            ApiOutcome::Success { result, .. } => Ok(result),
            ApiOutcome::Recoverable { status, errors, .. } => {
                Err(ApiError::from_envelope(status, errors))
            }
        }
    }
}

/// Bearer-authenticated client for the Cloudflare v4 API
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Create a client against the production endpoint
    pub fn new(token: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    /// Create a client against a custom endpoint (tests)
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Issue a request and validate the response envelope.
    ///
    /// `endpoint` is the path below the base URL, starting with `/`. The
    /// result payload is deserialized into `T` only when the envelope
    /// reports success.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
        query: &[(&str, String)],
    ) -> Result<ApiOutcome<T>, ApiError> {
        let url = format!("{}{}", self.base_url, endpoint);

        let mut network_retries = 0u32;
        let mut rate_limit_retries = 0u32;
        let mut server_error_retries = 0u32;

        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token)
                .query(query);
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) if is_network_failure(&err) && network_retries < MAX_NETWORK_RETRIES => {
                    network_retries += 1;
                    warn!(
                        "network failure on {} {} (retry {}/{}): {}",
                        method, endpoint, network_retries, MAX_NETWORK_RETRIES, err
                    );
                    tokio::time::sleep(NETWORK_RETRY_DELAY).await;
                    continue;
                }
                Err(err) => return Err(ApiError::Network(err)),
            };

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS
                && rate_limit_retries < MAX_RATE_LIMIT_RETRIES
            {
                rate_limit_retries += 1;
                let delay = retry_after_delay(response.headers());
                warn!(
                    "rate limited on {} {} (retry {}/{}), waiting {:?}",
                    method, endpoint, rate_limit_retries, MAX_RATE_LIMIT_RETRIES, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if status.is_server_error() && server_error_retries < MAX_SERVER_ERROR_RETRIES {
                server_error_retries += 1;
                // Linear backoff: 1s after the first failure, 2s after the second
                let delay = Duration::from_secs(u64::from(server_error_retries));
                warn!(
                    "server error {} on {} {} (retry {}/{}), waiting {:?}",
                    status, method, endpoint, server_error_retries, MAX_SERVER_ERROR_RETRIES, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            debug!("{} {} -> {}", method, endpoint, status);
            return self.validate_envelope(status.as_u16(), response).await;
        }
    }

    /// Parse the response body into the envelope and classify failures
    async fn validate_envelope<T: DeserializeOwned>(
        &self,
        status: u16,
        response: reqwest::Response,
    ) -> Result<ApiOutcome<T>, ApiError> {
        let text = response.text().await?;

        let envelope: Envelope = serde_json::from_str(&text).map_err(|err| ApiError::Schema {
            status,
            detail: format!("invalid response envelope: {err}"),
        })?;

        if !envelope.success {
            return match classify(status, &envelope.errors) {
                ErrorClass::Recoverable => Ok(ApiOutcome::Recoverable {
                    status,
                    errors: envelope.errors,
                    result: (!envelope.result.is_null()).then_some(envelope.result),
                }),
                ErrorClass::Fatal | ErrorClass::Transient => {
                    Err(ApiError::from_envelope(status, envelope.errors))
                }
            };
        }

        let result = serde_json::from_value(envelope.result).map_err(|err| ApiError::Schema {
            status,
            detail: format!("result payload did not match the expected shape: {err}"),
        })?;

        Ok(ApiOutcome::Success {
            result,
            result_info: envelope.result_info,
        })
    }

    /// GET convenience wrapper
    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<ApiOutcome<T>, ApiError> {
        self.request(Method::GET, endpoint, None, query).await
    }

    /// POST convenience wrapper
    pub async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<ApiOutcome<T>, ApiError> {
        self.request(Method::POST, endpoint, Some(body), &[]).await
    }

    /// PUT convenience wrapper
    pub async fn put<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<ApiOutcome<T>, ApiError> {
        self.request(Method::PUT, endpoint, Some(body), &[]).await
    }

    /// DELETE convenience wrapper
    pub async fn delete<T: DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<ApiOutcome<T>, ApiError> {
        self.request(Method::DELETE, endpoint, None, &[]).await
    }

    /// Lazily page through a list endpoint
    pub fn paginate<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Paginated<'_, T> {
        Paginated::new(self, endpoint, query)
    }
}

/// Should this transport-level error trigger the single network retry?
fn is_network_failure(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Compute the delay demanded by a 429 response.
///
/// Integer seconds are honoured verbatim. An HTTP-date is converted to a
/// delta from now, floored at 1s so a skewed server clock cannot produce a
/// tight retry loop. Anything else falls back to 1s.
fn retry_after_delay(headers: &HeaderMap) -> Duration {
    let Some(raw) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) else {
        return RATE_LIMIT_FALLBACK_DELAY;
    };
    let raw = raw.trim();

    if let Ok(seconds) = raw.parse::<u64>() {
        return Duration::from_secs(seconds);
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(raw) {
        let delta = date.signed_duration_since(chrono::Utc::now());
        let seconds = delta.num_seconds().max(1);
        return Duration::from_secs(seconds as u64);
    }

    RATE_LIMIT_FALLBACK_DELAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn retry_after_integer_seconds() {
        assert_eq!(
            retry_after_delay(&headers_with("7")),
            Duration::from_secs(7)
        );
        assert_eq!(
            retry_after_delay(&headers_with("0")),
            Duration::from_secs(0)
        );
    }

    #[test]
    fn retry_after_http_date_in_past_floors_at_one_second() {
        let past = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc2822();
        assert_eq!(
            retry_after_delay(&headers_with(&past)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn retry_after_http_date_in_future() {
        let future = (chrono::Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let delay = retry_after_delay(&headers_with(&future));
        assert!(delay >= Duration::from_secs(88) && delay <= Duration::from_secs(91));
    }

    #[test]
    fn retry_after_garbage_falls_back() {
        assert_eq!(
            retry_after_delay(&headers_with("soon")),
            Duration::from_secs(1)
        );
        assert_eq!(retry_after_delay(&HeaderMap::new()), Duration::from_secs(1));
    }

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        let client = ApiClient::with_base_url("t", "http://localhost:1234/").unwrap();
        assert_eq!(client.base_url, "http://localhost:1234");
    }
}
