//! Self-location lookup
//!
//! Fetches the caller's current geographic position from Mullvad's
//! `am.i.mullvad.net` endpoint, with bounded retries and exponential
//! backoff for transient failures.

use crate::vlog;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const DEFAULT_API_URL: &str = "https://am.i.mullvad.net/json";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Errors produced while looking up the user's location.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP request itself failed (connection, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The server answered with a non-success status code.
    #[error("unexpected status code {0}")]
    Status(u16),

    /// The server answered with something other than JSON.
    #[error("unexpected content-type: {0} (expected application/json)")]
    ContentType(String),

    /// The response body could not be decoded.
    #[error("failed to decode location response: {0}")]
    Decode(String),

    /// The lookup was cancelled by the caller.
    #[error("location lookup cancelled")]
    Cancelled,

    /// All attempts failed.
    #[error("failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Description of the last failure.
        last: String,
    },
}

/// The user's current location as reported by Mullvad.
#[derive(Debug, Clone, Deserialize)]
pub struct UserLocation {
    /// Public IP address the lookup was answered for.
    pub ip: String,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Country name.
    pub country: String,
    /// City name.
    pub city: String,
    /// Whether the caller is already exiting through a Mullvad relay.
    #[serde(default)]
    pub mullvad_exit_ip: bool,
}

/// HTTP client for the Mullvad location API.
pub struct ApiClient {
    client: reqwest::Client,
    url: String,
    max_retries: u32,
    retry_delay: Duration,
    verbose: u8,
}

impl ApiClient {
    /// Create a client identifying itself as `relay-compass/<version>`.
    pub fn new(version: &str, verbose: u8) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(format!("relay-compass/{version}"))
            .build()
            .map_err(|e| ApiError::Http(e.to_string()))?;
        Ok(Self {
            client,
            url: DEFAULT_API_URL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            verbose,
        })
    }

    /// Override the API endpoint (used by tests).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Fetch the user's location, retrying transient failures with
    /// exponential backoff. Cancellation is honored between attempts.
    pub async fn user_location(
        &self,
        cancel: &CancellationToken,
    ) -> Result<UserLocation, ApiError> {
        let mut last_err = ApiError::Http("no attempts made".to_string());

        for attempt in 0..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(ApiError::Cancelled);
            }
            if attempt > 0 {
                let delay = self.retry_delay * 2u32.pow(attempt - 1);
                vlog!(
                    self.verbose,
                    1,
                    "retrying location lookup (attempt {}/{}) after {:?}",
                    attempt + 1,
                    self.max_retries + 1,
                    delay
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(ApiError::Cancelled),
                }
            }

            match self.fetch_once().await {
                Ok(location) => {
                    vlog!(
                        self.verbose,
                        1,
                        "user location: {}, {} ({:.4}, {:.4})",
                        location.city,
                        location.country,
                        location.latitude,
                        location.longitude
                    );
                    return Ok(location);
                }
                Err(err) if is_retriable(&err) => {
                    vlog!(self.verbose, 1, "retriable lookup failure: {err}");
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }

        Err(ApiError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last: last_err.to_string(),
        })
    }

    async fn fetch_once(&self) -> Result<UserLocation, ApiError> {
        vlog!(self.verbose, 2, "GET {}", self.url);
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("application/json") {
            return Err(ApiError::ContentType(content_type));
        }

        response
            .json::<UserLocation>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Network-level failures and throttling/server-side statuses are worth
/// retrying; everything else is terminal.
fn is_retriable(err: &ApiError) -> bool {
    match err {
        ApiError::Http(_) => true,
        ApiError::Status(code) => matches!(code, 408 | 429) || *code >= 500,
        _ => false,
    }
}
