//! HTTP client for record delivery.
//!
//! Posts a record's business fields as JSON and classifies the outcome:
//! transport failures and any status at or above 400 are failed attempts,
//! every other status is an acknowledgment.

use std::time::Duration;

use courier_core::RecordId;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the record id.
pub const RECORD_ID_HEADER: &str = "X-Courier-Record-Id";
/// Header carrying the 1-based attempt number within the current cycle.
pub const ATTEMPT_HEADER: &str = "X-Courier-Attempt";

const MAX_LOGGED_BODY: usize = 1024;

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for a single request, connect included.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: format!("courier/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// One delivery attempt of one record.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Destination URL.
    pub url: String,
    /// Record being delivered.
    pub record_id: RecordId,
    /// Attempt number within the current cycle, starting at 1.
    pub attempt_number: u32,
    /// JSON object of the record's business fields.
    pub body: serde_json::Value,
}

/// Acknowledgment from the remote endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code, always below 400.
    pub status_code: u16,
    /// Response body, truncated for logging.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

/// HTTP client shared by all workers.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Posts one record to the endpoint.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the request exceeds the configured timeout
    /// - `NetworkError` for any other transport failure
    /// - `ClientError` / `ServerError` for statuses at or above 400
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "record_delivery",
            record_id = %request.record_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting record delivery");

            let result = self
                .client
                .post(&request.url)
                .json(&request.body)
                .header(RECORD_ID_HEADER, request.record_id.to_string())
                .header(ATTEMPT_HEADER, request.attempt_number.to_string())
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status_code = response.status().as_u16();
            let body = read_body(response).await;
            let duration = start_time.elapsed();

            if status_code >= 400 {
                tracing::warn!(
                    status = status_code,
                    duration_ms = duration.as_millis(),
                    "endpoint rejected record"
                );
                return Err(DeliveryError::http_status(status_code, body));
            }

            tracing::debug!(
                status = status_code,
                duration_ms = duration.as_millis(),
                "record acknowledged"
            );
            Ok(DeliveryResponse { status_code, body, duration })
        }
        .instrument(span)
        .await
    }
}

async fn read_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_LOGGED_BODY => {
            let suffix = "... (truncated)";
            let truncated = String::from_utf8_lossy(&bytes[..MAX_LOGGED_BODY - suffix.len()]);
            format!("{truncated}{suffix}")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!("failed to read response body: {}", e);
            format!("[failed to read response body: {e}]")
        },
    }
}
