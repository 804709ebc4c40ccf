//! HTTP transport for the collector endpoint
//!
//! One POST per (category, app key) batch:
//! `POST <base_url>/<app_key>/<category>` with the signed JSON array as the
//! body. Status classification lives here so the dispatcher only has to
//! decide delete / retain / dead-letter.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::error::{Error, Result};
use crate::events::Category;

/// Network availability probe.
///
/// Connectivity detection is platform glue the SDK cannot do itself; the
/// host installs its own probe, or keeps the default which assumes a
/// connection and lets the HTTP request be the arbiter.
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Default probe: always reports a connection
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_connected(&self) -> bool {
        true
    }
}

/// Result of one batch POST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx: the collector accepted the batch, delete the records
    Delivered,
    /// 5xx or transport failure: keep the records for the next cycle
    Retryable,
    /// 4xx: the collector will never accept this batch, dead-letter it
    Rejected(u16),
}

/// HTTP client for the collector API
pub struct CollectorClient {
    http: reqwest::Client,
    base_url: String,
}

impl CollectorClient {
    /// Create a client for the given collector base URL
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Endpoint for one (app key, category) pair
    pub fn endpoint(&self, app_key: &str, category: Category) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            urlencoding::encode(app_key),
            category.as_str()
        )
    }

    /// POST one serialized batch.
    ///
    /// Never returns an error: every failure mode collapses into a
    /// `DeliveryOutcome` so the dispatcher's handling stays uniform.
    pub async fn post_batch(
        &self,
        app_key: &str,
        category: Category,
        body: String,
        signature: &str,
    ) -> DeliveryOutcome {
        let url = self.endpoint(app_key, category);

        let authorization = match HeaderValue::from_str(signature) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, "invalid signature header, retrying next cycle");
                return DeliveryOutcome::Retryable;
            }
        };

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, authorization)
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    DeliveryOutcome::Delivered
                } else {
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "unknown".to_string());
                    if status.is_client_error() {
                        tracing::error!(
                            %url,
                            status = status.as_u16(),
                            %body,
                            "collector rejected batch"
                        );
                        DeliveryOutcome::Rejected(status.as_u16())
                    } else {
                        tracing::warn!(
                            %url,
                            status = status.as_u16(),
                            %body,
                            "collector unavailable"
                        );
                        DeliveryOutcome::Retryable
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%url, error = %e, "batch request failed");
                DeliveryOutcome::Retryable
            }
        }
    }
}
