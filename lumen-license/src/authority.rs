//! Round trips to the licensing authority.
//!
//! Defines the [`LicenseAuthority`] trait the engine talks to, and the HTTP
//! implementation [`HttpAuthority`] (behind the `online` feature).
//!
//! Implementations must keep "the authority said no" ([`LicenseError::Rejected`])
//! apart from "the authority could not be reached"
//! ([`LicenseError::NetworkUnavailable`]); the engine's offline path depends on it.
//! They never touch the cache.

use crate::error::LicenseResult;
use crate::payload::SignedPayload;
use async_trait::async_trait;

/// The remote licensing authority.
#[async_trait]
pub trait LicenseAuthority: Send + Sync {
    /// Requests an activation slot for `device_id` and returns the signed view
    /// of the license for that device.
    async fn activate(&self, license_key: &str, device_id: &str) -> LicenseResult<SignedPayload>;

    /// Re-verifies an existing activation.
    async fn verify(&self, license_key: &str, device_id: &str) -> LicenseResult<SignedPayload>;
}

#[cfg(feature = "online")]
pub use http::HttpAuthority;

#[cfg(feature = "online")]
mod http {
    use super::LicenseAuthority;
    use crate::config::LicenseConfig;
    use crate::error::{LicenseError, LicenseResult};
    use crate::payload::SignedPayload;
    use async_trait::async_trait;
    use reqwest::{Client, StatusCode};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tracing::{debug, warn};

    #[derive(Debug, Serialize)]
    struct LicenseRequest<'a> {
        license_key: &'a str,
        device_id: &'a str,
    }

    #[derive(Debug, Deserialize)]
    struct PayloadResponse {
        payload: String,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorResponse {
        error: Option<String>,
    }

    /// HTTP client for the licensing authority.
    ///
    /// Endpoints: `POST {base}/v1/licenses/activate` and
    /// `POST {base}/v1/licenses/verify`.
    pub struct HttpAuthority {
        client: Client,
        base_url: String,
        timeout: Duration,
        max_retries: u32,
        retry_backoff: Duration,
    }

    impl HttpAuthority {
        /// Creates a client for the authority at `base_url`.
        pub fn new(
            base_url: impl Into<String>,
            timeout: Duration,
            max_retries: u32,
            retry_backoff: Duration,
        ) -> LicenseResult<Self> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| LicenseError::Config(format!("failed to create HTTP client: {e}")))?;

            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                timeout,
                max_retries,
                retry_backoff,
            })
        }

        /// Creates a client from the engine configuration.
        pub fn from_config(config: &LicenseConfig) -> LicenseResult<Self> {
            Self::new(
                config.authority_url.clone(),
                config.request_timeout(),
                config.max_retries,
                config.retry_backoff(),
            )
        }

        /// Returns the authority base URL.
        pub fn base_url(&self) -> &str {
            &self.base_url
        }

        async fn call(&self, op: &str, license_key: &str, device_id: &str) -> LicenseResult<SignedPayload> {
            let url = format!("{}/v1/licenses/{op}", self.base_url);
            let mut attempt: u32 = 0;

            loop {
                match self.call_once(&url, license_key, device_id).await {
                    Err(LicenseError::NetworkUnavailable(reason)) if attempt < self.max_retries => {
                        attempt += 1;
                        warn!("License {} attempt {} failed: {}", op, attempt, reason);
                        tokio::time::sleep(self.retry_backoff * attempt).await;
                    }
                    other => return other,
                }
            }
        }

        async fn call_once(&self, url: &str, license_key: &str, device_id: &str) -> LicenseResult<SignedPayload> {
            let request = self
                .client
                .post(url)
                .json(&LicenseRequest {
                    license_key,
                    device_id,
                })
                .send();

            let response = match tokio::time::timeout(self.timeout, request).await {
                Err(_) => {
                    return Err(LicenseError::NetworkUnavailable(format!(
                        "request timed out after {}ms",
                        self.timeout.as_millis()
                    )));
                }
                Ok(Err(e)) => return Err(LicenseError::NetworkUnavailable(e.to_string())),
                Ok(Ok(response)) => response,
            };

            let status = response.status();
            debug!("Authority responded {} for {}", status, url);

            if status.is_success() {
                let body: PayloadResponse = response.json().await.map_err(|e| {
                    LicenseError::NetworkUnavailable(format!("unreadable authority response: {e}"))
                })?;
                return Ok(SignedPayload::new(body.payload));
            }

            if is_rejection(status) {
                let reason = response
                    .json::<ErrorResponse>()
                    .await
                    .ok()
                    .and_then(|body| body.error)
                    .unwrap_or_else(|| status.to_string());
                return Err(LicenseError::Rejected(reason));
            }

            Err(LicenseError::NetworkUnavailable(format!(
                "authority returned {status}"
            )))
        }
    }

    fn is_rejection(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::BAD_REQUEST
                | StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::NOT_FOUND
                | StatusCode::CONFLICT
                | StatusCode::GONE
                | StatusCode::UNPROCESSABLE_ENTITY
        )
    }

    #[async_trait]
    impl LicenseAuthority for HttpAuthority {
        async fn activate(&self, license_key: &str, device_id: &str) -> LicenseResult<SignedPayload> {
            self.call("activate", license_key, device_id).await
        }

        async fn verify(&self, license_key: &str, device_id: &str) -> LicenseResult<SignedPayload> {
            self.call("verify", license_key, device_id).await
        }
    }
}
