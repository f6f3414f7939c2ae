//! Licensing server transport.
//!
//! The engine talks to the server exclusively through the [`Transport`]
//! trait, which keeps the HTTP stack swappable in tests. The shipped
//! implementation, [`HttpTransport`], wraps reqwest with aggressive
//! timeouts, bearer authentication, and bounded exponential backoff on
//! transient failures. Semantic rejections (4xx with a reason code) are
//! never retried; the server has already made up its mind.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::error::LicenseError;
use crate::token::SignedOfflineToken;
use crate::types::Entitlement;

/// Retry attempts for network and 5xx failures.
const MAX_RETRIES: u32 = 3;
/// Base delay for exponential backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Activation request body.
#[derive(Debug, Clone, Serialize)]
pub struct ActivateRequest {
    /// Device the activation binds to.
    pub device_id: String,
    /// Optional human-readable device name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Arbitrary activation metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// License snapshot embedded in server responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LicenseSnapshot {
    /// License key, when the server echoes it.
    #[serde(default)]
    pub key: Option<String>,
    /// Server-side license status string.
    #[serde(default)]
    pub status: Option<String>,
    /// Absolute license expiry (Unix seconds).
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Entitlements currently active on this license.
    #[serde(default)]
    pub active_entitlements: Vec<Entitlement>,
}

/// Activation record returned by `POST .../activate`.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivationRecord {
    /// Server-assigned activation id.
    pub id: String,
    /// Device the activation was recorded against.
    #[serde(default)]
    pub device_id: Option<String>,
    /// License snapshot embedded in the response.
    #[serde(default)]
    pub license: Option<LicenseSnapshot>,
}

/// Server response to `POST .../validate`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidateResponse {
    /// Whether the server considers the license valid.
    pub valid: bool,
    /// Reason code when invalid.
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable explanation.
    #[serde(default)]
    pub message: Option<String>,
    /// License snapshot with active entitlements.
    #[serde(default)]
    pub license: Option<LicenseSnapshot>,
}

/// Public signing key returned by `GET /signing-keys/{kid}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningKeyResponse {
    /// Key id this key answers for.
    pub key_id: String,
    /// Signature algorithm, `"ed25519"`.
    pub algorithm: String,
    /// Base64url-encoded raw public key bytes.
    pub public_key: String,
}

impl SigningKeyResponse {
    /// Decode the raw public key bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the key is not valid base64url.
    pub fn decode_key(&self) -> Result<Vec<u8>, LicenseError> {
        latchkey_crypto::base64url_decode(&self.public_key).map_err(LicenseError::from)
    }
}

/// Logical operations against the licensing server.
///
/// Implementations classify failures into the [`LicenseError`] taxonomy;
/// the engine only reasons about error classes, never HTTP mechanics.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create an activation for a license key on this device.
    async fn activate(
        &self,
        license_key: &str,
        request: &ActivateRequest,
    ) -> Result<ActivationRecord, LicenseError>;

    /// Validate a license key, optionally scoped to a device.
    async fn validate(
        &self,
        license_key: &str,
        device_id: Option<&str>,
    ) -> Result<ValidateResponse, LicenseError>;

    /// Deactivate this device's activation.
    async fn deactivate(&self, license_key: &str, device_id: &str) -> Result<(), LicenseError>;

    /// Prove liveness with the server.
    async fn heartbeat(&self, license_key: &str, device_id: &str) -> Result<(), LicenseError>;

    /// Fetch a freshly signed offline token for this device.
    async fn fetch_offline_token(
        &self,
        license_key: &str,
        device_id: &str,
    ) -> Result<SignedOfflineToken, LicenseError>;

    /// Fetch the public signing key for a key id.
    async fn fetch_signing_key(&self, kid: &str) -> Result<SigningKeyResponse, LicenseError>;

    /// Lightweight liveness probe used by the connectivity poller.
    async fn health(&self) -> Result<(), LicenseError>;
}

/// Error body shape the server uses for 4xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Reqwest-backed [`Transport`].
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    product_slug: String,
    api_key: String,
}

impl HttpTransport {
    /// Build a transport from engine configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying HTTP client cannot be constructed.
    pub fn new(config: &EngineConfig) -> Result<Self, LicenseError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("latchkey/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LicenseError::Config {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            product_slug: config.product_slug.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn license_url(&self, license_key: &str, action: &str) -> String {
        format!(
            "{}/products/{}/licenses/{}/{}",
            self.base_url, self.product_slug, license_key, action
        )
    }

    /// Execute a request with bounded exponential backoff.
    ///
    /// Only network failures and 5xx/408 responses are retried. Any 4xx
    /// is classified immediately and returned.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<String, LicenseError> {
        let mut last_error = LicenseError::Network {
            message: "Request not attempted".into(),
        };

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Retrying request");
                tokio::time::sleep(delay).await;
            }

            let Some(req) = request.try_clone() else {
                break;
            };

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();

                    if status.is_success() {
                        return Ok(body);
                    }

                    let error = classify_status(status.as_u16(), &body);
                    if error.is_network_failure() {
                        warn!(status = status.as_u16(), "Server error, will retry");
                        last_error = error;
                        continue;
                    }
                    return Err(error);
                },
                Err(e) if e.is_timeout() => {
                    last_error = LicenseError::Timeout { seconds: 0 };
                },
                Err(e) => {
                    last_error = LicenseError::Network {
                        message: e.to_string(),
                    };
                },
            }
        }

        Err(last_error)
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, LicenseError> {
        let request = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body);
        let text = self.execute(request).await?;
        parse_body(&text)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, LicenseError> {
        let request = self.client.get(url).bearer_auth(&self.api_key);
        let text = self.execute(request).await?;
        parse_body(&text)
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, LicenseError> {
    serde_json::from_str(text).map_err(|e| LicenseError::Network {
        message: format!("Malformed server response: {}", e),
    })
}

/// Map an HTTP error status to the error taxonomy.
///
/// 403 is grouped with 401 as a credential problem rather than a
/// semantic license rejection; a misconfigured API key must not purge
/// cached license state.
fn classify_status(status: u16, body: &str) -> LicenseError {
    match status {
        401 | 403 => LicenseError::Unauthorized {
            message: format!("HTTP {}", status),
        },
        429 => LicenseError::RateLimited,
        408 => LicenseError::Timeout { seconds: 0 },
        500..=599 => LicenseError::ServerError { status },
        _ => {
            let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
            let (code, message) = match parsed {
                Some(b) => {
                    let message = b
                        .message
                        .or(b.error)
                        .unwrap_or_else(|| format!("HTTP {}", status));
                    (b.code, message)
                },
                None => (None, format!("HTTP {}", status)),
            };
            LicenseError::Rejected {
                status,
                code,
                message,
            }
        },
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    async fn activate(
        &self,
        license_key: &str,
        request: &ActivateRequest,
    ) -> Result<ActivationRecord, LicenseError> {
        let url = self.license_url(license_key, "activate");
        self.post_json(&url, request).await
    }

    #[instrument(skip(self))]
    async fn validate(
        &self,
        license_key: &str,
        device_id: Option<&str>,
    ) -> Result<ValidateResponse, LicenseError> {
        let url = self.license_url(license_key, "validate");
        let body = serde_json::json!({ "device_id": device_id });
        self.post_json(&url, &body).await
    }

    #[instrument(skip(self))]
    async fn deactivate(&self, license_key: &str, device_id: &str) -> Result<(), LicenseError> {
        let url = self.license_url(license_key, "deactivate");
        let body = serde_json::json!({ "device_id": device_id });
        let _: serde_json::Value = self.post_json(&url, &body).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn heartbeat(&self, license_key: &str, device_id: &str) -> Result<(), LicenseError> {
        let url = self.license_url(license_key, "heartbeat");
        let body = serde_json::json!({ "device_id": device_id });
        let _: serde_json::Value = self.post_json(&url, &body).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_offline_token(
        &self,
        license_key: &str,
        device_id: &str,
    ) -> Result<SignedOfflineToken, LicenseError> {
        let url = self.license_url(license_key, "offline-token");
        let body = serde_json::json!({ "device_id": device_id });
        self.post_json(&url, &body).await
    }

    #[instrument(skip(self))]
    async fn fetch_signing_key(&self, kid: &str) -> Result<SigningKeyResponse, LicenseError> {
        let url = format!("{}/signing-keys/{}", self.base_url, kid);
        self.get_json(&url).await
    }

    async fn health(&self) -> Result<(), LicenseError> {
        let url = format!("{}/health", self.base_url);
        let request = self.client.get(&url).bearer_auth(&self.api_key);
        self.execute(request).await.map(|_| ())
    }
}
