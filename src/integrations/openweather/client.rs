//! One Call API client.
//!
//! A single GET per call, no retries. Response classification:
//! 200 → parsed JSON body, 401 → [`ApiError::Auth`], anything else → transport error.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::LocationConfig;

/// Failure of a single One Call request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Key rejected by the provider (HTTP 401).
    #[error("invalid API key")]
    Auth,
    #[error("error communicating with API: HTTP {0}")]
    Status(u16),
    #[error("error communicating with API: {0}")]
    Request(#[from] reqwest::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl ApiError {
    /// True when the user has to supply new credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth)
    }

    /// Status code carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Auth => Some(StatusCode::UNAUTHORIZED.as_u16()),
            ApiError::Status(code) => Some(*code),
            ApiError::Request(e) => e.status().map(|s| s.as_u16()),
            ApiError::Timeout(_) => None,
        }
    }
}

/// Source of One Call payloads for a coordinator.
#[async_trait]
pub trait WeatherApi: Send + Sync {
    async fn fetch_data(&self) -> Result<Value, ApiError>;
}

/// HTTP fetcher bound to one location.
#[derive(Debug, Clone)]
pub struct OneCallClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    latitude: f64,
    longitude: f64,
}

impl OneCallClient {
    /// `http` is the host-wide client; cloning it shares the connection pool.
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, location: &LocationConfig) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            api_key: location.api_key.clone(),
            latitude: location.latitude,
            longitude: location.longitude,
        }
    }
}

#[async_trait]
impl WeatherApi for OneCallClient {
    async fn fetch_data(&self) -> Result<Value, ApiError> {
        let resp = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("lat", self.latitude.to_string()),
                ("lon", self.longitude.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Auth);
        }
        if status != StatusCode::OK {
            return Err(ApiError::Status(status.as_u16()));
        }

        Ok(resp.json::<Value>().await?)
    }
}

/// Outcome of the setup-time credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Ok,
    InvalidAuth,
    CannotConnect,
}

/// Probe the endpoint with everything but `current` excluded.
pub async fn validate_credentials(
    http: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    latitude: f64,
    longitude: f64,
) -> Validation {
    let result = http
        .get(endpoint)
        .query(&[
            ("lat", latitude.to_string()),
            ("lon", longitude.to_string()),
            ("appid", api_key.to_string()),
            ("exclude", "minutely,hourly,daily,alerts".to_string()),
        ])
        .send()
        .await;

    match result {
        Ok(resp) if resp.status() == StatusCode::OK => Validation::Ok,
        Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => Validation::InvalidAuth,
        Ok(resp) => {
            tracing::debug!(status = %resp.status(), "One Call validation rejected");
            Validation::CannotConnect
        }
        Err(e) => {
            tracing::debug!(error = %e, "One Call validation request failed");
            Validation::CannotConnect
        }
    }
}
