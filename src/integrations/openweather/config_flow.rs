//! Config flow: user step, options step and reauth step.

use serde::{Deserialize, Serialize};

use super::client::{self, Validation};
use super::DEFAULT_MAX_DAILY_REQUESTS;

/// Form submitted by the user step (also the shape of YAML imports).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInput {
    pub name: String,
    pub api_key: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_max_daily_requests")]
    pub max_daily_requests: i64,
}

fn default_max_daily_requests() -> i64 {
    DEFAULT_MAX_DAILY_REQUESTS
}

/// Options step. Changing it reloads the entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptionsInput {
    #[serde(default)]
    pub max_daily_requests: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReauthInput {
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("invalid API key")]
    InvalidAuth,
    #[error("cannot connect to the One Call API")]
    CannotConnect,
    #[error("location is already configured")]
    AlreadyConfigured,
    #[error("latitude must be within -90..=90")]
    InvalidLatitude,
    #[error("longitude must be within -180..=180")]
    InvalidLongitude,
    #[error("{0} is required")]
    Required(&'static str),
    #[error("no such config entry")]
    UnknownEntry,
    #[error("config entry is not loaded")]
    NotLoaded,
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl FlowError {
    /// Form field the error belongs to; `base` for form-wide errors.
    pub fn field(&self) -> &'static str {
        match self {
            FlowError::InvalidLatitude => "latitude",
            FlowError::InvalidLongitude => "longitude",
            FlowError::Required(field) => field,
            _ => "base",
        }
    }

    /// Stable error code for the form.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::InvalidAuth => "invalid_auth",
            FlowError::CannotConnect => "cannot_connect",
            FlowError::AlreadyConfigured => "already_configured",
            FlowError::InvalidLatitude => "invalid_latitude",
            FlowError::InvalidLongitude => "invalid_longitude",
            FlowError::Required(_) => "required",
            FlowError::UnknownEntry => "unknown_entry",
            FlowError::NotLoaded => "not_loaded",
            FlowError::Unknown(_) => "unknown",
        }
    }
}

/// One entry per coordinate pair.
pub fn unique_id(latitude: f64, longitude: f64) -> String {
    format!("{}-{}", latitude, longitude)
}

/// Offline checks on the user form.
pub fn check_form(input: &UserInput) -> Result<(), FlowError> {
    if input.name.trim().is_empty() {
        return Err(FlowError::Required("name"));
    }
    if input.api_key.trim().is_empty() {
        return Err(FlowError::Required("api_key"));
    }
    if !(-90.0..=90.0).contains(&input.latitude) {
        return Err(FlowError::InvalidLatitude);
    }
    if !(-180.0..=180.0).contains(&input.longitude) {
        return Err(FlowError::InvalidLongitude);
    }
    Ok(())
}

/// Confirm the key works for the location before anything is persisted.
pub async fn validate_input(
    http: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    latitude: f64,
    longitude: f64,
) -> Result<(), FlowError> {
    match client::validate_credentials(http, endpoint, api_key, latitude, longitude).await {
        Validation::Ok => Ok(()),
        Validation::InvalidAuth => Err(FlowError::InvalidAuth),
        Validation::CannotConnect => Err(FlowError::CannotConnect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn input() -> UserInput {
        UserInput {
            name: "Home".to_string(),
            api_key: "key".to_string(),
            latitude: 52.52,
            longitude: 13.405,
            max_daily_requests: 1000,
        }
    }

    #[test]
    fn test_check_form_accepts_valid_input() {
        assert_eq!(check_form(&input()), Ok(()));
        let edge = UserInput { latitude: -90.0, longitude: 180.0, ..input() };
        assert_eq!(check_form(&edge), Ok(()));
    }

    #[test]
    fn test_check_form_ranges() {
        let bad = UserInput { latitude: 90.5, ..input() };
        assert_eq!(check_form(&bad), Err(FlowError::InvalidLatitude));
        let bad = UserInput { longitude: -181.0, ..input() };
        assert_eq!(check_form(&bad), Err(FlowError::InvalidLongitude));
        let bad = UserInput { latitude: f64::NAN, ..input() };
        assert_eq!(check_form(&bad), Err(FlowError::InvalidLatitude));
    }

    #[test]
    fn test_check_form_required_fields() {
        let bad = UserInput { api_key: "  ".into(), ..input() };
        let err = check_form(&bad).unwrap_err();
        assert_eq!(err.field(), "api_key");
        assert_eq!(err.code(), "required");
    }

    #[test]
    fn test_user_input_default_quota() {
        let parsed: UserInput = serde_json::from_value(serde_json::json!({
            "name": "Home", "api_key": "k", "latitude": 1.5, "longitude": 2.5
        }))
        .unwrap();
        assert_eq!(parsed.max_daily_requests, 1000);
    }

    #[test]
    fn test_unique_id() {
        assert_eq!(unique_id(52.52, 13.405), "52.52-13.405");
        assert_eq!(unique_id(-33.9, 18.0), "-33.9-18");
    }

    #[tokio::test]
    async fn test_validate_input_maps_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("appid", "revoked"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("appid", "key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        assert_eq!(validate_input(&http, &server.uri(), "key", 1.0, 2.0).await, Ok(()));
        assert_eq!(
            validate_input(&http, &server.uri(), "revoked", 1.0, 2.0).await,
            Err(FlowError::InvalidAuth)
        );
        // Nothing mounted for this key: wiremock answers 404.
        assert_eq!(
            validate_input(&http, &server.uri(), "other", 1.0, 2.0).await,
            Err(FlowError::CannotConnect)
        );
    }
}
