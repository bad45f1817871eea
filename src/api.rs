use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::entries::{ConfigEntries, EntrySummary};
use crate::integrations::openweather::config_flow::{FlowError, OptionsInput, ReauthInput, UserInput};
use crate::integrations::openweather::coordinator::RefreshOutcome;
use crate::state::{EntityState, StateMachine};

/// Shared application state
pub struct AppState {
    pub state_machine: Arc<StateMachine>,
    pub entries: Arc<ConfigEntries>,
    pub started_at: Instant,
}

/// GET /api/ response: HA compatibility
#[derive(Serialize)]
struct ApiStatus {
    message: String,
}

/// POST /api/config_entries/{id}/refresh response
#[derive(Serialize)]
struct RefreshResponse {
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
}

/// Flow errors rendered as `{"errors": {field: code}}`.
struct FlowRejection(FlowError);

impl From<FlowError> for FlowRejection {
    fn from(e: FlowError) -> Self {
        Self(e)
    }
}

impl IntoResponse for FlowRejection {
    fn into_response(self) -> Response {
        let status = match self.0 {
            FlowError::UnknownEntry => StatusCode::NOT_FOUND,
            FlowError::NotLoaded => StatusCode::CONFLICT,
            FlowError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        let mut errors = serde_json::Map::new();
        errors.insert(self.0.field().to_string(), self.0.code().into());
        let body = serde_json::json!({ "errors": errors });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/", get(api_status))
        .route("/api/health", get(health))
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state))
        .route("/api/config_entries", get(list_entries).post(create_entry))
        .route("/api/config_entries/:entry_id", get(get_entry).delete(remove_entry))
        .route("/api/config_entries/:entry_id/options", post(update_options))
        .route("/api/config_entries/:entry_id/reauth", post(reauth))
        .route("/api/config_entries/:entry_id/refresh", post(refresh))
        .with_state(state)
}

/// GET /api/: API running check
async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API running.".to_string(),
    })
}

/// GET /api/states: return all entity states
async fn get_states(State(app): State<Arc<AppState>>) -> Json<Vec<EntityState>> {
    Json(app.state_machine.get_all())
}

/// GET /api/states/{entity_id}: return single entity state
async fn get_state(
    State(app): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, StatusCode> {
    app.state_machine
        .get(&entity_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn list_entries(State(app): State<Arc<AppState>>) -> Json<Vec<EntrySummary>> {
    Json(app.entries.summaries())
}

async fn get_entry(
    State(app): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
) -> Result<Json<EntrySummary>, FlowRejection> {
    app.entries
        .summary(&entry_id)
        .map(Json)
        .ok_or(FlowRejection(FlowError::UnknownEntry))
}

/// POST /api/config_entries: user step
async fn create_entry(
    State(app): State<Arc<AppState>>,
    Json(input): Json<UserInput>,
) -> Result<(StatusCode, Json<EntrySummary>), FlowRejection> {
    let summary = app.entries.create_entry(input).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// POST /api/config_entries/{id}/options: options step
async fn update_options(
    State(app): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
    Json(options): Json<OptionsInput>,
) -> Result<Json<EntrySummary>, FlowRejection> {
    Ok(Json(app.entries.update_options(&entry_id, options).await?))
}

/// POST /api/config_entries/{id}/reauth: reauth step
async fn reauth(
    State(app): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
    Json(input): Json<ReauthInput>,
) -> Result<Json<EntrySummary>, FlowRejection> {
    Ok(Json(app.entries.reauth(&entry_id, input).await?))
}

/// POST /api/config_entries/{id}/refresh: refresh outside the poll timer
async fn refresh(
    State(app): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
) -> Result<Json<RefreshResponse>, FlowRejection> {
    let response = match app.entries.refresh(&entry_id).await? {
        RefreshOutcome::Updated => RefreshResponse { result: "updated", error: None, status: None },
        RefreshOutcome::Skipped => RefreshResponse { result: "skipped", error: None, status: None },
        RefreshOutcome::Failed(e) => RefreshResponse {
            result: "failed",
            status: e.status(),
            error: Some(e.to_string()),
        },
    };
    Ok(Json(response))
}

async fn remove_entry(
    State(app): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
) -> Result<StatusCode, FlowRejection> {
    app.entries.remove_entry(&entry_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/health: health check with counters
async fn health(State(app): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "entity_count": app.state_machine.len(),
        "entry_count": app.entries.len(),
        "state_writes": app.state_machine.write_count(),
        "uptime_seconds": app.started_at.elapsed().as_secs(),
    }))
}
