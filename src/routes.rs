use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json,
    Router,
};
use data_model::{AggregateSnapshot, HostView};
use serde::Deserialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::error;

use crate::{
    aggregator::HostAggregator,
    fleet::{FleetCoordinator, FleetError},
};

#[derive(Debug)]
pub struct ApiError {
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        match e {
            FleetError::CommandNotAllowed(_) => Self::bad_request(&e.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct RouteState {
    pub fleet: Arc<FleetCoordinator>,
    pub local: Arc<HostAggregator>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/metrics", get(fleet_metrics))
        .route("/api/gpu", get(local_gpus))
        .with_state(route_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct MetricsParams {
    pub cmd: Option<String>,
}

/// Polls every configured host once.
async fn fleet_metrics(
    State(state): State<RouteState>,
    Query(params): Query<MetricsParams>,
) -> Result<Json<AggregateSnapshot>, ApiError> {
    let command = state.fleet.resolve_command(params.cmd.as_deref())?;
    Ok(Json(state.fleet.poll_with_command(&command).await))
}

/// Polls the GPUs of the host serving the request.
async fn local_gpus(State(state): State<RouteState>) -> Json<HostView> {
    Json(state.local.collect().await)
}
