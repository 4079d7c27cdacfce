use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub machines: ComponentHealth,
    pub jobs: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub count: usize,
}

/// GET /health: liveness plus the size of the record store and job registry.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            machines: ComponentHealth {
                status: "ok".to_string(),
                count: state.store.len().await,
            },
            jobs: ComponentHealth {
                status: "ok".to_string(),
                count: state.registry.len(),
            },
        },
    };

    (StatusCode::OK, Json(response))
}
