use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::models::machine::{Machine, MachineSpec};
use crate::routes::{api_error, ApiError};
use crate::store::StoreError;

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyMachineRequest {
    #[garde(length(min = 1, max = 63))]
    pub cluster_name: String,
    #[garde(dive)]
    pub spec: MachineSpec,
}

#[derive(Debug, Serialize)]
pub struct MachineResponse {
    #[serde(flatten)]
    pub machine: Machine,
    /// First external address, once the server is up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_address: Option<String>,
}

impl From<Machine> for MachineResponse {
    fn from(machine: Machine) -> Self {
        let preferred_address = machine.preferred_address().ok().map(str::to_string);
        Self {
            machine,
            preferred_address,
        }
    }
}

fn store_error(e: StoreError) -> ApiError {
    let status = match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict { .. } | StoreError::NotDeleting(_) => StatusCode::CONFLICT,
    };
    api_error(status, e.to_string())
}

/// PUT /api/v1/namespaces/{namespace}/machines/{name}: create or update desired state.
pub async fn apply_machine(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(request): Json<ApplyMachineRequest>,
) -> Result<Json<MachineResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    let ApplyMachineRequest {
        cluster_name,
        mut spec,
    } = request;
    // Both are written by the controller only.
    spec.machine_ref = None;
    spec.provider_id = None;

    let machine = state
        .store
        .apply(&namespace, &name, &cluster_name, spec)
        .await
        .map_err(store_error)?;

    Ok(Json(machine.into()))
}

/// GET /api/v1/namespaces/{namespace}/machines/{name}
pub async fn get_machine(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<MachineResponse>, ApiError> {
    state
        .store
        .get(&namespace, &name)
        .await
        .map(|m| Json(m.into()))
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                format!("machine {namespace}/{name} not found"),
            )
        })
}

/// DELETE /api/v1/namespaces/{namespace}/machines/{name}: request deletion.
///
/// The record stays visible in the `cleaning` state until the server is gone.
pub async fn delete_machine(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<(StatusCode, Json<MachineResponse>), ApiError> {
    let machine = state
        .store
        .mark_for_deletion(&namespace, &name)
        .await
        .map_err(store_error)?;

    Ok((StatusCode::ACCEPTED, Json(machine.into())))
}
