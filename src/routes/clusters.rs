use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::cluster::ApiEndpoint;
use crate::routes::{api_error, ApiError};

/// GET /api/v1/namespaces/{namespace}/clusters/{cluster}/endpoint: the cluster's API endpoint.
pub async fn get_endpoint(
    State(state): State<AppState>,
    Path((namespace, cluster)): Path<(String, String)>,
) -> Result<Json<ApiEndpoint>, ApiError> {
    state.endpoints.get(&namespace, &cluster).map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("cluster {namespace}/{cluster} has no API endpoint yet"),
        )
    })
}
