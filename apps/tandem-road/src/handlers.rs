use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use tandem_proto::EndpointSnapshot;
use thiserror::Error;
use tracing::debug;

use crate::AppState;

pub const ENDPOINT_ID_HEADER: &str = "x-endpoint-id";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("caller endpoint id is required (X-Endpoint-ID header or endpointId query)")]
    MissingEndpointId,
    #[error("no endpoint with id \"{0}\" is connected")]
    UnknownEndpoint(String),
    #[error("metrics recorder is not installed")]
    MetricsUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::MissingEndpointId => StatusCode::BAD_REQUEST,
            ApiError::UnknownEndpoint(_) | ApiError::MetricsUnavailable => StatusCode::NOT_FOUND,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointQuery {
    pub endpoint_id: Option<String>,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "endpoints": state.router.registry().len(),
    }))
}

/// Every registered endpoint except the caller.
pub async fn list_endpoints(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EndpointQuery>,
) -> Result<Json<Vec<EndpointSnapshot>>, ApiError> {
    let caller = headers
        .get(ENDPOINT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or(query.endpoint_id)
        .filter(|id| !id.trim().is_empty())
        .ok_or(ApiError::MissingEndpointId)?;

    let registry = state.router.registry();
    if !registry.contains(&caller) {
        return Err(ApiError::UnknownEndpoint(caller));
    }
    let endpoints = registry.list(Some(&caller));
    debug!(endpoint_id = %caller, count = endpoints.len(), "listed endpoints");
    Ok(Json(endpoints))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let handle = state.metrics.as_ref().ok_or(ApiError::MetricsUnavailable)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}
