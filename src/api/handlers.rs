use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientIpConfig;
use crate::models::TrackRequest;
use crate::tracking::{extract_client_ip, RequestMeta, TrackError, Tracker};

pub struct AppState {
    pub tracker: Tracker,
    pub client_ip: ClientIpConfig,
    pub request_timeout: Duration,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct TrackResponse {
    pub status: &'static str,
}

impl IntoResponse for TrackError {
    fn into_response(self) -> Response {
        let status = match &self {
            TrackError::MalformedRequest(_) | TrackError::InvalidSiteFormat => {
                StatusCode::BAD_REQUEST
            }
            TrackError::SiteNotFound => StatusCode::NOT_FOUND,
            TrackError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TrackError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Record a page view sent as a JSON body
pub async fn track_post(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TrackResponse>, TrackError> {
    // Beacons commonly arrive as text/plain, so the content type is not checked
    let request: TrackRequest = serde_json::from_slice(&body).map_err(|err| {
        tracing::debug!(error = %err, "rejecting unparseable beacon body");
        TrackError::MalformedRequest("Invalid request body".to_string())
    })?;

    track(&state, request, &headers, addr).await
}

/// Record a page view sent as query parameters (image pixel fallback)
pub async fn track_get(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Result<Query<TrackRequest>, QueryRejection>,
) -> Result<Json<TrackResponse>, TrackError> {
    let Query(request) = query.map_err(|err| {
        tracing::debug!(error = %err, "rejecting unparseable beacon query");
        TrackError::MalformedRequest("Invalid request parameters".to_string())
    })?;

    track(&state, request, &headers, addr).await
}

async fn track(
    state: &AppState,
    request: TrackRequest,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> Result<Json<TrackResponse>, TrackError> {
    let meta = RequestMeta {
        client_ip: Some(extract_client_ip(headers, addr.ip(), &state.client_ip)),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string),
    };

    match tokio::time::timeout(state.request_timeout, state.tracker.track(request, meta)).await {
        Ok(result) => result.map(|_| Json(TrackResponse { status: "success" })),
        Err(_) => {
            tracing::warn!(
                timeout_ms = state.request_timeout.as_millis() as u64,
                "tracking request exceeded its deadline"
            );
            Err(TrackError::Timeout)
        }
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    match state.tracker.storage().ping().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "time": Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "health check failed to reach the database");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "error": "database connection failed",
                })),
            )
                .into_response()
        }
    }
}
