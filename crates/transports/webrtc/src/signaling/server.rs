//! Signaling HTTP endpoints
//!
//! - `POST /offer_ice`: a peer's offer; answered asynchronously via the
//!   peer's `/answer_ice`
//! - `POST /answer_ice`: a peer's answer to our offer
//! - `GET /`: this node's identity

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use super::SignalingMessage;
use crate::orchestrator::MeshOrchestrator;
use crate::Error;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Build the signaling router
pub fn router(orchestrator: Arc<MeshOrchestrator>) -> Router {
    Router::new()
        .route("/", get(identity))
        .route("/offer_ice", post(offer_ice))
        .route("/answer_ice", post(answer_ice))
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

async fn identity(State(orchestrator): State<Arc<MeshOrchestrator>>) -> impl IntoResponse {
    Json(orchestrator.local().clone())
}

/// POST /offer_ice
async fn offer_ice(State(orchestrator): State<Arc<MeshOrchestrator>>, body: Bytes) -> Response {
    let message = match decode(&body) {
        Ok(message) => message,
        Err(response) => return response,
    };
    debug!(peer = %message.from(), "Offer received");
    match orchestrator.accept_offer(message).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /answer_ice
async fn answer_ice(State(orchestrator): State<Arc<MeshOrchestrator>>, body: Bytes) -> Response {
    let message = match decode(&body) {
        Ok(message) => message,
        Err(response) => return response,
    };
    debug!(peer = %message.from(), "Answer received");
    match orchestrator.complete_answer(message).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

fn decode(body: &[u8]) -> Result<SignalingMessage, Response> {
    serde_json::from_slice(body).map_err(|e| {
        warn!("Rejecting malformed signaling payload: {}", e);
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "malformed_payload".to_string(),
                message: e.to_string(),
            }),
        )
            .into_response()
    })
}

fn error_response(error: Error) -> Response {
    let (status, code) = match &error {
        Error::DuplicateConnection(_) => (StatusCode::CONFLICT, "duplicate_connection"),
        Error::RoleMismatch { .. } => (StatusCode::CONFLICT, "role_mismatch"),
        Error::ConnectionNotFound(_) => (StatusCode::NOT_FOUND, "connection_not_found"),
        Error::ProtocolViolation(_) => (StatusCode::BAD_REQUEST, "protocol_violation"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    warn!("Signaling request failed: {}", error);
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: error.to_string(),
        }),
    )
        .into_response()
}
