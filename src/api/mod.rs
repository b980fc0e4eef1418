//! HTTP surface of the ledger

pub mod auth;
pub mod handlers;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::anchor::sink::AnchorSink;
use crate::audit::recorder::EventRecorder;
use crate::audit::verify::VerificationService;
use crate::database::store::LedgerStore;
use crate::error::LedgerError;

pub use auth::{Claims, OrgAuth, TokenService};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub recorder: EventRecorder,
    pub verifier: VerificationService,
    pub tokens: Arc<TokenService>,
    /// Used to confirm external references of submitted bundles
    pub sink: Option<Arc<dyn AnchorSink>>,
    pub verification_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/v1/organizations/:org/events",
            post(handlers::record_event).get(handlers::list_events),
        )
        .route("/v1/organizations/:org/anchors", get(handlers::list_anchors))
        .route("/v1/organizations/:org/verify", get(handlers::verify_chain))
        .route("/v1/events/:event_id/proof", get(handlers::get_proof))
        .route("/v1/verify", post(handlers::verify))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

impl LedgerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ChainWriteConflict { .. } | Self::AnchorConflict(_) => StatusCode::CONFLICT,
            Self::MalformedProof(_) | Self::InvalidEvent(_) | Self::InvalidRange(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::NotFound(_) | Self::EventNotAnchored(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::AnchorSinkUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::VerificationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ChainBroken { .. } | Self::Config(_) | Self::Database(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::ChainWriteConflict { .. } => "chain_write_conflict",
            Self::ChainBroken { .. } => "chain_broken",
            Self::AnchorSinkUnavailable(_) => "anchor_sink_unavailable",
            Self::MalformedProof(_) => "malformed_proof",
            Self::InvalidEvent(_) => "invalid_event",
            Self::InvalidRange(_) => "invalid_range",
            Self::NotFound(_) => "not_found",
            Self::EventNotAnchored(_) => "event_not_anchored",
            Self::AnchorConflict(_) => "anchor_conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::VerificationTimeout(_) => "verification_timeout",
            Self::Config(_) | Self::Database(_) | Self::Serialization(_) => "internal",
        }
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if matches!(self, Self::Config(_) | Self::Database(_) | Self::Serialization(_)) {
            error!("Request failed: {}", self);
            "internal error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": self.kind(), "message": message }))).into_response()
    }
}
