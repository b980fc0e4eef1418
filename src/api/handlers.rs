use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::anchor::root::RootAnchor;
use crate::api::{AppState, OrgAuth};
use crate::audit::event::{AuditEvent, RecordEventRequest};
use crate::audit::proof::{verify_proof, verify_proof_with_sink, ProofBundle, ProofVerification};
use crate::audit::verify::ChainVerification;
use crate::error::{LedgerError, LedgerResult};

const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
const MAX_PAGE_SIZE: i64 = 1000;

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecordEventBody {
    pub actor_id: Option<String>,
    pub event_name: String,
    pub target_type: String,
    pub target_id: Option<String>,
    pub category: Option<String>,
    pub severity: Option<String>,
    pub outcome: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub idempotency_key: Option<String>,
}

impl RecordEventBody {
    fn into_request(self, organization_id: String, header_key: Option<String>) -> LedgerResult<RecordEventRequest> {
        let key = self
            .idempotency_key
            .or(header_key)
            .ok_or_else(|| LedgerError::invalid_event("idempotency_key or Idempotency-Key header is required"))?;

        let mut request = RecordEventRequest::new(organization_id, self.event_name, self.target_type, key)
            .metadata(self.metadata);
        request.actor_id = self.actor_id;
        request.target_id = self.target_id;
        if let Some(category) = self.category {
            request.category = category;
        }
        if let Some(severity) = self.severity {
            request.severity = severity;
        }
        if let Some(outcome) = self.outcome {
            request.outcome = outcome;
        }
        Ok(request)
    }
}

pub async fn record_event(
    State(state): State<AppState>,
    OrgAuth(claims): OrgAuth,
    Path(org): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RecordEventBody>,
) -> LedgerResult<(StatusCode, Json<AuditEvent>)> {
    claims.ensure_organization(&org)?;

    let header_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request = body.into_request(org, header_key)?;

    let event = state.recorder.record_event(request).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub from_seq: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn list_events(
    State(state): State<AppState>,
    OrgAuth(claims): OrgAuth,
    Path(org): Path<String>,
    Query(params): Query<PageParams>,
) -> LedgerResult<Json<Vec<AuditEvent>>> {
    claims.ensure_organization(&org)?;

    let from_seq = params.from_seq.unwrap_or(1);
    let limit = params.limit.unwrap_or(100).min(MAX_PAGE_SIZE);
    let events = state.recorder.list_events(&org, from_seq, limit).await?;
    Ok(Json(events))
}

pub async fn list_anchors(
    State(state): State<AppState>,
    OrgAuth(claims): OrgAuth,
    Path(org): Path<String>,
) -> LedgerResult<Json<Vec<RootAnchor>>> {
    claims.ensure_organization(&org)?;
    Ok(Json(state.store.list_anchors(&org).await?))
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub from_seq: Option<i64>,
    pub to_seq: Option<i64>,
}

pub async fn verify_chain(
    State(state): State<AppState>,
    OrgAuth(claims): OrgAuth,
    Path(org): Path<String>,
    Query(params): Query<RangeParams>,
) -> LedgerResult<Json<ChainVerification>> {
    claims.ensure_organization(&org)?;

    let from_seq = params.from_seq.unwrap_or(1);
    let to_seq = params.to_seq.unwrap_or(i64::MAX);
    let report = state
        .verifier
        .verify_chain_with_timeout(&org, from_seq, to_seq, state.verification_timeout)
        .await?;

    info!(organization_id = %org, valid = report.valid, "Chain verification requested by {}", claims.sub);
    Ok(Json(report))
}

pub async fn get_proof(
    State(state): State<AppState>,
    OrgAuth(claims): OrgAuth,
    Path(event_id): Path<Uuid>,
) -> LedgerResult<Json<ProofBundle>> {
    authorize_event(&state, &claims, event_id).await?;
    Ok(Json(state.verifier.build_proof(event_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub event_id: Option<Uuid>,
    /// Kept as raw JSON so an unreadable bundle is reported as malformed
    pub bundle: Option<Value>,
}

/// Public verification: bundles need no token, stored events do.
pub async fn verify(
    State(state): State<AppState>,
    auth: Option<OrgAuth>,
    Json(body): Json<VerifyBody>,
) -> LedgerResult<Json<ProofVerification>> {
    match (body.event_id, body.bundle) {
        (Some(event_id), None) => {
            let OrgAuth(claims) =
                auth.ok_or_else(|| LedgerError::Unauthorized("verifying a stored event requires a token".to_string()))?;
            authorize_event(&state, &claims, event_id).await?;
            Ok(Json(state.verifier.verify_event(event_id).await?))
        }
        (None, Some(raw)) => {
            let bundle: ProofBundle = serde_json::from_value(raw)
                .map_err(|e| LedgerError::malformed_proof(format!("unreadable bundle: {}", e)))?;
            let verification = match &state.sink {
                Some(sink) => verify_proof_with_sink(&bundle, sink.as_ref()).await?,
                None => verify_proof(&bundle)?,
            };
            Ok(Json(verification))
        }
        _ => Err(LedgerError::malformed_proof("provide exactly one of event_id or bundle")),
    }
}

/// Events outside the caller's organization are reported as missing.
async fn authorize_event(state: &AppState, claims: &crate::api::Claims, event_id: Uuid) -> LedgerResult<()> {
    match state.verifier.get_event(event_id).await? {
        Some(event) if event.organization_id == claims.org_id => Ok(()),
        _ => Err(LedgerError::NotFound(format!("event {}", event_id))),
    }
}
