//! Collaborator contract
//!
//! Business actions record their audit event after their own commit. A
//! failed append must never fail the business action, so failures are
//! handed to an [`UnloggedWriteMonitor`] instead of being returned.

use async_trait::async_trait;
use tracing::error;

use crate::audit::event::{AuditEvent, RecordEventRequest};
use crate::audit::recorder::EventRecorder;
use crate::error::LedgerError;

/// Receives business writes whose audit event could not be recorded
#[async_trait]
pub trait UnloggedWriteMonitor: Send + Sync {
    async fn unlogged_write(&self, request: &RecordEventRequest, error: &LedgerError);
}

/// Reports unlogged writes as structured error logs
#[derive(Debug, Clone, Default)]
pub struct TracingUnloggedWriteMonitor;

#[async_trait]
impl UnloggedWriteMonitor for TracingUnloggedWriteMonitor {
    async fn unlogged_write(&self, request: &RecordEventRequest, error: &LedgerError) {
        error!(
            organization_id = %request.organization_id,
            event_name = %request.event_name,
            target_type = %request.target_type,
            target_id = request.target_id.as_deref().unwrap_or(""),
            idempotency_key = %request.idempotency_key,
            "Business write committed without audit event: {}",
            error
        );
    }
}

/// Record the audit event for an already committed business action.
///
/// Returns the recorded event, or `None` after notifying `monitor`.
pub async fn record_after_commit(
    recorder: &EventRecorder,
    monitor: &dyn UnloggedWriteMonitor,
    request: RecordEventRequest,
) -> Option<AuditEvent> {
    match recorder.record_event(request.clone()).await {
        Ok(event) => Some(event),
        Err(e) => {
            monitor.unlogged_write(&request, &e).await;
            None
        }
    }
}
