use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::UNIX_EPOCH;
use tracing::warn;
use uuid::Uuid;

use crate::anchor::root::RootAnchor;
use crate::audit::event::{format_timestamp, parse_timestamp, AuditEvent};
use crate::audit::hash;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub organization_id: String,
    pub chain_sequence: i64,
    pub actor_id: Option<String>,
    pub event_name: String,
    pub target_type: String,
    pub target_id: Option<String>,
    pub category: String,
    pub severity: String,
    pub outcome: String,
    pub metadata: String,
    pub idempotency_key: String,
    pub created_at: String,
    pub previous_hash: String,
    pub record_hash: String,
}

/// Rows are read leniently: a column that no longer parses is replaced by a
/// placeholder that cannot reproduce the stored record hash, so verification
/// reports the row at its sequence instead of the read failing.
impl From<EventRow> for AuditEvent {
    fn from(row: EventRow) -> Self {
        let metadata = serde_json::from_str(&row.metadata).unwrap_or(Value::String(row.metadata));

        AuditEvent {
            id: read_uuid(&row.id, row.chain_sequence),
            organization_id: row.organization_id,
            chain_sequence: row.chain_sequence,
            actor_id: row.actor_id,
            event_name: row.event_name,
            target_type: row.target_type,
            target_id: row.target_id,
            category: row.category,
            severity: row.severity,
            outcome: row.outcome,
            metadata,
            idempotency_key: row.idempotency_key,
            created_at: read_timestamp(&row.created_at, row.chain_sequence),
            previous_hash: row.previous_hash,
            record_hash: row.record_hash,
        }
    }
}

impl From<&AuditEvent> for EventRow {
    fn from(event: &AuditEvent) -> Self {
        EventRow {
            id: event.id.to_string(),
            organization_id: event.organization_id.clone(),
            chain_sequence: event.chain_sequence,
            actor_id: event.actor_id.clone(),
            event_name: event.event_name.clone(),
            target_type: event.target_type.clone(),
            target_id: event.target_id.clone(),
            category: event.category.clone(),
            severity: event.severity.clone(),
            outcome: event.outcome.clone(),
            metadata: hash::canonicalize(&event.metadata),
            idempotency_key: event.idempotency_key.clone(),
            created_at: format_timestamp(&event.created_at),
            previous_hash: event.previous_hash.clone(),
            record_hash: event.record_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnchorRow {
    pub id: String,
    pub organization_id: String,
    pub range_start_seq: i64,
    pub range_end_seq: i64,
    pub root_hash: String,
    pub anchored_at: String,
    pub external_reference: Option<String>,
}

/// Anchor roots are recomputed from events, so an unreadable id or
/// timestamp does not hide a root mismatch.
impl From<AnchorRow> for RootAnchor {
    fn from(row: AnchorRow) -> Self {
        RootAnchor {
            id: read_uuid(&row.id, row.range_start_seq),
            organization_id: row.organization_id,
            range_start_seq: row.range_start_seq,
            range_end_seq: row.range_end_seq,
            root_hash: row.root_hash,
            anchored_at: read_timestamp(&row.anchored_at, row.range_start_seq),
            external_reference: row.external_reference,
        }
    }
}

fn read_uuid(raw: &str, chain_sequence: i64) -> Uuid {
    Uuid::parse_str(raw).unwrap_or_else(|e| {
        warn!(chain_sequence, "Unreadable id {:?} in ledger row: {}", raw, e);
        Uuid::nil()
    })
}

fn read_timestamp(raw: &str, chain_sequence: i64) -> DateTime<Utc> {
    parse_timestamp(raw).unwrap_or_else(|e| {
        warn!(chain_sequence, "{}", e);
        DateTime::<Utc>::from(UNIX_EPOCH)
    })
}
