//! Audit Events
//!
//! Defines the immutable ledger record and the request collaborators
//! submit to have one appended.

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::audit::hash::{self, RecordFields};
use crate::error::{LedgerError, LedgerResult};

/// Previous hash of the genesis event.
pub const GENESIS_PREVIOUS_HASH: &str = "";

/// Immutable, hash-chained ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub organization_id: String,
    pub chain_sequence: i64,
    pub actor_id: Option<String>,
    pub event_name: String,
    pub target_type: String,
    pub target_id: Option<String>,
    pub category: String,
    pub severity: String,
    pub outcome: String,
    pub metadata: Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub previous_hash: String,
    pub record_hash: String,
}

impl AuditEvent {
    /// Build the next event of a chain from a request and the current head.
    ///
    /// `head` is `None` for the genesis event.
    pub fn chained(request: &RecordEventRequest, head: Option<&ChainHead>) -> Self {
        let (chain_sequence, previous_hash) = match head {
            Some(head) => (head.chain_sequence + 1, head.record_hash.clone()),
            None => (1, GENESIS_PREVIOUS_HASH.to_string()),
        };

        let mut event = Self {
            id: Uuid::new_v4(),
            organization_id: request.organization_id.clone(),
            chain_sequence,
            actor_id: request.actor_id.clone(),
            event_name: request.event_name.clone(),
            target_type: request.target_type.clone(),
            target_id: request.target_id.clone(),
            category: request.category.clone(),
            severity: request.severity.clone(),
            outcome: request.outcome.clone(),
            metadata: normalize_metadata(&request.metadata),
            idempotency_key: request.idempotency_key.clone(),
            created_at: truncate_to_micros(Utc::now()),
            previous_hash,
            record_hash: String::new(),
        };

        event.record_hash = event.compute_hash();
        event
    }

    /// Fields committed by the record hash
    pub fn record_fields(&self) -> RecordFields<'_> {
        RecordFields {
            organization_id: &self.organization_id,
            chain_sequence: self.chain_sequence,
            event_name: &self.event_name,
            target_type: &self.target_type,
            target_id: self.target_id.as_deref().unwrap_or(""),
            metadata: &self.metadata,
            actor_id: self.actor_id.as_deref().unwrap_or(""),
            category: &self.category,
            severity: &self.severity,
            outcome: &self.outcome,
            created_at: format_timestamp(&self.created_at),
            event_id: self.id.to_string(),
            idempotency_key: &self.idempotency_key,
        }
    }

    /// Recompute the record hash from the stored fields
    pub fn compute_hash(&self) -> String {
        hash::compute_record_hash(&self.record_fields(), &self.previous_hash)
    }

    /// Verify the stored record hash
    pub fn verify_hash(&self) -> bool {
        self.record_hash == self.compute_hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.chain_sequence == 1
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{}#{} {} on {}:{} ({})",
            self.organization_id,
            self.chain_sequence,
            self.event_name,
            self.target_type,
            self.target_id.as_deref().unwrap_or("-"),
            self.record_hash
        )
    }
}

/// Position of the newest event in an organization's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub organization_id: String,
    pub chain_sequence: i64,
    pub record_hash: String,
}

impl From<&AuditEvent> for ChainHead {
    fn from(event: &AuditEvent) -> Self {
        Self {
            organization_id: event.organization_id.clone(),
            chain_sequence: event.chain_sequence,
            record_hash: event.record_hash.clone(),
        }
    }
}

/// Request to append one event to an organization's chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEventRequest {
    pub organization_id: String,
    pub actor_id: Option<String>,
    pub event_name: String,
    pub target_type: String,
    pub target_id: Option<String>,
    pub category: String,
    pub severity: String,
    pub outcome: String,
    pub metadata: Value,
    pub idempotency_key: String,
}

impl RecordEventRequest {
    /// Request with default classification (`governance` / `info` / `success`)
    pub fn new(
        organization_id: impl Into<String>,
        event_name: impl Into<String>,
        target_type: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            actor_id: None,
            event_name: event_name.into(),
            target_type: target_type.into(),
            target_id: None,
            category: "governance".to_string(),
            severity: "info".to_string(),
            outcome: "success".to_string(),
            metadata: Value::Object(Default::default()),
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn classified(
        mut self,
        category: impl Into<String>,
        severity: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        self.category = category.into();
        self.severity = severity.into();
        self.outcome = outcome.into();
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn validate(&self) -> LedgerResult<()> {
        let required = [
            ("organization_id", &self.organization_id),
            ("event_name", &self.event_name),
            ("target_type", &self.target_type),
            ("category", &self.category),
            ("severity", &self.severity),
            ("outcome", &self.outcome),
            ("idempotency_key", &self.idempotency_key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(LedgerError::invalid_event(format!("{} must not be empty", name)));
            }
        }

        match &self.metadata {
            Value::Object(_) | Value::Null => Ok(()),
            other => Err(LedgerError::invalid_event(format!(
                "metadata must be a JSON object, got {}",
                json_kind(other)
            ))),
        }
    }
}

/// Store metadata in its canonical shape so a re-read event equals the written one.
fn normalize_metadata(metadata: &Value) -> Value {
    match metadata {
        Value::Null => Value::Object(Default::default()),
        other => serde_json::from_str(&hash::canonicalize(other)).unwrap_or_else(|_| other.clone()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Ledger timestamps carry microsecond precision so their text form round-trips.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.nanosecond();
    ts.with_nanosecond(nanos - nanos % 1_000).unwrap_or(ts)
}

/// Canonical text form of a ledger timestamp
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::Serialization(format!("Invalid timestamp {:?}: {}", raw, e)))
}
