//! Event Recorder
//!
//! Appends events to per-organization hash chains. Writes are serialized per
//! organization through the store's conditional append; a writer that loses
//! the race re-reads the head and tries again, up to a bounded budget.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audit::event::{AuditEvent, ChainHead, RecordEventRequest};
use crate::database::store::{AppendOutcome, LedgerStore};
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub max_write_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: 5,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

/// Appends events to organization chains
#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<dyn LedgerStore>,
    config: RecorderConfig,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn LedgerStore>, config: RecorderConfig) -> Self {
        Self { store, config }
    }

    /// Append one event, or return the event already recorded under the
    /// request's idempotency key.
    pub async fn record_event(&self, request: RecordEventRequest) -> LedgerResult<AuditEvent> {
        request.validate()?;

        let attempts = self.config.max_write_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(existing) = self
                .store
                .find_by_idempotency_key(&request.organization_id, &request.idempotency_key)
                .await?
            {
                debug!(
                    organization_id = %existing.organization_id,
                    chain_sequence = existing.chain_sequence,
                    "Idempotent replay of {}",
                    request.idempotency_key
                );
                return Ok(existing);
            }

            let head = self.store.chain_head(&request.organization_id).await?;
            let event = AuditEvent::chained(&request, head.as_ref());

            match self.store.append_if_head_matches(&event).await? {
                AppendOutcome::Appended => {
                    info!(
                        organization_id = %event.organization_id,
                        chain_sequence = event.chain_sequence,
                        record_hash = %event.record_hash,
                        "Recorded audit event {}",
                        event.event_name
                    );
                    return Ok(event);
                }
                AppendOutcome::DuplicateIdempotencyKey(existing) => {
                    debug!(
                        organization_id = %existing.organization_id,
                        "Concurrent writer recorded {} first",
                        request.idempotency_key
                    );
                    return Ok(existing);
                }
                AppendOutcome::HeadMoved => {
                    warn!(
                        organization_id = %request.organization_id,
                        attempt,
                        "Chain head moved during append, retrying"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(LedgerError::ChainWriteConflict {
            organization_id: request.organization_id,
            attempts,
        })
    }

    pub async fn chain_head(&self, organization_id: &str) -> LedgerResult<Option<ChainHead>> {
        self.store.chain_head(organization_id).await
    }

    /// Page through a chain in sequence order
    pub async fn list_events(
        &self,
        organization_id: &str,
        from_seq: i64,
        limit: i64,
    ) -> LedgerResult<Vec<AuditEvent>> {
        if from_seq < 1 || limit < 1 {
            return Err(LedgerError::InvalidRange(format!(
                "from_seq must be >= 1 and limit >= 1 (got {} and {})",
                from_seq, limit
            )));
        }
        self.store
            .events_in_range(organization_id, from_seq, from_seq.saturating_add(limit - 1))
            .await
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff.as_millis() as u64;
        let jitter = if base == 0 { 0 } else { rand::thread_rng().gen_range(0..=base) };
        Duration::from_millis(base.saturating_mul(attempt as u64) + jitter)
    }
}
