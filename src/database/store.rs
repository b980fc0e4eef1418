//! Ledger storage interface
//!
//! The recorder, anchoring worker and verification service only talk to
//! storage through this trait. Any transactional store can implement it as
//! long as `append_if_head_matches` and `insert_anchor` are conditional,
//! atomic writes.

use async_trait::async_trait;
use uuid::Uuid;

use crate::anchor::root::{PendingRange, RootAnchor};
use crate::audit::event::{AuditEvent, ChainHead};
use crate::error::LedgerResult;

/// Result of a conditional append
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended,
    /// Another write moved the head between read and append.
    HeadMoved,
    /// The idempotency key was taken by a concurrent writer; carries its event.
    DuplicateIdempotencyKey(AuditEvent),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Newest event position of an organization's chain
    async fn chain_head(&self, organization_id: &str) -> LedgerResult<Option<ChainHead>>;

    async fn find_by_idempotency_key(
        &self,
        organization_id: &str,
        idempotency_key: &str,
    ) -> LedgerResult<Option<AuditEvent>>;

    /// Append `event` only if the chain head is still at
    /// `(event.chain_sequence - 1, event.previous_hash)`.
    async fn append_if_head_matches(&self, event: &AuditEvent) -> LedgerResult<AppendOutcome>;

    async fn get_event(&self, event_id: Uuid) -> LedgerResult<Option<AuditEvent>>;

    /// Events with `from_seq <= chain_sequence <= to_seq`, ascending
    async fn events_in_range(
        &self,
        organization_id: &str,
        from_seq: i64,
        to_seq: i64,
    ) -> LedgerResult<Vec<AuditEvent>>;

    async fn latest_anchor(&self, organization_id: &str) -> LedgerResult<Option<RootAnchor>>;

    /// Anchors intersecting `[from_seq, to_seq]`, ascending
    async fn anchors_overlapping(
        &self,
        organization_id: &str,
        from_seq: i64,
        to_seq: i64,
    ) -> LedgerResult<Vec<RootAnchor>>;

    async fn anchor_covering(
        &self,
        organization_id: &str,
        chain_sequence: i64,
    ) -> LedgerResult<Option<RootAnchor>>;

    async fn list_anchors(&self, organization_id: &str) -> LedgerResult<Vec<RootAnchor>>;

    /// Every organization whose head is past its last anchored sequence
    async fn pending_anchor_ranges(&self) -> LedgerResult<Vec<PendingRange>>;

    /// Insert an anchor only if it starts right after the organization's last
    /// anchored sequence. Fails with `AnchorConflict` otherwise.
    async fn insert_anchor(&self, anchor: &RootAnchor) -> LedgerResult<()>;

    /// Anchors the external sink has not acknowledged yet, oldest first
    async fn anchors_without_receipt(&self, limit: i64) -> LedgerResult<Vec<RootAnchor>>;

    async fn record_anchor_receipt(&self, anchor_id: Uuid, external_reference: &str) -> LedgerResult<()>;
}
