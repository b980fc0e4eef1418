//! In-memory ledger store
//!
//! Holds every chain in process memory behind one lock. Used by tests and
//! by embedders that want the ledger semantics without a database file.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::anchor::root::{PendingRange, RootAnchor};
use crate::audit::event::{AuditEvent, ChainHead};
use crate::database::store::{AppendOutcome, LedgerStore};
use crate::error::{LedgerError, LedgerResult};

#[derive(Default)]
struct MemoryState {
    /// Per organization, index `i` holds sequence `i + 1`.
    chains: HashMap<String, Vec<AuditEvent>>,
    anchors: HashMap<String, Vec<RootAnchor>>,
    receipts: HashMap<Uuid, String>,
}

impl MemoryState {
    fn with_receipt(&self, anchor: &RootAnchor) -> RootAnchor {
        let mut anchor = anchor.clone();
        anchor.external_reference = self.receipts.get(&anchor.id).cloned();
        anchor
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn event_count(&self) -> usize {
        self.state.read().await.chains.values().map(Vec::len).sum()
    }

    /// Rewrite a stored event in place, as an attacker with storage access would.
    #[cfg(test)]
    pub(crate) async fn tamper<F>(&self, organization_id: &str, chain_sequence: i64, mutate: F)
    where
        F: FnOnce(&mut AuditEvent),
    {
        let mut state = self.state.write().await;
        if let Some(event) = state
            .chains
            .get_mut(organization_id)
            .and_then(|chain| chain.get_mut((chain_sequence - 1) as usize))
        {
            mutate(event);
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn chain_head(&self, organization_id: &str) -> LedgerResult<Option<ChainHead>> {
        let state = self.state.read().await;
        Ok(state
            .chains
            .get(organization_id)
            .and_then(|chain| chain.last())
            .map(ChainHead::from))
    }

    async fn find_by_idempotency_key(
        &self,
        organization_id: &str,
        idempotency_key: &str,
    ) -> LedgerResult<Option<AuditEvent>> {
        let state = self.state.read().await;
        Ok(state.chains.get(organization_id).and_then(|chain| {
            chain
                .iter()
                .find(|e| e.idempotency_key == idempotency_key)
                .cloned()
        }))
    }

    async fn append_if_head_matches(&self, event: &AuditEvent) -> LedgerResult<AppendOutcome> {
        let mut state = self.state.write().await;
        let chain = state.chains.entry(event.organization_id.clone()).or_default();

        if let Some(existing) = chain.iter().find(|e| e.idempotency_key == event.idempotency_key) {
            return Ok(AppendOutcome::DuplicateIdempotencyKey(existing.clone()));
        }

        let (head_seq, head_hash) = chain
            .last()
            .map(|e| (e.chain_sequence, e.record_hash.as_str()))
            .unwrap_or((0, ""));
        if head_seq != event.chain_sequence - 1 || head_hash != event.previous_hash {
            return Ok(AppendOutcome::HeadMoved);
        }

        chain.push(event.clone());
        Ok(AppendOutcome::Appended)
    }

    async fn get_event(&self, event_id: Uuid) -> LedgerResult<Option<AuditEvent>> {
        let state = self.state.read().await;
        Ok(state
            .chains
            .values()
            .flat_map(|chain| chain.iter())
            .find(|e| e.id == event_id)
            .cloned())
    }

    async fn events_in_range(
        &self,
        organization_id: &str,
        from_seq: i64,
        to_seq: i64,
    ) -> LedgerResult<Vec<AuditEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<AuditEvent> = state
            .chains
            .get(organization_id)
            .map(|chain| {
                chain
                    .iter()
                    .filter(|e| e.chain_sequence >= from_seq && e.chain_sequence <= to_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by_key(|e| e.chain_sequence);
        Ok(events)
    }

    async fn latest_anchor(&self, organization_id: &str) -> LedgerResult<Option<RootAnchor>> {
        let state = self.state.read().await;
        Ok(state
            .anchors
            .get(organization_id)
            .and_then(|anchors| anchors.last())
            .map(|a| state.with_receipt(a)))
    }

    async fn anchors_overlapping(
        &self,
        organization_id: &str,
        from_seq: i64,
        to_seq: i64,
    ) -> LedgerResult<Vec<RootAnchor>> {
        let state = self.state.read().await;
        Ok(state
            .anchors
            .get(organization_id)
            .map(|anchors| {
                anchors
                    .iter()
                    .filter(|a| a.range_end_seq >= from_seq && a.range_start_seq <= to_seq)
                    .map(|a| state.with_receipt(a))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn anchor_covering(
        &self,
        organization_id: &str,
        chain_sequence: i64,
    ) -> LedgerResult<Option<RootAnchor>> {
        Ok(self
            .anchors_overlapping(organization_id, chain_sequence, chain_sequence)
            .await?
            .into_iter()
            .next())
    }

    async fn list_anchors(&self, organization_id: &str) -> LedgerResult<Vec<RootAnchor>> {
        let state = self.state.read().await;
        Ok(state
            .anchors
            .get(organization_id)
            .map(|anchors| anchors.iter().map(|a| state.with_receipt(a)).collect())
            .unwrap_or_default())
    }

    async fn pending_anchor_ranges(&self) -> LedgerResult<Vec<PendingRange>> {
        let state = self.state.read().await;
        let mut pending: Vec<PendingRange> = state
            .chains
            .iter()
            .filter_map(|(organization_id, chain)| {
                let head = chain.last()?.chain_sequence;
                let last_end = state
                    .anchors
                    .get(organization_id)
                    .and_then(|anchors| anchors.last())
                    .map_or(0, |a| a.range_end_seq);
                (head > last_end).then(|| PendingRange {
                    organization_id: organization_id.clone(),
                    range_start_seq: last_end + 1,
                    range_end_seq: head,
                })
            })
            .collect();
        pending.sort_by(|a, b| a.organization_id.cmp(&b.organization_id));
        Ok(pending)
    }

    async fn insert_anchor(&self, anchor: &RootAnchor) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        let anchors = state.anchors.entry(anchor.organization_id.clone()).or_default();
        let last_end = anchors.last().map_or(0, |a| a.range_end_seq);

        if anchor.range_start_seq != last_end + 1 || anchor.range_end_seq < anchor.range_start_seq {
            return Err(LedgerError::AnchorConflict(format!(
                "range [{}, {}] for {} does not extend the last anchor",
                anchor.range_start_seq, anchor.range_end_seq, anchor.organization_id
            )));
        }

        let mut stored = anchor.clone();
        stored.external_reference = None;
        anchors.push(stored);
        Ok(())
    }

    async fn anchors_without_receipt(&self, limit: i64) -> LedgerResult<Vec<RootAnchor>> {
        let state = self.state.read().await;
        let mut missing: Vec<RootAnchor> = state
            .anchors
            .values()
            .flat_map(|anchors| anchors.iter())
            .filter(|a| !state.receipts.contains_key(&a.id))
            .cloned()
            .collect();
        missing.sort_by(|a, b| {
            a.anchored_at
                .cmp(&b.anchored_at)
                .then(a.range_start_seq.cmp(&b.range_start_seq))
        });
        missing.truncate(limit.max(0) as usize);
        Ok(missing)
    }

    async fn record_anchor_receipt(&self, anchor_id: Uuid, external_reference: &str) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        state
            .receipts
            .entry(anchor_id)
            .or_insert_with(|| external_reference.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::RecordEventRequest;

    #[tokio::test]
    async fn test_chains_are_independent() {
        let store = MemoryStore::new();
        for org in ["org-a", "org-b"] {
            let req = RecordEventRequest::new(org, "job.created", "job", "k1");
            let event = AuditEvent::chained(&req, None);
            assert_eq!(
                store.append_if_head_matches(&event).await.unwrap(),
                AppendOutcome::Appended
            );
        }

        assert_eq!(store.event_count().await, 2);
        assert_eq!(store.chain_head("org-a").await.unwrap().unwrap().chain_sequence, 1);
        assert_eq!(store.chain_head("org-b").await.unwrap().unwrap().chain_sequence, 1);
        assert_eq!(store.pending_anchor_ranges().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_head_mismatch_rejected() {
        let store = MemoryStore::new();
        let first = AuditEvent::chained(&RecordEventRequest::new("org-a", "e", "t", "k1"), None);
        store.append_if_head_matches(&first).await.unwrap();

        let mut forged = AuditEvent::chained(
            &RecordEventRequest::new("org-a", "e", "t", "k2"),
            Some(&ChainHead::from(&first)),
        );
        forged.previous_hash = "sha256:forged".to_string();
        assert_eq!(
            store.append_if_head_matches(&forged).await.unwrap(),
            AppendOutcome::HeadMoved
        );
    }
}
