//! Root Anchors
//!
//! A root anchor checkpoints a contiguous range of one organization's chain
//! with the Merkle root over the range's record hashes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::event::{truncate_to_micros, AuditEvent};
use crate::audit::merkle::{self, MerkleError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootAnchor {
    pub id: Uuid,
    pub organization_id: String,
    pub range_start_seq: i64,
    pub range_end_seq: i64,
    pub root_hash: String,
    pub anchored_at: DateTime<Utc>,
    /// Reference returned by the external anchor sink, once a receipt exists
    pub external_reference: Option<String>,
}

impl RootAnchor {
    /// Anchor a contiguous, ordered slice of events
    pub fn over_events(organization_id: &str, events: &[AuditEvent]) -> Result<Self, MerkleError> {
        let hashes: Vec<String> = events.iter().map(|e| e.record_hash.clone()).collect();
        let root_hash = merkle::compute_merkle_root(&hashes)?;
        let first = &events[0];
        let last = &events[events.len() - 1];

        Ok(Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.to_string(),
            range_start_seq: first.chain_sequence,
            range_end_seq: last.chain_sequence,
            root_hash,
            anchored_at: truncate_to_micros(Utc::now()),
            external_reference: None,
        })
    }

    pub fn leaf_count(&self) -> usize {
        (self.range_end_seq - self.range_start_seq + 1) as usize
    }

    pub fn covers(&self, chain_sequence: i64) -> bool {
        (self.range_start_seq..=self.range_end_seq).contains(&chain_sequence)
    }

    /// Position of `chain_sequence` among this anchor's leaves
    pub fn leaf_index(&self, chain_sequence: i64) -> Option<usize> {
        self.covers(chain_sequence)
            .then(|| (chain_sequence - self.range_start_seq) as usize)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} [{}..={}] root: {}",
            self.organization_id, self.range_start_seq, self.range_end_seq, self.root_hash
        )
    }
}

/// Range of a chain that has events but no anchor yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRange {
    pub organization_id: String,
    pub range_start_seq: i64,
    pub range_end_seq: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{ChainHead, RecordEventRequest};

    fn chain(len: usize) -> Vec<AuditEvent> {
        let mut events: Vec<AuditEvent> = Vec::new();
        for i in 0..len {
            let req = RecordEventRequest::new("org-a", "job.updated", "job", format!("k{}", i));
            let head = events.last().map(ChainHead::from);
            events.push(AuditEvent::chained(&req, head.as_ref()));
        }
        events
    }

    #[test]
    fn test_anchor_over_events() {
        let events = chain(3);
        let anchor = RootAnchor::over_events("org-a", &events).unwrap();
        assert_eq!(anchor.range_start_seq, 1);
        assert_eq!(anchor.range_end_seq, 3);
        assert_eq!(anchor.leaf_count(), 3);
        assert!(anchor.external_reference.is_none());
        assert_eq!(anchor.leaf_index(2), Some(1));
        assert_eq!(anchor.leaf_index(4), None);
    }

    #[test]
    fn test_anchor_over_no_events_fails() {
        assert_eq!(
            RootAnchor::over_events("org-a", &[]).unwrap_err(),
            MerkleError::Empty
        );
    }
}
