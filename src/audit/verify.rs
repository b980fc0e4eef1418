//! Chain Verification
//!
//! Recomputes stored chain segments and anchors and reports the earliest
//! divergence. Also builds proof bundles for anchored events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::anchor::root::RootAnchor;
use crate::audit::event::{AuditEvent, GENESIS_PREVIOUS_HASH};
use crate::audit::merkle::{self, MerkleTree};
use crate::audit::proof::{verify_proof, ProofBundle, ProofVerification};
use crate::database::store::LedgerStore;
use crate::error::{LedgerError, LedgerResult};

/// First divergence found in a chain segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainFailure {
    /// The expected sequence is missing from storage.
    Gap { expected_seq: i64, found_seq: Option<i64> },
    /// Stored fields no longer hash to the stored record hash.
    RecordHashMismatch { stored: String, computed: String },
    /// `previous_hash` does not match the predecessor's record hash.
    LinkMismatch { expected: String, found: String },
    /// The anchor's stored root differs from the root over its current events.
    AnchorRootMismatch {
        anchor_id: Uuid,
        range_start_seq: i64,
        range_end_seq: i64,
        stored: String,
        computed: Option<String>,
    },
}

impl fmt::Display for ChainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gap { expected_seq, found_seq: Some(found) } => {
                write!(f, "sequence gap: expected {}, found {}", expected_seq, found)
            }
            Self::Gap { expected_seq, found_seq: None } => {
                write!(f, "sequence gap: {} is missing", expected_seq)
            }
            Self::RecordHashMismatch { stored, computed } => {
                write!(f, "record hash mismatch: stored {}, computed {}", stored, computed)
            }
            Self::LinkMismatch { expected, found } => {
                write!(f, "previous hash mismatch: expected {:?}, found {:?}", expected, found)
            }
            Self::AnchorRootMismatch {
                range_start_seq,
                range_end_seq,
                stored,
                computed,
                ..
            } => write!(
                f,
                "anchor [{}, {}] root mismatch: stored {}, computed {}",
                range_start_seq,
                range_end_seq,
                stored,
                computed.as_deref().unwrap_or("<unavailable>")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub organization_id: String,
    pub from_seq: i64,
    /// Requested end, clamped to the chain head
    pub to_seq: i64,
    pub valid: bool,
    pub broken_at_seq: Option<i64>,
    pub failure: Option<ChainFailure>,
    pub events_checked: usize,
    pub anchors_checked: usize,
}

impl ChainVerification {
    fn broken(mut self, sequence: i64, failure: ChainFailure) -> Self {
        self.valid = false;
        self.broken_at_seq = Some(sequence);
        self.failure = Some(failure);
        self
    }

    /// Turn a failed verification into `ChainBroken`
    pub fn into_result(self) -> LedgerResult<Self> {
        match (self.broken_at_seq, &self.failure) {
            (Some(sequence), Some(failure)) => Err(LedgerError::ChainBroken {
                organization_id: self.organization_id.clone(),
                sequence,
                detail: failure.to_string(),
            }),
            _ => Ok(self),
        }
    }

    pub fn summary(&self) -> String {
        match (&self.failure, self.broken_at_seq) {
            (Some(failure), Some(seq)) => format!(
                "❌ Chain {} broken at sequence {}: {}",
                self.organization_id, seq, failure
            ),
            _ => format!(
                "✅ Chain {} valid over [{}, {}] ({} events, {} anchors)",
                self.organization_id, self.from_seq, self.to_seq, self.events_checked, self.anchors_checked
            ),
        }
    }
}

/// Contiguity of an organization's anchor ranges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorContinuity {
    pub organization_id: String,
    pub valid: bool,
    pub anchors_checked: usize,
    /// First sequence that is either skipped or anchored twice
    pub broken_at_seq: Option<i64>,
}

/// Read-only integrity checks over a ledger store
#[derive(Clone)]
pub struct VerificationService {
    store: Arc<dyn LedgerStore>,
}

impl VerificationService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Verify `[from_seq, to_seq]` of one chain, including every anchor that
    /// intersects it.
    pub async fn verify_chain(
        &self,
        organization_id: &str,
        from_seq: i64,
        to_seq: i64,
    ) -> LedgerResult<ChainVerification> {
        if from_seq < 1 || to_seq < from_seq {
            return Err(LedgerError::InvalidRange(format!(
                "[{}, {}] is not a valid sequence range",
                from_seq, to_seq
            )));
        }

        let head_seq = self
            .store
            .chain_head(organization_id)
            .await?
            .map_or(0, |head| head.chain_sequence);
        let to_seq = to_seq.min(head_seq);

        let mut report = ChainVerification {
            organization_id: organization_id.to_string(),
            from_seq,
            to_seq,
            valid: true,
            broken_at_seq: None,
            failure: None,
            events_checked: 0,
            anchors_checked: 0,
        };

        if from_seq > to_seq {
            debug!("Range starting at {} is past the head of {}", from_seq, organization_id);
            return Ok(report);
        }

        let load_from = if from_seq > 1 { from_seq - 1 } else { from_seq };
        let mut events = self.store.events_in_range(organization_id, load_from, to_seq).await?;

        let mut previous_hash = GENESIS_PREVIOUS_HASH.to_string();
        if from_seq > 1 {
            let has_predecessor = events.first().map_or(false, |e| e.chain_sequence == from_seq - 1);
            if !has_predecessor {
                let failure = ChainFailure::Gap {
                    expected_seq: from_seq - 1,
                    found_seq: events.first().map(|e| e.chain_sequence),
                };
                return Ok(report.broken(from_seq, failure));
            }
            previous_hash = events.remove(0).record_hash;
        }

        if let Some((sequence, failure)) = walk_chain(&events, from_seq, to_seq, &previous_hash) {
            report.events_checked = (sequence - from_seq) as usize;
            warn!(
                organization_id,
                sequence, "Chain verification failed: {}", failure
            );
            return Ok(report.broken(sequence, failure));
        }
        report.events_checked = events.len();

        let anchors = self.store.anchors_overlapping(organization_id, from_seq, to_seq).await?;
        for anchor in &anchors {
            report.anchors_checked += 1;
            if let Some(failure) = self.check_anchor(anchor).await? {
                let sequence = anchor.range_start_seq.max(from_seq);
                warn!(
                    organization_id,
                    sequence, "Anchor verification failed: {}", failure
                );
                return Ok(report.broken(sequence, failure));
            }
        }

        info!(
            organization_id,
            from_seq,
            to_seq,
            events = report.events_checked,
            anchors = report.anchors_checked,
            "Chain verification successful"
        );
        Ok(report)
    }

    /// `verify_chain` bounded by `timeout`
    pub async fn verify_chain_with_timeout(
        &self,
        organization_id: &str,
        from_seq: i64,
        to_seq: i64,
        timeout: Duration,
    ) -> LedgerResult<ChainVerification> {
        tokio::time::timeout(timeout, self.verify_chain(organization_id, from_seq, to_seq))
            .await
            .map_err(|_| LedgerError::VerificationTimeout(timeout.as_millis() as u64))?
    }

    /// Check that anchor ranges start at 1 and neither skip nor repeat sequences
    pub async fn verify_anchor_continuity(&self, organization_id: &str) -> LedgerResult<AnchorContinuity> {
        let anchors = self.store.list_anchors(organization_id).await?;
        let mut expected_start = 1;
        let mut broken_at_seq = None;

        for anchor in &anchors {
            if anchor.range_start_seq != expected_start || anchor.range_end_seq < anchor.range_start_seq {
                broken_at_seq = Some(expected_start.min(anchor.range_start_seq));
                break;
            }
            expected_start = anchor.range_end_seq + 1;
        }

        Ok(AnchorContinuity {
            organization_id: organization_id.to_string(),
            valid: broken_at_seq.is_none(),
            anchors_checked: anchors.len(),
            broken_at_seq,
        })
    }

    /// Build a portable proof for an anchored event
    pub async fn build_proof(&self, event_id: Uuid) -> LedgerResult<ProofBundle> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("event {}", event_id)))?;

        let anchor = self
            .store
            .anchor_covering(&event.organization_id, event.chain_sequence)
            .await?
            .ok_or_else(|| LedgerError::EventNotAnchored(event_id.to_string()))?;

        let hashes = self.anchored_hashes(&anchor).await?;
        let tree = MerkleTree::build(&hashes).map_err(|e| chain_broken(&anchor, anchor.range_start_seq, e))?;
        if tree.root() != anchor.root_hash {
            return Err(chain_broken(
                &anchor,
                anchor.range_start_seq,
                format!("stored root {} differs from recomputed {}", anchor.root_hash, tree.root()),
            ));
        }

        let leaf_index = anchor
            .leaf_index(event.chain_sequence)
            .ok_or_else(|| LedgerError::EventNotAnchored(event_id.to_string()))?;
        let path = tree
            .inclusion_path(leaf_index)
            .map_err(|e| chain_broken(&anchor, event.chain_sequence, e))?;

        debug!(
            "Built proof for {} with {} path steps",
            event.summary(),
            path.len()
        );
        Ok(ProofBundle::new(event, leaf_index, path, &anchor))
    }

    /// Build and immediately verify the proof of a stored event
    pub async fn verify_event(&self, event_id: Uuid) -> LedgerResult<ProofVerification> {
        let bundle = self.build_proof(event_id).await?;
        verify_proof(&bundle)
    }

    pub async fn get_event(&self, event_id: Uuid) -> LedgerResult<Option<AuditEvent>> {
        self.store.get_event(event_id).await
    }

    async fn check_anchor(&self, anchor: &RootAnchor) -> LedgerResult<Option<ChainFailure>> {
        let mismatch = |computed: Option<String>| ChainFailure::AnchorRootMismatch {
            anchor_id: anchor.id,
            range_start_seq: anchor.range_start_seq,
            range_end_seq: anchor.range_end_seq,
            stored: anchor.root_hash.clone(),
            computed,
        };

        let hashes = match self.anchored_hashes(anchor).await {
            Ok(hashes) => hashes,
            Err(LedgerError::ChainBroken { .. }) => return Ok(Some(mismatch(None))),
            Err(e) => return Err(e),
        };
        match merkle::compute_merkle_root(&hashes) {
            Ok(root) if root == anchor.root_hash => Ok(None),
            Ok(root) => Ok(Some(mismatch(Some(root)))),
            Err(_) => Ok(Some(mismatch(None))),
        }
    }

    /// Record hashes of every event an anchor covers, in order
    async fn anchored_hashes(&self, anchor: &RootAnchor) -> LedgerResult<Vec<String>> {
        let events = self
            .store
            .events_in_range(&anchor.organization_id, anchor.range_start_seq, anchor.range_end_seq)
            .await?;

        let contiguous = events.len() == anchor.leaf_count()
            && events
                .iter()
                .zip(anchor.range_start_seq..)
                .all(|(e, seq)| e.chain_sequence == seq);
        if !contiguous {
            return Err(chain_broken(
                anchor,
                anchor.range_start_seq,
                format!("anchored range holds {} of {} events", events.len(), anchor.leaf_count()),
            ));
        }

        Ok(events.into_iter().map(|e| e.record_hash).collect())
    }
}

/// Walk events expected to hold `[from_seq, to_seq]` in order.
///
/// Returns the first divergent sequence and why.
pub fn walk_chain(
    events: &[AuditEvent],
    from_seq: i64,
    to_seq: i64,
    previous_hash: &str,
) -> Option<(i64, ChainFailure)> {
    let mut expected_seq = from_seq;
    let mut previous_hash = previous_hash.to_string();

    for event in events {
        if event.chain_sequence != expected_seq {
            return Some((
                expected_seq,
                ChainFailure::Gap {
                    expected_seq,
                    found_seq: Some(event.chain_sequence),
                },
            ));
        }

        let computed = event.compute_hash();
        if computed != event.record_hash {
            return Some((
                expected_seq,
                ChainFailure::RecordHashMismatch {
                    stored: event.record_hash.clone(),
                    computed,
                },
            ));
        }

        if event.previous_hash != previous_hash {
            return Some((
                expected_seq,
                ChainFailure::LinkMismatch {
                    expected: previous_hash,
                    found: event.previous_hash.clone(),
                },
            ));
        }

        previous_hash = event.record_hash.clone();
        expected_seq += 1;
    }

    (expected_seq <= to_seq).then(|| {
        (
            expected_seq,
            ChainFailure::Gap {
                expected_seq,
                found_seq: None,
            },
        )
    })
}

fn chain_broken(anchor: &RootAnchor, sequence: i64, detail: impl ToString) -> LedgerError {
    LedgerError::ChainBroken {
        organization_id: anchor.organization_id.clone(),
        sequence,
        detail: detail.to_string(),
    }
}
