//! Portable proof bundles
//!
//! A bundle carries one event, its inclusion path and the anchor whose root
//! the path leads to. Verifying a bundle needs nothing but the bundle; an
//! anchor sink can optionally be asked to confirm the anchored root.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::anchor::root::RootAnchor;
use crate::anchor::sink::AnchorSink;
use crate::audit::event::{truncate_to_micros, AuditEvent, GENESIS_PREVIOUS_HASH};
use crate::audit::hash;
use crate::audit::merkle::{self, ProofStep};
use crate::error::{LedgerError, LedgerResult};

pub const PROOF_BUNDLE_VERSION: u32 = 1;

/// Anchor as embedded in a proof bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorSummary {
    pub organization_id: String,
    pub range_start_seq: i64,
    pub range_end_seq: i64,
    pub root_hash: String,
    pub anchored_at: DateTime<Utc>,
    pub external_reference: Option<String>,
}

impl From<&RootAnchor> for AnchorSummary {
    fn from(anchor: &RootAnchor) -> Self {
        Self {
            organization_id: anchor.organization_id.clone(),
            range_start_seq: anchor.range_start_seq,
            range_end_seq: anchor.range_end_seq,
            root_hash: anchor.root_hash.clone(),
            anchored_at: anchor.anchored_at,
            external_reference: anchor.external_reference.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofBundle {
    pub version: u32,
    pub event: AuditEvent,
    pub leaf_index: usize,
    pub inclusion_path: Vec<ProofStep>,
    pub anchor: AnchorSummary,
    pub generated_at: DateTime<Utc>,
}

impl ProofBundle {
    pub fn new(event: AuditEvent, leaf_index: usize, inclusion_path: Vec<ProofStep>, anchor: &RootAnchor) -> Self {
        Self {
            version: PROOF_BUNDLE_VERSION,
            event,
            leaf_index,
            inclusion_path,
            anchor: AnchorSummary::from(anchor),
            generated_at: truncate_to_micros(Utc::now()),
        }
    }

    /// Parse a bundle; anything that does not deserialize is malformed.
    pub fn from_json(raw: &str) -> LedgerResult<Self> {
        serde_json::from_str(raw).map_err(|e| LedgerError::malformed_proof(format!("unreadable bundle: {}", e)))
    }

    pub fn to_json_pretty(&self) -> LedgerResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Structural checks that must hold before any hash is recomputed
    pub fn validate_structure(&self) -> LedgerResult<()> {
        if self.version != PROOF_BUNDLE_VERSION {
            return Err(LedgerError::malformed_proof(format!(
                "unsupported bundle version {}",
                self.version
            )));
        }

        let event = &self.event;
        if event.chain_sequence < 1 {
            return Err(LedgerError::malformed_proof("chain_sequence must be >= 1"));
        }
        if !hash::is_valid_hash(&event.record_hash) {
            return Err(LedgerError::malformed_proof("event record_hash is not a sha256 hash"));
        }
        let genesis = event.chain_sequence == 1;
        if genesis && event.previous_hash != GENESIS_PREVIOUS_HASH {
            return Err(LedgerError::malformed_proof("genesis event must have an empty previous_hash"));
        }
        if !genesis && !hash::is_valid_hash(&event.previous_hash) {
            return Err(LedgerError::malformed_proof("event previous_hash is not a sha256 hash"));
        }

        let anchor = &self.anchor;
        if anchor.organization_id != event.organization_id {
            return Err(LedgerError::malformed_proof("anchor belongs to a different organization"));
        }
        if anchor.range_start_seq < 1 || anchor.range_end_seq < anchor.range_start_seq {
            return Err(LedgerError::malformed_proof(format!(
                "invalid anchor range [{}, {}]",
                anchor.range_start_seq, anchor.range_end_seq
            )));
        }
        if !hash::is_valid_hash(&anchor.root_hash) {
            return Err(LedgerError::malformed_proof("anchor root_hash is not a sha256 hash"));
        }
        if event.chain_sequence < anchor.range_start_seq || event.chain_sequence > anchor.range_end_seq {
            return Err(LedgerError::malformed_proof(format!(
                "event sequence {} outside anchor range [{}, {}]",
                event.chain_sequence, anchor.range_start_seq, anchor.range_end_seq
            )));
        }

        let expected_index = (event.chain_sequence - anchor.range_start_seq) as usize;
        if self.leaf_index != expected_index {
            return Err(LedgerError::malformed_proof(format!(
                "leaf_index {} does not match sequence position {}",
                self.leaf_index, expected_index
            )));
        }

        let leaf_count = (anchor.range_end_seq - anchor.range_start_seq + 1) as usize;
        let expected_len = merkle::expected_path_len(leaf_count);
        if self.inclusion_path.len() != expected_len {
            return Err(LedgerError::malformed_proof(format!(
                "inclusion path has {} steps, expected {}",
                self.inclusion_path.len(),
                expected_len
            )));
        }
        if let Some(pos) = self.inclusion_path.iter().position(|s| !hash::is_valid_hash(&s.hash)) {
            return Err(LedgerError::malformed_proof(format!(
                "inclusion path step {} is not a sha256 hash",
                pos
            )));
        }

        Ok(())
    }
}

/// Why a well-formed bundle failed to verify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProofFailure {
    /// The event fields no longer hash to the embedded record hash.
    RecordHashMismatch { stored: String, computed: String },
    /// Walking the path does not reach the anchored root.
    RootMismatch { anchored: String, computed: String },
    /// The external sink holds a different root for the referenced anchor.
    ExternalRootMismatch { reference: String, external: String },
    /// The external sink has no anchor under the bundle's reference.
    ExternalAnchorMissing { reference: String },
}

impl fmt::Display for ProofFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecordHashMismatch { stored, computed } => {
                write!(f, "record hash mismatch: stored {}, computed {}", stored, computed)
            }
            Self::RootMismatch { anchored, computed } => {
                write!(f, "root mismatch: anchored {}, computed {}", anchored, computed)
            }
            Self::ExternalRootMismatch { reference, external } => {
                write!(f, "external anchor {} holds root {}", reference, external)
            }
            Self::ExternalAnchorMissing { reference } => {
                write!(f, "external sink has no anchor {}", reference)
            }
        }
    }
}

/// Outcome of asking the anchor sink about the bundle's anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExternalCheck {
    Confirmed { reference: String },
    Mismatch { reference: String, external_root: String },
    NotFound { reference: String },
    Unavailable { reference: String, detail: String },
    /// The anchor had not been acknowledged by a sink when the bundle was built.
    NoReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofVerification {
    pub valid: bool,
    pub event_id: Uuid,
    pub organization_id: String,
    pub chain_sequence: i64,
    pub reason: Option<ProofFailure>,
    pub external: Option<ExternalCheck>,
}

impl ProofVerification {
    fn for_bundle(bundle: &ProofBundle, reason: Option<ProofFailure>) -> Self {
        Self {
            valid: reason.is_none(),
            event_id: bundle.event.id,
            organization_id: bundle.event.organization_id.clone(),
            chain_sequence: bundle.event.chain_sequence,
            reason,
            external: None,
        }
    }

    pub fn summary(&self) -> String {
        match &self.reason {
            None => format!(
                "✅ Proof valid for {}#{} ({})",
                self.organization_id, self.chain_sequence, self.event_id
            ),
            Some(reason) => format!(
                "❌ Proof invalid for {}#{} ({}): {}",
                self.organization_id, self.chain_sequence, self.event_id, reason
            ),
        }
    }
}

/// Verify a bundle offline.
///
/// Structural problems are errors (`MalformedProof`); hash or root
/// divergence is a result with `valid == false`.
pub fn verify_proof(bundle: &ProofBundle) -> LedgerResult<ProofVerification> {
    bundle.validate_structure()?;

    let computed = bundle.event.compute_hash();
    if computed != bundle.event.record_hash {
        debug!("Bundle event {} does not match its record hash", bundle.event.id);
        return Ok(ProofVerification::for_bundle(
            bundle,
            Some(ProofFailure::RecordHashMismatch {
                stored: bundle.event.record_hash.clone(),
                computed,
            }),
        ));
    }

    let root = merkle::root_from_path(&computed, &bundle.inclusion_path)
        .map_err(|e| LedgerError::malformed_proof(e.to_string()))?;
    if root != bundle.anchor.root_hash {
        debug!("Bundle path for {} does not reach the anchored root", bundle.event.id);
        return Ok(ProofVerification::for_bundle(
            bundle,
            Some(ProofFailure::RootMismatch {
                anchored: bundle.anchor.root_hash.clone(),
                computed: root,
            }),
        ));
    }

    Ok(ProofVerification::for_bundle(bundle, None))
}

/// Verify a bundle, then confirm its anchor with an external sink.
///
/// A sink that disagrees or does not know the reference invalidates the
/// proof; an unreachable sink is reported but does not.
pub async fn verify_proof_with_sink(bundle: &ProofBundle, sink: &dyn AnchorSink) -> LedgerResult<ProofVerification> {
    let mut verification = verify_proof(bundle)?;
    if !verification.valid {
        return Ok(verification);
    }

    let Some(reference) = bundle.anchor.external_reference.clone() else {
        verification.external = Some(ExternalCheck::NoReference);
        return Ok(verification);
    };

    verification.external = Some(match sink.confirm(&reference).await {
        Ok(Some(external_root)) if external_root == bundle.anchor.root_hash => {
            ExternalCheck::Confirmed { reference }
        }
        Ok(Some(external_root)) => {
            warn!("External anchor {} disagrees with bundle root", reference);
            verification.valid = false;
            verification.reason = Some(ProofFailure::ExternalRootMismatch {
                reference: reference.clone(),
                external: external_root.clone(),
            });
            ExternalCheck::Mismatch { reference, external_root }
        }
        Ok(None) => {
            warn!("External sink has no anchor {}", reference);
            verification.valid = false;
            verification.reason = Some(ProofFailure::ExternalAnchorMissing {
                reference: reference.clone(),
            });
            ExternalCheck::NotFound { reference }
        }
        Err(e) => {
            warn!("Could not confirm external anchor {}: {}", reference, e);
            ExternalCheck::Unavailable {
                reference,
                detail: e.to_string(),
            }
        }
    });

    Ok(verification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{ChainHead, RecordEventRequest};
    use crate::audit::merkle::{MerkleTree, Side};
    use async_trait::async_trait;
    use serde_json::json;

    fn chain(len: usize) -> Vec<AuditEvent> {
        let mut events: Vec<AuditEvent> = Vec::new();
        for i in 0..len {
            let req = RecordEventRequest::new("org-a", "signoff.created", "job", format!("k{}", i))
                .metadata(json!({"n": i}));
            let head = events.last().map(ChainHead::from);
            events.push(AuditEvent::chained(&req, head.as_ref()));
        }
        events
    }

    fn bundle_for(events: &[AuditEvent], seq: i64) -> ProofBundle {
        let anchor = RootAnchor::over_events("org-a", events).unwrap();
        let hashes: Vec<String> = events.iter().map(|e| e.record_hash.clone()).collect();
        let index = anchor.leaf_index(seq).unwrap();
        let path = MerkleTree::build(&hashes).unwrap().inclusion_path(index).unwrap();
        ProofBundle::new(events[index].clone(), index, path, &anchor)
    }

    /// Replace the first hex digit after the prefix with a different hex digit.
    fn flip_hex(hash: &str) -> String {
        let mut chars: Vec<char> = hash.chars().collect();
        let pos = hash::HASH_PREFIX.len();
        chars[pos] = if chars[pos] == '0' { '1' } else { '0' };
        chars.into_iter().collect()
    }

    #[test]
    fn test_valid_bundle_verifies() {
        let events = chain(5);
        let verification = verify_proof(&bundle_for(&events, 2)).unwrap();
        assert!(verification.valid, "{}", verification.summary());
        assert_eq!(verification.chain_sequence, 2);
        assert!(verification.reason.is_none());
    }

    #[test]
    fn test_bundle_survives_json_transport() {
        let events = chain(3);
        let bundle = bundle_for(&events, 3);
        let parsed = ProofBundle::from_json(&bundle.to_json_pretty().unwrap()).unwrap();
        assert_eq!(parsed, bundle);
        assert!(verify_proof(&parsed).unwrap().valid);
    }

    #[test]
    fn test_flipped_path_byte_invalidates() {
        let events = chain(3);
        let mut bundle = bundle_for(&events, 2);
        bundle.inclusion_path[0].hash = flip_hex(&bundle.inclusion_path[0].hash);

        let verification = verify_proof(&bundle).unwrap();
        assert!(!verification.valid);
        assert!(matches!(verification.reason, Some(ProofFailure::RootMismatch { .. })));
    }

    #[test]
    fn test_altered_event_invalidates() {
        let events = chain(4);
        let mut bundle = bundle_for(&events, 1);
        bundle.event.metadata = json!({"n": 99});

        let verification = verify_proof(&bundle).unwrap();
        assert!(!verification.valid);
        assert!(matches!(verification.reason, Some(ProofFailure::RecordHashMismatch { .. })));
    }

    #[test]
    fn test_swapped_side_invalidates() {
        let events = chain(4);
        let mut bundle = bundle_for(&events, 3);
        bundle.inclusion_path[0].side = match bundle.inclusion_path[0].side {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        };
        assert!(!verify_proof(&bundle).unwrap().valid);
    }

    #[test]
    fn test_structural_problems_are_malformed() {
        let events = chain(4);

        let mut bundle = bundle_for(&events, 2);
        bundle.inclusion_path.pop();
        assert!(matches!(verify_proof(&bundle), Err(LedgerError::MalformedProof(_))));

        let mut bundle = bundle_for(&events, 2);
        bundle.leaf_index = 3;
        assert!(matches!(verify_proof(&bundle), Err(LedgerError::MalformedProof(_))));

        let mut bundle = bundle_for(&events, 2);
        bundle.inclusion_path[0].hash = "sha256:zz".to_string();
        assert!(matches!(verify_proof(&bundle), Err(LedgerError::MalformedProof(_))));

        let mut bundle = bundle_for(&events, 2);
        bundle.anchor.organization_id = "org-b".to_string();
        assert!(matches!(verify_proof(&bundle), Err(LedgerError::MalformedProof(_))));

        let mut bundle = bundle_for(&events, 2);
        bundle.version = 7;
        assert!(matches!(verify_proof(&bundle), Err(LedgerError::MalformedProof(_))));

        assert!(matches!(
            ProofBundle::from_json("{\"version\": 1}"),
            Err(LedgerError::MalformedProof(_))
        ));
    }

    struct FixedSink(Result<Option<String>, String>);

    #[async_trait]
    impl AnchorSink for FixedSink {
        async fn publish(&self, _anchor: &RootAnchor) -> LedgerResult<String> {
            Ok("ref-1".to_string())
        }

        async fn confirm(&self, _reference: &str) -> LedgerResult<Option<String>> {
            self.0.clone().map_err(LedgerError::AnchorSinkUnavailable)
        }
    }

    #[tokio::test]
    async fn test_sink_confirmation() {
        let events = chain(3);
        let mut bundle = bundle_for(&events, 2);

        let v = verify_proof_with_sink(&bundle, &FixedSink(Ok(None))).await.unwrap();
        assert!(v.valid);
        assert_eq!(v.external, Some(ExternalCheck::NoReference));

        bundle.anchor.external_reference = Some("ref-1".to_string());
        let root = bundle.anchor.root_hash.clone();
        let v = verify_proof_with_sink(&bundle, &FixedSink(Ok(Some(root)))).await.unwrap();
        assert!(v.valid);
        assert!(matches!(v.external, Some(ExternalCheck::Confirmed { .. })));

        let v = verify_proof_with_sink(&bundle, &FixedSink(Err("down".to_string()))).await.unwrap();
        assert!(v.valid);
        assert!(matches!(v.external, Some(ExternalCheck::Unavailable { .. })));

        let other = flip_hex(&bundle.anchor.root_hash);
        let v = verify_proof_with_sink(&bundle, &FixedSink(Ok(Some(other)))).await.unwrap();
        assert!(!v.valid);
        assert!(matches!(v.reason, Some(ProofFailure::ExternalRootMismatch { .. })));

        let v = verify_proof_with_sink(&bundle, &FixedSink(Ok(None))).await.unwrap();
        assert!(!v.valid);
        assert!(matches!(v.reason, Some(ProofFailure::ExternalAnchorMissing { .. })));
        assert_eq!(
            v.external,
            Some(ExternalCheck::NotFound {
                reference: "ref-1".to_string()
            })
        );
    }
}
