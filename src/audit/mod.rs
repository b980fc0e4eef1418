//! Audit Ledger
//!
//! Hash-chained audit events per organization, the recorder that appends
//! them, and the verification service that proves they were not altered.

pub mod collaborator;
pub mod event;
pub mod hash;
pub mod merkle;
pub mod proof;
pub mod recorder;
pub mod verify;

pub use collaborator::{record_after_commit, TracingUnloggedWriteMonitor, UnloggedWriteMonitor};
pub use event::{AuditEvent, ChainHead, RecordEventRequest};
pub use merkle::{compute_merkle_root, verify_inclusion, MerkleTree, ProofStep, Side};
pub use proof::{verify_proof, verify_proof_with_sink, ProofBundle, ProofVerification};
pub use recorder::{EventRecorder, RecorderConfig};
pub use verify::{ChainFailure, ChainVerification, VerificationService};
