//! Root anchoring
//!
//! Checkpoints contiguous chain ranges into Merkle-root anchors and
//! optionally publishes them to an external sink.

pub mod lease;
pub mod root;
pub mod scheduler;
pub mod sink;
pub mod worker;

pub use lease::{DatabaseLease, LeaderLease, LocalLease};
pub use root::{PendingRange, RootAnchor};
pub use scheduler::{IntervalScheduler, ManualScheduler, ManualTrigger, Scheduler};
pub use sink::{AnchorSink, HttpAnchorSink};
pub use worker::{AnchoringWorker, CycleReport, WorkerConfig};
