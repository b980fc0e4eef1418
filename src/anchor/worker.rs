//! Root Anchoring Worker
//!
//! Periodically checkpoints every organization's unanchored events into a
//! root anchor, then pushes anchor roots to the optional external sink.
//! All progress is read back from stored anchors, so a restarted worker
//! resumes exactly where the last committed anchor ended.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::anchor::lease::LeaderLease;
use crate::anchor::root::{PendingRange, RootAnchor};
use crate::anchor::scheduler::Scheduler;
use crate::anchor::sink::AnchorSink;
use crate::audit::event::GENESIS_PREVIOUS_HASH;
use crate::audit::verify::walk_chain;
use crate::database::store::LedgerStore;
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub sink_max_attempts: u32,
    pub sink_backoff: Duration,
    /// Anchors pushed to the sink per cycle at most
    pub receipt_batch: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sink_max_attempts: 3,
            sink_backoff: Duration::from_millis(200),
            receipt_batch: 100,
        }
    }
}

/// What one anchoring cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub lease_held: bool,
    pub anchors_created: usize,
    pub pushes_confirmed: usize,
    pub pushes_deferred: usize,
    pub organizations_skipped: usize,
}

pub struct AnchoringWorker {
    store: Arc<dyn LedgerStore>,
    lease: Arc<dyn LeaderLease>,
    sink: Option<Arc<dyn AnchorSink>>,
    config: WorkerConfig,
}

impl AnchoringWorker {
    pub fn new(store: Arc<dyn LedgerStore>, lease: Arc<dyn LeaderLease>, config: WorkerConfig) -> Self {
        Self {
            store,
            lease,
            sink: None,
            config,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AnchorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run cycles until the scheduler ends or `shutdown` flips to `true`.
    pub async fn run<S: Scheduler>(&self, mut scheduler: S, mut shutdown: watch::Receiver<bool>) {
        info!("Anchoring worker started");
        loop {
            tokio::select! {
                ticked = scheduler.tick() => {
                    if !ticked {
                        break;
                    }
                    match self.run_cycle().await {
                        Ok(report) if report.anchors_created > 0 || report.pushes_deferred > 0 => {
                            info!(?report, "Anchoring cycle finished");
                        }
                        Ok(report) => debug!(?report, "Anchoring cycle finished"),
                        Err(e) => error!("Anchoring cycle failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.lease.release().await {
            warn!("Failed to release anchoring lease: {}", e);
        }
        info!("Anchoring worker stopped");
    }

    /// One anchoring pass over every organization with unanchored events
    pub async fn run_cycle(&self) -> LedgerResult<CycleReport> {
        let mut report = CycleReport::default();
        if !self.lease.try_acquire().await? {
            debug!("Anchoring lease held elsewhere, skipping cycle");
            return Ok(report);
        }
        report.lease_held = true;

        for range in self.store.pending_anchor_ranges().await? {
            match self.anchor_range(&range).await {
                Ok(Some(anchor)) => {
                    info!(
                        organization_id = %anchor.organization_id,
                        range_start_seq = anchor.range_start_seq,
                        range_end_seq = anchor.range_end_seq,
                        root_hash = %anchor.root_hash,
                        "Created root anchor"
                    );
                    report.anchors_created += 1;
                }
                Ok(None) => {}
                Err(e) if e.is_integrity_violation() => {
                    error!("Not anchoring {}: {}", range.organization_id, e);
                    report.organizations_skipped += 1;
                }
                Err(LedgerError::AnchorConflict(detail)) => {
                    warn!("Range already anchored by another writer: {}", detail);
                    report.organizations_skipped += 1;
                }
                Err(e) => {
                    error!("Failed to anchor {}: {}", range.organization_id, e);
                    report.organizations_skipped += 1;
                }
            }
        }

        if let Some(sink) = &self.sink {
            self.push_unacknowledged(sink.as_ref(), &mut report).await?;
        }

        Ok(report)
    }

    /// Check and anchor one pending range; `None` when it holds no events.
    async fn anchor_range(&self, range: &PendingRange) -> LedgerResult<Option<RootAnchor>> {
        let org = &range.organization_id;
        let load_from = (range.range_start_seq - 1).max(1);
        let mut events = self.store.events_in_range(org, load_from, range.range_end_seq).await?;

        let previous_hash = if range.range_start_seq > 1 {
            let has_predecessor = events
                .first()
                .map_or(false, |e| e.chain_sequence == range.range_start_seq - 1);
            if !has_predecessor {
                return Err(LedgerError::ChainBroken {
                    organization_id: org.clone(),
                    sequence: range.range_start_seq - 1,
                    detail: "last anchored event is missing".to_string(),
                });
            }
            events.remove(0).record_hash
        } else {
            GENESIS_PREVIOUS_HASH.to_string()
        };

        if events.is_empty() {
            return Ok(None);
        }

        if let Some((sequence, failure)) =
            walk_chain(&events, range.range_start_seq, range.range_end_seq, &previous_hash)
        {
            return Err(LedgerError::ChainBroken {
                organization_id: org.clone(),
                sequence,
                detail: failure.to_string(),
            });
        }

        let anchor = RootAnchor::over_events(org, &events).map_err(|e| LedgerError::ChainBroken {
            organization_id: org.clone(),
            sequence: range.range_start_seq,
            detail: e.to_string(),
        })?;
        self.store.insert_anchor(&anchor).await?;
        Ok(Some(anchor))
    }

    /// Push every anchor the sink has not acknowledged, oldest first.
    ///
    /// Stops at the first anchor the sink refuses; the rest wait for the
    /// next cycle.
    async fn push_unacknowledged(&self, sink: &dyn AnchorSink, report: &mut CycleReport) -> LedgerResult<()> {
        let pending = self.store.anchors_without_receipt(self.config.receipt_batch).await?;
        for (i, anchor) in pending.iter().enumerate() {
            match self.publish_with_retry(sink, anchor).await {
                Ok(reference) => {
                    self.store.record_anchor_receipt(anchor.id, &reference).await?;
                    report.pushes_confirmed += 1;
                }
                Err(e) => {
                    warn!("Deferring push of {}: {}", anchor.summary(), e);
                    report.pushes_deferred += pending.len() - i;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn publish_with_retry(&self, sink: &dyn AnchorSink, anchor: &RootAnchor) -> LedgerResult<String> {
        let attempts = self.config.sink_max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match sink.publish(anchor).await {
                Ok(reference) => return Ok(reference),
                Err(e) => {
                    debug!(attempt, "Anchor sink publish failed: {}", e);
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                let factor = 1u32 << (attempt - 1).min(16);
                tokio::time::sleep(self.config.sink_backoff.saturating_mul(factor)).await;
            }
        }

        Err(match last_error {
            Some(LedgerError::AnchorSinkUnavailable(detail)) => LedgerError::AnchorSinkUnavailable(detail),
            Some(other) => LedgerError::AnchorSinkUnavailable(other.to_string()),
            None => LedgerError::AnchorSinkUnavailable("no publish attempt made".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::lease::LocalLease;
    use crate::anchor::scheduler::ManualScheduler;
    use crate::audit::event::RecordEventRequest;
    use crate::audit::recorder::{EventRecorder, RecorderConfig};
    use crate::database::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn config() -> WorkerConfig {
        WorkerConfig {
            sink_max_attempts: 2,
            sink_backoff: Duration::from_millis(1),
            receipt_batch: 10,
        }
    }

    async fn record(store: &Arc<MemoryStore>, org: &str, count: usize) {
        let recorder = EventRecorder::new(store.clone(), RecorderConfig::default());
        for _ in 0..count {
            let key = uuid::Uuid::new_v4().to_string();
            recorder
                .record_event(RecordEventRequest::new(org, "job.updated", "job", key))
                .await
                .unwrap();
        }
    }

    /// Sink that is down until `healthy` is set
    #[derive(Default)]
    struct FlakySink {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnchorSink for FlakySink {
        async fn publish(&self, anchor: &RootAnchor) -> LedgerResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(format!("ext-{}", anchor.range_start_seq))
            } else {
                Err(LedgerError::AnchorSinkUnavailable("connection refused".to_string()))
            }
        }

        async fn confirm(&self, _reference: &str) -> LedgerResult<Option<String>> {
            Err(LedgerError::AnchorSinkUnavailable("not used".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cycles_anchor_contiguous_ranges() {
        let store = Arc::new(MemoryStore::new());
        let worker = AnchoringWorker::new(store.clone(), Arc::new(LocalLease), config());

        record(&store, "org-a", 3).await;
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.anchors_created, 1);

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.anchors_created, 0);

        record(&store, "org-a", 2).await;
        worker.run_cycle().await.unwrap();

        let anchors = store.list_anchors("org-a").await.unwrap();
        assert_eq!(anchors.len(), 2);
        assert_eq!((anchors[0].range_start_seq, anchors[0].range_end_seq), (1, 3));
        assert_eq!((anchors[1].range_start_seq, anchors[1].range_end_seq), (4, 5));
    }

    #[tokio::test]
    async fn test_broken_chain_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let worker = AnchoringWorker::new(store.clone(), Arc::new(LocalLease), config());

        record(&store, "org-a", 3).await;
        record(&store, "org-b", 2).await;
        store
            .tamper("org-a", 2, |e| e.event_name = "job.deleted".to_string())
            .await;

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.anchors_created, 1);
        assert_eq!(report.organizations_skipped, 1);
        assert!(store.list_anchors("org-a").await.unwrap().is_empty());
        assert_eq!(store.list_anchors("org-b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_defers_push_but_keeps_anchor() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(FlakySink::default());
        let worker =
            AnchoringWorker::new(store.clone(), Arc::new(LocalLease), config()).with_sink(sink.clone());

        record(&store, "org-a", 2).await;
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.anchors_created, 1);
        assert_eq!(report.pushes_deferred, 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

        let anchor = store.latest_anchor("org-a").await.unwrap().unwrap();
        assert!(anchor.external_reference.is_none());

        sink.healthy.store(true, Ordering::SeqCst);
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.anchors_created, 0);
        assert_eq!(report.pushes_confirmed, 1);

        let anchor = store.latest_anchor("org-a").await.unwrap().unwrap();
        assert_eq!(anchor.external_reference.as_deref(), Some("ext-1"));
    }

    struct NeverLease;

    #[async_trait]
    impl LeaderLease for NeverLease {
        async fn try_acquire(&self) -> LedgerResult<bool> {
            Ok(false)
        }

        async fn release(&self) -> LedgerResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_worker_without_lease_does_nothing() {
        let store = Arc::new(MemoryStore::new());
        record(&store, "org-a", 2).await;

        let worker = AnchoringWorker::new(store.clone(), Arc::new(NeverLease), config());
        let report = worker.run_cycle().await.unwrap();
        assert!(!report.lease_held);
        assert!(store.list_anchors("org-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_when_scheduler_ends() {
        let store = Arc::new(MemoryStore::new());
        record(&store, "org-a", 1).await;

        let worker = AnchoringWorker::new(store.clone(), Arc::new(LocalLease), config());
        let (scheduler, trigger) = ManualScheduler::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        assert!(trigger.fire().await);
        drop(trigger);
        worker.run(scheduler, shutdown_rx).await;

        assert_eq!(store.list_anchors("org-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let worker = AnchoringWorker::new(store, Arc::new(LocalLease), config());
        let (scheduler, _trigger) = ManualScheduler::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { worker.run(scheduler, shutdown_rx).await });
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
