//! Anchoring cycle schedulers

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Decides when the anchoring worker runs its next cycle
#[async_trait]
pub trait Scheduler: Send {
    /// Wait for the next cycle. `false` means no further cycles will come.
    async fn tick(&mut self) -> bool;
}

/// Fixed-period scheduler; the first tick fires immediately.
pub struct IntervalScheduler {
    interval: Interval,
}

impl IntervalScheduler {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Scheduler for IntervalScheduler {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Scheduler driven by explicit triggers, for tests and admin tooling
pub struct ManualScheduler {
    triggers: mpsc::Receiver<()>,
}

/// Sending half of a [`ManualScheduler`]
#[derive(Clone)]
pub struct ManualTrigger {
    sender: mpsc::Sender<()>,
}

impl ManualScheduler {
    pub fn new() -> (Self, ManualTrigger) {
        let (sender, triggers) = mpsc::channel(16);
        (Self { triggers }, ManualTrigger { sender })
    }
}

impl ManualTrigger {
    /// Request one cycle; returns `false` once the scheduler is gone.
    pub async fn fire(&self) -> bool {
        self.sender.send(()).await.is_ok()
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    async fn tick(&mut self) -> bool {
        self.triggers.recv().await.is_some()
    }
}
