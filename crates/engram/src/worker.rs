//! Background worker
//!
//! One task drives all asynchronous maintenance: the scheduled compaction
//! cycle, threshold-triggered compaction of single conversations, and the
//! repair sweep with its consistency check. Requests and ingestion never wait
//! on it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{debug, info, warn};

use crate::service::MemoryService;

/// Capacity of the threshold-trigger queue
pub const TRIGGER_QUEUE_CAPACITY: usize = 64;

pub struct BackgroundWorker {
    service: Arc<MemoryService>,
    triggers: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(
        service: Arc<MemoryService>,
        triggers: mpsc::Receiver<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            service,
            triggers,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Loop until the shutdown channel flips or its sender is dropped
    pub async fn run(mut self) {
        let config = self.service.config().clone();
        let compaction_enabled = config.compaction.enabled;

        // First compaction waits a full period; the repair sweep runs at startup
        let compaction_period = Duration::from_secs(config.compaction.interval_secs.max(1));
        let mut compaction_tick = interval_at(Instant::now() + compaction_period, compaction_period);
        compaction_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut repair_tick = interval(Duration::from_secs(config.ingestion.repair_interval_secs.max(1)));
        repair_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Background worker started (compaction every {}s{}, repair every {}s)",
            config.compaction.interval_secs,
            if compaction_enabled { "" } else { ", disabled" },
            config.ingestion.repair_interval_secs
        );

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = compaction_tick.tick(), if compaction_enabled => {
                    if let Err(e) = self.service.compact_all().await {
                        warn!("Scheduled compaction failed: {e}");
                    }
                }
                Some(conversation_id) = self.triggers.recv(), if compaction_enabled => {
                    debug!("Threshold compaction for {conversation_id}");
                    if let Err(e) = self.service.compact_conversation(&conversation_id).await {
                        warn!("Compaction of {conversation_id} failed: {e}");
                    }
                }
                _ = repair_tick.tick() => {
                    self.run_repair(config.ingestion.verify_sample_size).await;
                }
            }
        }

        info!("Background worker stopped");
    }

    async fn run_repair(&self, verify_sample_size: usize) {
        match self.service.verify_consistency(verify_sample_size).await {
            Ok(report) if !report.missing.is_empty() => {
                warn!("{} indexed records had no vector, queued for re-indexing", report.missing.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Consistency check failed: {e}"),
        }

        if let Err(e) = self.service.repair().await {
            warn!("Repair sweep failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Speaker;
    use crate::storage::DurableStore;
    use crate::testing::TestHarness;

    #[tokio::test]
    async fn test_trigger_compacts_conversation() {
        let (tx, rx) = mpsc::channel(TRIGGER_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let h = TestHarness::new(TestHarness::compacting_config(3));
        let service = Arc::new(h.service.with_compaction_trigger(tx));

        let handle = BackgroundWorker::new(service.clone(), rx, shutdown_rx).spawn();

        for text in ["hello", "I like tea", "my name is Ana", "I work remotely"] {
            service.ingest("c1", Speaker::User, text, None).await.unwrap();
        }

        let mut summaries = 0;
        for _ in 0..100 {
            summaries = h.store.stats().await.unwrap().summaries;
            if summaries > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(summaries, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_shutdown_sender_dropped() {
        let (_tx, rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let h = TestHarness::new(TestHarness::compacting_config(100));

        let handle = BackgroundWorker::new(Arc::new(h.service), rx, shutdown_rx).spawn();
        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
