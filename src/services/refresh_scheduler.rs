//! Background task that renews signed links before they lapse, independent of
//! request traffic.

use crate::{
    config::LifecycleConfig,
    services::{
        resource_store::ResourceStore,
        url_lifecycle::{SweepReport, UrlLifecycleManager},
    },
};
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};

pub struct RefreshScheduler {
    manager: UrlLifecycleManager,
    store: Arc<dyn ResourceStore>,
    interval: Duration,
    batch_size: usize,
    cursor: usize,
}

/// Owner of the running scheduler task.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop to stop and wait for it. An in-progress sweep finishes
    /// the records it already started, then returns.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!("refresh scheduler task ended abnormally: {}", err);
        }
    }
}

impl RefreshScheduler {
    pub fn new(
        manager: UrlLifecycleManager,
        store: Arc<dyn ResourceStore>,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            manager,
            store,
            interval: config.sweep_interval,
            batch_size: config.sweep_batch_size.max(1),
            cursor: 0,
        }
    }

    /// Start the loop on the runtime. The first sweep runs one interval from now.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle { shutdown, task }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "refresh scheduler started"
        );
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let stop = shutdown.clone();
                    if AssertUnwindSafe(self.tick(&stop)).catch_unwind().await.is_err() {
                        tracing::error!("refresh sweep panicked; continuing with next tick");
                    }
                }
            }
        }
        tracing::info!("refresh scheduler stopped");
    }

    /// Load the next batch of active records and sweep it.
    ///
    /// The cursor advances by the batch length and wraps to the start once a
    /// short batch shows the end of the table was reached.
    pub async fn tick(&mut self, stop: &watch::Receiver<bool>) -> SweepReport {
        let batch = match self
            .store
            .load_active_batch(self.batch_size, self.cursor)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(offset = self.cursor, "loading sweep batch failed: {}", err);
                return SweepReport::default();
            }
        };

        let offset = self.cursor;
        self.cursor = if batch.len() < self.batch_size {
            0
        } else {
            self.cursor + batch.len()
        };

        let report = self.manager.sweep_stale_until(&batch, stop).await;
        tracing::info!(
            offset,
            examined = batch.len(),
            refreshed = report.refreshed.len(),
            persisted = report.persisted,
            skipped = report.skipped,
            failed = report.failed.len(),
            cancelled = report.cancelled,
            "refresh sweep finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::resource::ResourceRecord,
        services::testing::{MemoryResourceStore, MockGateway, signed_record},
    };
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::Ordering;

    fn config(batch: usize, interval: Duration) -> LifecycleConfig {
        LifecycleConfig {
            refresh_buffer: ChronoDuration::minutes(5),
            sign_ttl: ChronoDuration::hours(1),
            sweep_interval: interval,
            sweep_batch_size: batch,
        }
    }

    fn setup(
        records: Vec<ResourceRecord>,
        cfg: LifecycleConfig,
    ) -> (RefreshScheduler, Arc<MockGateway>, Arc<MemoryResourceStore>) {
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(MemoryResourceStore::with_records(records));
        let manager = UrlLifecycleManager::new(gateway.clone(), store.clone(), cfg);
        (
            RefreshScheduler::new(manager, store.clone(), &cfg),
            gateway,
            store,
        )
    }

    fn stale_records(n: usize) -> Vec<ResourceRecord> {
        (0..n)
            .map(|i| signed_record(&format!("r{i}.pdf"), ChronoDuration::seconds(-1)))
            .collect()
    }

    #[tokio::test]
    async fn batches_cap_each_tick() {
        let records = stale_records(5);
        let (mut scheduler, gateway, store) =
            setup(records.clone(), config(2, Duration::from_secs(60)));
        let (_tx, rx) = watch::channel(false);

        let first = scheduler.tick(&rx).await;
        assert_eq!(first.refreshed.len(), 2);
        let second = scheduler.tick(&rx).await;
        assert_eq!(second.refreshed.len(), 2);
        let third = scheduler.tick(&rx).await;
        assert_eq!(third.refreshed.len(), 1);
        assert_eq!(gateway.signs(), 5);

        for record in &records {
            assert!(!store.get(record.id).is_stale(chrono::Utc::now(), ChronoDuration::minutes(5)));
        }

        // Cursor wrapped: the next pass finds everything fresh.
        let fourth = scheduler.tick(&rx).await;
        assert!(fourth.refreshed.is_empty());
        assert_eq!(fourth.fresh, 2);
        assert_eq!(gateway.signs(), 5);
    }

    #[tokio::test]
    async fn failed_batch_load_does_not_move_cursor() {
        let (mut scheduler, gateway, store) =
            setup(stale_records(3), config(2, Duration::from_secs(60)));
        let (_tx, rx) = watch::channel(false);

        store.fail_batches.store(true, Ordering::SeqCst);
        let report = scheduler.tick(&rx).await;
        assert!(report.refreshed.is_empty());
        assert_eq!(scheduler.cursor, 0);

        store.fail_batches.store(false, Ordering::SeqCst);
        assert_eq!(scheduler.tick(&rx).await.refreshed.len(), 2);
        assert_eq!(gateway.signs(), 2);
    }

    #[tokio::test]
    async fn failing_record_is_retried_next_pass() {
        let records = stale_records(1);
        let (mut scheduler, gateway, store) =
            setup(records.clone(), config(10, Duration::from_secs(60)));
        let (_tx, rx) = watch::channel(false);

        gateway.fail_key("r0.pdf");
        let report = scheduler.tick(&rx).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(store.get(records[0].id).signed_url, records[0].signed_url);

        gateway.heal_key("r0.pdf");
        let report = scheduler.tick(&rx).await;
        assert!(report.refreshed.contains(&records[0].id));
    }

    #[tokio::test]
    async fn spawned_loop_sweeps_and_stops() {
        let records = stale_records(3);
        let (scheduler, gateway, _store) =
            setup(records, config(10, Duration::from_millis(20)));

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("scheduler stops promptly");

        assert_eq!(gateway.signs(), 3);
    }

    #[tokio::test]
    async fn stop_before_first_tick_sweeps_nothing() {
        let (scheduler, gateway, _store) =
            setup(stale_records(2), config(10, Duration::from_secs(3600)));

        let handle = scheduler.spawn();
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("scheduler stops promptly");
        assert_eq!(gateway.signs(), 0);
    }
}
