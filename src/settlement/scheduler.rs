// Reconciliation scheduler - runs reconciliation passes in the background
//
// A pass runs on every interval tick and whenever `SchedulerHandle::trigger`
// is called. Triggers that arrive while a pass is queued collapse into that pass.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::settlement::reconciler::Reconciler;

/// Handle to a running scheduler
pub struct SchedulerHandle {
    trigger: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request an immediate pass. Returns false when one is already queued
    /// or the scheduler has stopped.
    pub fn trigger(&self) -> bool {
        self.trigger.try_send(()).is_ok()
    }

    /// Stop after the pass in progress, if any, and wait for the task to end
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!("❌ Reconciliation scheduler task failed: {:?}", e);
        }
    }
}

pub struct ReconciliationScheduler {
    interval: Duration,
    reconciler: Arc<Reconciler>,
}

impl ReconciliationScheduler {
    pub fn new(interval: Duration, reconciler: Arc<Reconciler>) -> Self {
        Self {
            interval,
            reconciler,
        }
    }

    /// Start the scheduler (runs in background). The first pass runs immediately.
    pub fn start(self) -> SchedulerHandle {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(
            "⏰ Reconciliation scheduled every {:?}",
            self.interval
        );

        let join = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                    Some(()) = trigger_rx.recv() => {
                        info!("🔔 Reconciliation triggered");
                    }
                }

                Self::run_pass(&self.reconciler).await;
            }

            info!("Reconciliation scheduler stopped");
        });

        SchedulerHandle {
            trigger: trigger_tx,
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run_pass(reconciler: &Reconciler) {
        match reconciler.run_reconciliation().await {
            Ok(report) if report.errors > 0 => {
                error!("❌ Reconciliation pass finished with {} errors", report.errors);
            }
            Ok(_) => {}
            Err(e) => error!("❌ Reconciliation pass failed: {:?}", e),
        }
    }
}
