// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Poll-reconcile loop shared by every worker.
//!
//! A worker waits out a startup grace delay, then runs one reconcile cycle
//! per period. The wait after a cycle is shortened by the time the cycle
//! took, so a slow cycle does not push every later one back. Cancellation is
//! observed only while waiting and at the top of an iteration; a cycle that
//! has started runs to the end of its batch.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::metrics::WorkerMetrics;

/// One domain's reconciliation logic.
#[async_trait]
pub trait Reconciler: Send + 'static {
    /// Worker name for logs.
    fn name(&self) -> &'static str;

    /// Run one poll-filter-act-persist pass.
    ///
    /// Per-item failures are counted in the report, not returned. An `Err`
    /// means the cycle could not run at all (for example the store is down).
    async fn reconcile(&mut self) -> Result<CycleReport>;

    /// Instruments the loop records cycle timing and outcomes on.
    fn metrics(&self) -> Option<&WorkerMetrics> {
        None
    }
}

/// Counters for one reconcile cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Items picked up.
    pub processed: usize,
    /// Items whose action completed.
    pub succeeded: usize,
    /// Items whose action failed and stay pending.
    pub failed: usize,
    /// Items left alone this cycle.
    pub skipped: usize,
}

impl CycleReport {
    /// Count a completed item.
    pub fn succeed(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    /// Count a failed item.
    pub fn fail(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    /// Count a skipped item.
    pub fn skip(&mut self) {
        self.processed += 1;
        self.skipped += 1;
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: CycleReport) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    /// Whether the cycle found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.processed == 0
    }
}

/// Worker timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Wait before the loop starts
    pub startup_delay: Duration,
    /// Target time between cycle starts
    pub period: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(10),
            period: Duration::from_secs(10),
        }
    }
}

/// How a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Worker name.
    pub worker: &'static str,
    /// Cycles run before cancellation.
    pub cycles: u64,
}

/// Worker task errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The task panicked or was aborted instead of returning.
    #[error("worker {worker} did not exit cleanly: {message}")]
    Join {
        /// Worker name.
        worker: &'static str,
        /// Join error text.
        message: String,
    },
}

/// Run `reconciler` until `cancel` fires.
pub async fn run_loop<R: Reconciler>(
    mut reconciler: R,
    config: WorkerConfig,
    cancel: CancellationToken,
) -> WorkerExit {
    let worker = reconciler.name();
    info!(
        worker,
        startup_delay_secs = config.startup_delay.as_secs(),
        period_ms = config.period.as_millis() as u64,
        "Worker started"
    );

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!(worker, "Worker cancelled before first cycle");
            return WorkerExit { worker, cycles: 0 };
        }
        _ = tokio::time::sleep(config.startup_delay) => {}
    }

    let mut cycles = 0;
    let mut wait = config.period;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if cancel.is_cancelled() {
            break;
        }

        let started = Instant::now();
        let result = reconciler.reconcile().await;
        if let Some(metrics) = reconciler.metrics() {
            metrics.record_cycle(worker, started.elapsed(), result.as_ref().ok());
        }
        match result {
            Ok(report) if report.is_empty() => {
                debug!(worker, "Nothing to reconcile");
            }
            Ok(report) => {
                info!(
                    worker,
                    processed = report.processed,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Reconcile cycle finished"
                );
            }
            Err(e) => {
                error!(worker, error = %e, "Reconcile cycle failed");
            }
        }
        cycles += 1;

        wait = config.period.saturating_sub(started.elapsed());
    }

    info!(worker, cycles, "Worker stopped");
    WorkerExit { worker, cycles }
}

/// A spawned worker loop.
pub struct WorkerHandle {
    worker: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    /// Spawn `reconciler` on the current runtime.
    pub fn spawn<R: Reconciler>(reconciler: R, config: WorkerConfig) -> Self {
        Self::spawn_with_token(reconciler, config, CancellationToken::new())
    }

    /// Spawn `reconciler`, stopping when `cancel` fires.
    pub fn spawn_with_token<R: Reconciler>(
        reconciler: R,
        config: WorkerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let worker = reconciler.name();
        let handle = tokio::spawn(run_loop(reconciler, config, cancel.clone()));
        Self {
            worker,
            cancel,
            handle,
        }
    }

    /// Worker name.
    pub fn name(&self) -> &'static str {
        self.worker
    }

    /// Ask the loop to stop at its next boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the loop has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to return.
    pub async fn join(self) -> std::result::Result<WorkerExit, WorkerError> {
        self.handle.await.map_err(|e| WorkerError::Join {
            worker: self.worker,
            message: e.to_string(),
        })
    }

    /// Cancel, then wait for the loop to return.
    pub async fn shutdown(self) -> std::result::Result<WorkerExit, WorkerError> {
        self.cancel();
        self.join().await
    }
}
