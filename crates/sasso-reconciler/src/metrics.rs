// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker metrics on the OpenTelemetry meter API.
//!
//! Instruments are created against whatever meter provider is installed.
//! Without one (no `OTEL_EXPORTER_OTLP_ENDPOINT`) the global provider is a
//! no-op and recording costs next to nothing.
//!
//! | Instrument | Kind | Attributes |
//! |------------|------|------------|
//! | `sasso_worker_step_duration_seconds` | histogram | `worker`, `function` |
//! | `sasso_worker_cycle_duration_seconds` | histogram | `worker` |
//! | `sasso_worker_items_total` | counter | `worker`, `outcome` |
//! | `sasso_objects` | gauge | `object` |
//! | `sasso_notifications` | gauge | `status`, `email`, `telegram` |

use std::future::Future;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use sasso_core::store::{NotificationCountRecord, ObjectCounts};
use tokio::time::Instant;

use crate::worker::CycleReport;

/// Instrumentation scope of every sasso instrument.
pub const METER_NAME: &str = "sasso-reconciler";

/// Handles to the worker instruments. Cheap to clone.
#[derive(Clone)]
pub struct WorkerMetrics {
    step_duration: Histogram<f64>,
    cycle_duration: Histogram<f64>,
    items: Counter<u64>,
    objects: Gauge<u64>,
    notifications: Gauge<u64>,
}

impl WorkerMetrics {
    /// Create the instruments on `meter`.
    pub fn new(meter: &Meter) -> Self {
        Self {
            step_duration: meter
                .f64_histogram("sasso_worker_step_duration_seconds")
                .with_unit("s")
                .with_description("Duration of one reconcile step")
                .build(),
            cycle_duration: meter
                .f64_histogram("sasso_worker_cycle_duration_seconds")
                .with_unit("s")
                .with_description("Duration of one full reconcile cycle")
                .build(),
            items: meter
                .u64_counter("sasso_worker_items_total")
                .with_description("Items handled by reconcile cycles")
                .build(),
            objects: meter
                .u64_gauge("sasso_objects")
                .with_description("Rows per reconciled resource")
                .build(),
            notifications: meter
                .u64_gauge("sasso_notifications")
                .with_description("Notifications per status and channel")
                .build(),
        }
    }

    /// Instruments on the global meter provider.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter(METER_NAME))
    }

    /// Run `step` and record how long it took.
    pub async fn step<F: Future>(&self, worker: &'static str, function: &'static str, step: F) -> F::Output {
        let started = Instant::now();
        let output = step.await;
        self.step_duration.record(
            started.elapsed().as_secs_f64(),
            &[
                KeyValue::new("worker", worker),
                KeyValue::new("function", function),
            ],
        );
        output
    }

    /// Record a finished cycle. `report` is `None` when the cycle failed.
    pub fn record_cycle(&self, worker: &'static str, elapsed: Duration, report: Option<&CycleReport>) {
        self.cycle_duration
            .record(elapsed.as_secs_f64(), &[KeyValue::new("worker", worker)]);

        let Some(report) = report else {
            return;
        };
        for (outcome, count) in [
            ("succeeded", report.succeeded),
            ("failed", report.failed),
            ("skipped", report.skipped),
        ] {
            if count > 0 {
                self.items.add(
                    count as u64,
                    &[
                        KeyValue::new("worker", worker),
                        KeyValue::new("outcome", outcome),
                    ],
                );
            }
        }
    }

    /// Record the current row counts.
    pub fn record_objects(&self, counts: &ObjectCounts) {
        for (object, count) in [
            ("vms", counts.vms),
            ("interfaces", counts.vm_interfaces),
            ("vnets", counts.nets),
            ("port_forwards", counts.port_forwards),
        ] {
            self.objects
                .record(count.max(0) as u64, &[KeyValue::new("object", object)]);
        }
    }

    /// Record notification counts.
    pub fn record_notifications(&self, counts: &[NotificationCountRecord]) {
        for group in counts {
            self.notifications.record(
                group.count.max(0) as u64,
                &[
                    KeyValue::new("status", group.status.as_str()),
                    KeyValue::new("email", group.email),
                    KeyValue::new("telegram", group.telegram),
                ],
            );
        }
    }
}

/// Run `step`, timing it when `metrics` is set.
pub async fn timed<F: Future>(
    metrics: Option<&WorkerMetrics>,
    worker: &'static str,
    function: &'static str,
    step: F,
) -> F::Output {
    match metrics {
        Some(metrics) => metrics.step(worker, function, step).await,
        None => step.await,
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::global()
    }
}
