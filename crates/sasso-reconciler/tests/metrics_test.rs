// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker metrics recorded against an in-memory exporter.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::TestContext;
use opentelemetry::metrics::MeterProvider;
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};
use sasso_core::ResourceStatus;
use sasso_reconciler::WorkerMetrics;
use sasso_reconciler::metrics::timed;
use sasso_reconciler::notifier::NotifierConfig;
use sasso_reconciler::worker::{WorkerConfig, WorkerHandle};

struct Harness {
    exporter: InMemoryMetricExporter,
    provider: SdkMeterProvider,
    metrics: WorkerMetrics,
}

impl Harness {
    fn new() -> Self {
        let exporter = InMemoryMetricExporter::default();
        let reader = PeriodicReader::builder(exporter.clone()).build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        let metrics = WorkerMetrics::new(&provider.meter("sasso-test"));
        Self {
            exporter,
            provider,
            metrics,
        }
    }

    fn names(&self) -> BTreeSet<String> {
        self.provider.force_flush().unwrap();
        self.exporter
            .get_finished_metrics()
            .unwrap()
            .iter()
            .flat_map(|resource| resource.scope_metrics())
            .flat_map(|scope| scope.metrics())
            .map(|metric| metric.name().to_string())
            .collect()
    }
}

#[tokio::test]
async fn test_vm_worker_cycle_is_measured() {
    let ctx = TestContext::new().await;
    let harness = Harness::new();
    let owner = ctx.create_user("alice", None).await;
    let net = ctx
        .create_net(owner, "alpha", 100, "10.0.0.0/24", None, ResourceStatus::PreCreating)
        .await;

    let worker = WorkerHandle::spawn(
        ctx.vm_reconciler().with_metrics(harness.metrics.clone()),
        WorkerConfig {
            startup_delay: Duration::ZERO,
            period: Duration::from_millis(20),
        },
    );

    for _ in 0..500 {
        if ctx.store.get_net(net).await.unwrap().unwrap().status == ResourceStatus::Ready {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Let the loop record the cycle that did the work
    tokio::time::sleep(Duration::from_millis(50)).await;
    worker.shutdown().await.unwrap();

    let names = harness.names();
    for expected in [
        "sasso_worker_step_duration_seconds",
        "sasso_worker_cycle_duration_seconds",
        "sasso_worker_items_total",
        "sasso_objects",
    ] {
        assert!(names.contains(expected), "{expected} missing from {names:?}");
    }
}

#[tokio::test]
async fn test_notifier_records_notification_counts() {
    use sasso_core::store::NewNotification;
    use sasso_reconciler::Reconciler;

    let ctx = TestContext::new().await;
    let harness = Harness::new();
    let owner = ctx.create_user("alice", None).await;
    ctx.store
        .insert_notification(&NewNotification::to_user(owner, "Hello", "Body"))
        .await
        .unwrap();

    let mut notifier = ctx
        .notifier(&NotifierConfig::default())
        .with_metrics(harness.metrics.clone());
    let report = notifier.reconcile().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let names = harness.names();
    assert!(names.contains("sasso_notifications"));
    assert!(names.contains("sasso_worker_step_duration_seconds"));
}

#[tokio::test]
async fn test_untimed_steps_still_run() {
    let value = timed(None, "dns", "sync", async { 42 }).await;
    assert_eq!(value, 42);
}
