// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Logging and metrics export setup for the binary.
//!
//! Logs go to stdout through `tracing-subscriber`, filtered by `RUST_LOG`.
//! Metrics are exported over OTLP/gRPC only when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set; otherwise the global meter provider
//! stays a no-op.
//!
//! # Environment Variables
//!
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP gRPC endpoint (enables export)
//! - `OTEL_SERVICE_NAME`: Service name (default: "sasso-reconciler")

use opentelemetry_sdk::metrics::SdkMeterProvider;

/// Flushes and shuts down the meter provider on drop.
pub struct TelemetryGuard {
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    /// Whether metrics are being exported.
    pub fn exporting(&self) -> bool {
        self.meter_provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.meter_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("OTEL meter provider shutdown error: {:?}", e);
        }
    }
}

/// Install the tracing subscriber and, if configured, the OTLP meter provider.
///
/// Keep the returned guard alive for the life of the process.
pub fn init() -> TelemetryGuard {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sasso_reconciler=info,sasso_core=info".into()),
        )
        .init();

    let meter_provider = maybe_init_metrics();
    if let Some(provider) = &meter_provider {
        opentelemetry::global::set_meter_provider(provider.clone());
    }

    TelemetryGuard { meter_provider }
}

fn maybe_init_metrics() -> Option<SdkMeterProvider> {
    use opentelemetry_otlp::{MetricExporter, WithExportConfig};
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::metrics::PeriodicReader;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "sasso-reconciler".to_string());
    let resource = Resource::builder().with_service_name(service_name).build();

    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .build()
        .map_err(|e| {
            eprintln!("Failed to create OTLP metric exporter: {:?}", e);
            e
        })
        .ok()?;

    let reader = PeriodicReader::builder(exporter).build();
    Some(
        SdkMeterProvider::builder()
            .with_resource(resource)
            .with_reader(reader)
            .build(),
    )
}
