// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sasso Reconciler - control loops for the sasso control plane
//!
//! Desired state lives in the store; these workers make infrastructure
//! match it. Every worker runs the same poll-filter-act-persist loop
//! ([`worker::run_loop`]) and takes the per-resource guard
//! ([`sasso_core::GuardTable`]) around each action.
//!
//! # Workers
//!
//! | Worker | Polls | Acts on |
//! |--------|-------|---------|
//! | `network` | gateway interfaces, pending tickets, port forwards | Gateway, Firewall |
//! | `vm` | nets, VMs, VM interfaces, VM power state, backups | Hypervisor |
//! | `dns` | ready nets, primary addresses, users | DNS views |
//! | `notifier` | pending notifications | Email, Telegram |
//!
//! Failed actions leave the item pending and are retried next cycle; there
//! is no retry cutoff. Workers cooperate only through the store and the
//! guard table, so each worker must run in exactly one process.
//!
//! # Configuration
//!
//! The binary reads `SASSO_*` environment variables (see [`config::Config`]).
//! Metrics are exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//! (see [`telemetry`] and [`metrics::WorkerMetrics`]).

/// Guarded check-then-act operations for API handlers.
pub mod api;

/// Configuration loading.
pub mod config;

/// DNS view reconciler.
pub mod dns_worker;

/// Error types.
pub mod error;

/// Worker metrics.
pub mod metrics;

/// Router reconciler.
pub mod network_worker;

/// Rate-limited notification dispatch.
pub mod notifier;

/// Embeddable runtime.
pub mod runtime;

/// Telegram Bot API channel.
pub mod telegram;

/// Logging and OTLP metrics export for the binary.
pub mod telemetry;

/// Hypervisor reconciler.
pub mod vm_worker;

/// Worker loop.
pub mod worker;

pub use error::{Error, Result};
pub use metrics::WorkerMetrics;
pub use runtime::ReconcilerRuntime;
pub use worker::{CycleReport, Reconciler, WorkerConfig, WorkerHandle};
