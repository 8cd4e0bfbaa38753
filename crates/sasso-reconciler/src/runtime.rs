// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for sasso-reconciler.
//!
//! [`ReconcilerRuntime`] runs the four workers (network, VM, DNS and
//! notifier) as tokio tasks inside an existing application. API handlers
//! living in the same process must use [`ReconcilerRuntime::guards`] so
//! their check-then-act sequences serialize with the workers.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sasso_core::addressing::AddressPool;
//! use sasso_core::backend::*;
//! use sasso_reconciler::runtime::ReconcilerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = sasso_core::store::connect("sqlite:sasso.db").await?;
//!     let pool = AddressPool::new("10.0.0.0/16".parse()?, 24)?;
//!
//!     let runtime = ReconcilerRuntime::builder()
//!         .store(store)
//!         .gateway(Arc::new(MemoryGateway::new()))
//!         .firewall(Arc::new(MemoryFirewall::new()))
//!         .hypervisor(Arc::new(MemoryHypervisor::new()))
//!         .dns(Arc::new(MemoryDns::new()))
//!         .email(Arc::new(MemoryEmail::new()))
//!         .telegram(Arc::new(MemoryTelegram::new()))
//!         .address_pool(Arc::new(pool))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve the API with runtime.guards() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sasso_core::addressing::AddressPool;
use sasso_core::backend::{DnsManager, EmailSender, Firewall, Gateway, Hypervisor, TelegramSender};
use sasso_core::{GuardTable, Store};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::dns_worker::DnsReconciler;
use crate::metrics::WorkerMetrics;
use crate::network_worker::{NetworkReconciler, NetworkReconcilerConfig};
use crate::notifier::{Notifier, NotifierConfig};
use crate::vm_worker::VmReconciler;
use crate::worker::{WorkerConfig, WorkerHandle};

/// Builder for creating a [`ReconcilerRuntime`].
pub struct ReconcilerRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    gateway: Option<Arc<dyn Gateway>>,
    firewall: Option<Arc<dyn Firewall>>,
    hypervisor: Option<Arc<dyn Hypervisor>>,
    dns: Option<Arc<dyn DnsManager>>,
    email: Option<Arc<dyn EmailSender>>,
    telegram: Option<Arc<dyn TelegramSender>>,
    address_pool: Option<Arc<AddressPool>>,
    guards: Option<Arc<GuardTable>>,
    startup_delay: Duration,
    network_poll_interval: Duration,
    vm_poll_interval: Duration,
    dns_poll_interval: Duration,
    notify_poll_interval: Duration,
    network_config: NetworkReconcilerConfig,
    notifier_config: NotifierConfig,
    metrics: Option<WorkerMetrics>,
}

impl Default for ReconcilerRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            gateway: None,
            firewall: None,
            hypervisor: None,
            dns: None,
            email: None,
            telegram: None,
            address_pool: None,
            guards: None,
            startup_delay: Duration::from_secs(10),
            network_poll_interval: Duration::from_secs(5),
            vm_poll_interval: Duration::from_secs(10),
            dns_poll_interval: Duration::from_secs(10),
            notify_poll_interval: Duration::from_secs(30),
            network_config: NetworkReconcilerConfig::default(),
            notifier_config: NotifierConfig::default(),
            metrics: None,
        }
    }
}

impl ReconcilerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take timing and worker settings from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.startup_delay = config.startup_delay;
        self.network_poll_interval = config.network_poll_interval;
        self.vm_poll_interval = config.vm_poll_interval;
        self.dns_poll_interval = config.dns_poll_interval;
        self.notify_poll_interval = config.notify_poll_interval;
        self.network_config = NetworkReconcilerConfig {
            batch_size: config.ticket_batch_size,
            external_zone: config.firewall_external_zone.clone(),
            public_ip: config.firewall_public_ip,
        };
        self.notifier_config = NotifierConfig {
            rate_limits: config.notify_rate_limits,
            max_per_minute: config.notify_max_per_minute,
            max_per_day: config.notify_max_per_day,
        };
        self
    }

    /// Set the resource store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the gateway driver (required).
    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the firewall driver (required).
    pub fn firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.firewall = Some(firewall);
        self
    }

    /// Set the hypervisor driver (required).
    pub fn hypervisor(mut self, hypervisor: Arc<dyn Hypervisor>) -> Self {
        self.hypervisor = Some(hypervisor);
        self
    }

    /// Set the DNS driver (required).
    pub fn dns(mut self, dns: Arc<dyn DnsManager>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Set the email channel (required).
    pub fn email(mut self, email: Arc<dyn EmailSender>) -> Self {
        self.email = Some(email);
        self
    }

    /// Set the Telegram channel (required).
    pub fn telegram(mut self, telegram: Arc<dyn TelegramSender>) -> Self {
        self.telegram = Some(telegram);
        self
    }

    /// Set the subnet allocator (required).
    pub fn address_pool(mut self, pool: Arc<AddressPool>) -> Self {
        self.address_pool = Some(pool);
        self
    }

    /// Share a guard table with API handlers.
    ///
    /// Default: a fresh table, reachable through [`ReconcilerRuntime::guards`].
    pub fn guards(mut self, guards: Arc<GuardTable>) -> Self {
        self.guards = Some(guards);
        self
    }

    /// Set the grace delay before each worker's first cycle.
    ///
    /// Default: 10 seconds
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Set the network worker period.
    ///
    /// Default: 5 seconds
    pub fn network_poll_interval(mut self, interval: Duration) -> Self {
        self.network_poll_interval = interval;
        self
    }

    /// Set the VM worker period.
    ///
    /// Default: 10 seconds
    pub fn vm_poll_interval(mut self, interval: Duration) -> Self {
        self.vm_poll_interval = interval;
        self
    }

    /// Set the DNS worker period.
    ///
    /// Default: 10 seconds
    pub fn dns_poll_interval(mut self, interval: Duration) -> Self {
        self.dns_poll_interval = interval;
        self
    }

    /// Set the notifier period.
    ///
    /// Default: 30 seconds
    pub fn notify_poll_interval(mut self, interval: Duration) -> Self {
        self.notify_poll_interval = interval;
        self
    }

    /// Set the network reconciler settings.
    pub fn network_config(mut self, config: NetworkReconcilerConfig) -> Self {
        self.network_config = config;
        self
    }

    /// Set the notifier settings.
    pub fn notifier_config(mut self, config: NotifierConfig) -> Self {
        self.notifier_config = config;
        self
    }

    /// Record worker metrics on these instruments.
    ///
    /// Default: instruments on the global meter provider.
    pub fn metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ReconcilerRuntimeConfig> {
        fn required<T>(value: Option<T>, name: &str) -> Result<T> {
            value.ok_or_else(|| anyhow::anyhow!("{} is required", name))
        }

        Ok(ReconcilerRuntimeConfig {
            store: required(self.store, "store")?,
            gateway: required(self.gateway, "gateway")?,
            firewall: required(self.firewall, "firewall")?,
            hypervisor: required(self.hypervisor, "hypervisor")?,
            dns: required(self.dns, "dns")?,
            email: required(self.email, "email")?,
            telegram: required(self.telegram, "telegram")?,
            address_pool: required(self.address_pool, "address_pool")?,
            guards: self.guards.unwrap_or_default(),
            startup_delay: self.startup_delay,
            network_poll_interval: self.network_poll_interval,
            vm_poll_interval: self.vm_poll_interval,
            dns_poll_interval: self.dns_poll_interval,
            notify_poll_interval: self.notify_poll_interval,
            network_config: self.network_config,
            notifier_config: self.notifier_config,
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}

/// Configuration for a [`ReconcilerRuntime`].
pub struct ReconcilerRuntimeConfig {
    store: Arc<dyn Store>,
    gateway: Arc<dyn Gateway>,
    firewall: Arc<dyn Firewall>,
    hypervisor: Arc<dyn Hypervisor>,
    dns: Arc<dyn DnsManager>,
    email: Arc<dyn EmailSender>,
    telegram: Arc<dyn TelegramSender>,
    address_pool: Arc<AddressPool>,
    guards: Arc<GuardTable>,
    startup_delay: Duration,
    network_poll_interval: Duration,
    vm_poll_interval: Duration,
    dns_poll_interval: Duration,
    notify_poll_interval: Duration,
    network_config: NetworkReconcilerConfig,
    notifier_config: NotifierConfig,
    metrics: WorkerMetrics,
}

impl ReconcilerRuntimeConfig {
    fn worker_config(&self, period: Duration) -> WorkerConfig {
        WorkerConfig {
            startup_delay: self.startup_delay,
            period,
        }
    }

    /// Start the runtime, spawning one task per worker.
    pub async fn start(self) -> Result<ReconcilerRuntime> {
        let cancel = CancellationToken::new();

        let network = NetworkReconciler::new(
            self.store.clone(),
            self.gateway.clone(),
            self.firewall.clone(),
            self.address_pool.clone(),
            self.guards.clone(),
            self.network_config.clone(),
        )
        .with_metrics(self.metrics.clone());
        let vm = VmReconciler::new(
            self.store.clone(),
            self.hypervisor.clone(),
            self.guards.clone(),
        )
        .with_metrics(self.metrics.clone());
        let dns = DnsReconciler::new(self.store.clone(), self.dns.clone())
            .with_metrics(self.metrics.clone());
        let notifier = Notifier::new(
            self.store.clone(),
            self.email.clone(),
            self.telegram.clone(),
            &self.notifier_config,
        )
        .with_metrics(self.metrics.clone());

        let workers = vec![
            WorkerHandle::spawn_with_token(
                network,
                self.worker_config(self.network_poll_interval),
                cancel.child_token(),
            ),
            WorkerHandle::spawn_with_token(
                vm,
                self.worker_config(self.vm_poll_interval),
                cancel.child_token(),
            ),
            WorkerHandle::spawn_with_token(
                dns,
                self.worker_config(self.dns_poll_interval),
                cancel.child_token(),
            ),
            WorkerHandle::spawn_with_token(
                notifier,
                self.worker_config(self.notify_poll_interval),
                cancel.child_token(),
            ),
        ];

        info!(
            workers = workers.len(),
            startup_delay_secs = self.startup_delay.as_secs(),
            gateway = self.gateway.gateway_type(),
            "ReconcilerRuntime started"
        );

        Ok(ReconcilerRuntime {
            workers,
            cancel,
            guards: self.guards,
        })
    }
}

/// Running reconciliation workers.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ReconcilerRuntime {
    workers: Vec<WorkerHandle>,
    cancel: CancellationToken,
    guards: Arc<GuardTable>,
}

impl ReconcilerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ReconcilerRuntimeBuilder {
        ReconcilerRuntimeBuilder::new()
    }

    /// Guard table shared with the workers.
    pub fn guards(&self) -> &Arc<GuardTable> {
        &self.guards
    }

    /// Check if every worker is still running.
    pub fn is_running(&self) -> bool {
        self.workers.iter().all(|w| !w.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Workers stop at their next loop boundary; a cycle in progress
    /// finishes its batch first.
    pub async fn shutdown(self) -> Result<()> {
        info!("ReconcilerRuntime shutting down...");
        self.cancel.cancel();

        let mut first_error = None;
        for worker in self.workers {
            let name = worker.name();
            match worker.join().await {
                Ok(exit) => info!(worker = name, cycles = exit.cycles, "Worker joined"),
                Err(e) => {
                    error!(worker = name, error = %e, "Worker did not exit cleanly");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => {
                info!("ReconcilerRuntime shutdown complete");
                Ok(())
            }
            Some(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_store() {
        let err = ReconcilerRuntime::builder().build().err().unwrap();
        assert_eq!(err.to_string(), "store is required");
    }
}
