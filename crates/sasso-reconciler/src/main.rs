// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sasso Reconciler
//!
//! Runs the network, VM, DNS and notification workers against the store
//! named by `SASSO_DATABASE_URL` until interrupted.

use std::sync::Arc;
use tracing::{info, warn};

use sasso_core::addressing::AddressPool;
use sasso_core::backend::{
    MemoryDns, MemoryEmail, MemoryFirewall, MemoryGateway, MemoryHypervisor,
};
use sasso_reconciler::config::{BackendKind, Config};
use sasso_reconciler::runtime::ReconcilerRuntime;
use sasso_reconciler::telegram::HttpTelegramSender;
use sasso_reconciler::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging, plus metrics export when OTLP is configured
    let telemetry = telemetry::init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        backend = ?config.backend,
        usable_subnet = %config.usable_subnet,
        new_subnet_prefix = config.new_subnet_prefix,
        metrics_export = telemetry.exporting(),
        "Starting Sasso Reconciler"
    );

    // Connects and runs migrations
    let store = sasso_core::store::connect(&config.database_url).await?;
    info!("Connected to database");

    let pool = Arc::new(AddressPool::new(
        config.usable_subnet,
        config.new_subnet_prefix,
    )?);

    let builder = match config.backend {
        BackendKind::Memory => {
            warn!("Using in-memory backends; no infrastructure will be changed");
            ReconcilerRuntime::builder()
                .gateway(Arc::new(MemoryGateway::new()))
                .firewall(Arc::new(MemoryFirewall::new()))
                .hypervisor(Arc::new(MemoryHypervisor::new()))
                .dns(Arc::new(MemoryDns::new()))
                .email(Arc::new(MemoryEmail::new()))
        }
    };

    let telegram = Arc::new(HttpTelegramSender::new(&config.telegram_api_url)?);

    let runtime = builder
        .config(&config)
        .store(store)
        .telegram(telegram)
        .address_pool(pool)
        .build()?
        .start()
        .await?;

    info!("Reconciler ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Sasso Reconciler shut down");

    Ok(())
}
