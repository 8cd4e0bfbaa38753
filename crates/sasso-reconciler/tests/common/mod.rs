// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for sasso-reconciler integration tests.
//!
//! Provides TestContext: an in-memory SQLite store, in-memory backends and
//! a shared guard table, plus helpers to seed resources.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use sasso_core::addressing::AddressPool;
use sasso_core::backend::{
    MemoryDns, MemoryEmail, MemoryFirewall, MemoryGateway, MemoryHypervisor, MemoryTelegram,
};
use sasso_core::store::sqlite::SqliteStore;
use sasso_core::store::{
    BackupRequestKind, NewBackupRequest, NewNet, NewTelegramBot, NewUser, NewVm, NewVmInterface,
};
use sasso_core::{GuardTable, ResourceStatus, Store};

use sasso_reconciler::dns_worker::DnsReconciler;
use sasso_reconciler::network_worker::{NetworkReconciler, NetworkReconcilerConfig};
use sasso_reconciler::notifier::{Notifier, NotifierConfig};
use sasso_reconciler::vm_worker::VmReconciler;

/// Public address used for NAT reflection in tests.
pub const PUBLIC_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

/// Test context with a fresh store and fresh backends.
pub struct TestContext {
    pub store: Arc<dyn Store>,
    /// The same store, for tests that need raw SQL.
    pub sqlite: SqliteStore,
    pub gateway: Arc<MemoryGateway>,
    pub firewall: Arc<MemoryFirewall>,
    pub hypervisor: Arc<MemoryHypervisor>,
    pub dns: Arc<MemoryDns>,
    pub email: Arc<MemoryEmail>,
    pub telegram: Arc<MemoryTelegram>,
    pub pool: Arc<AddressPool>,
    pub guards: Arc<GuardTable>,
}

impl TestContext {
    /// Create a new test context.
    pub async fn new() -> Self {
        let store = SqliteStore::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite store");
        let pool = AddressPool::new("10.0.0.0/16".parse().unwrap(), 24).unwrap();

        Self {
            sqlite: store.clone(),
            store: Arc::new(store),
            gateway: Arc::new(MemoryGateway::new()),
            firewall: Arc::new(MemoryFirewall::new()),
            hypervisor: Arc::new(MemoryHypervisor::new()),
            dns: Arc::new(MemoryDns::new()),
            email: Arc::new(MemoryEmail::new()),
            telegram: Arc::new(MemoryTelegram::new()),
            pool: Arc::new(pool),
            guards: Arc::new(GuardTable::new()),
        }
    }

    pub fn network_reconciler(&self) -> NetworkReconciler {
        self.network_reconciler_with(NetworkReconcilerConfig {
            public_ip: Some(PUBLIC_IP),
            ..Default::default()
        })
    }

    pub fn network_reconciler_with(&self, config: NetworkReconcilerConfig) -> NetworkReconciler {
        NetworkReconciler::new(
            self.store.clone(),
            self.gateway.clone(),
            self.firewall.clone(),
            self.pool.clone(),
            self.guards.clone(),
            config,
        )
    }

    pub fn vm_reconciler(&self) -> VmReconciler {
        VmReconciler::new(
            self.store.clone(),
            self.hypervisor.clone(),
            self.guards.clone(),
        )
    }

    pub fn dns_reconciler(&self) -> DnsReconciler {
        DnsReconciler::new(self.store.clone(), self.dns.clone())
    }

    pub fn notifier(&self, config: &NotifierConfig) -> Notifier {
        Notifier::new(
            self.store.clone(),
            self.email.clone(),
            self.telegram.clone(),
            config,
        )
    }

    // ========================================================================
    // Seeding helpers
    // ========================================================================

    pub async fn create_user(&self, username: &str, vpn_address: Option<&str>) -> i64 {
        self.store
            .insert_user(&NewUser {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                vpn_address: vpn_address.map(str::to_string),
            })
            .await
            .expect("Failed to create user")
    }

    pub async fn create_telegram_bot(&self, user_id: i64, chat_id: &str) -> i64 {
        self.store
            .insert_telegram_bot(&NewTelegramBot {
                user_id,
                token: format!("token-{chat_id}"),
                chat_id: chat_id.to_string(),
                enabled: true,
            })
            .await
            .expect("Failed to create telegram bot")
    }

    pub async fn create_net(
        &self,
        owner_id: i64,
        name: &str,
        tag: u32,
        subnet: &str,
        group_name: Option<&str>,
        status: ResourceStatus,
    ) -> i64 {
        let parsed: sasso_core::addressing::Ipv4Subnet = subnet.parse().unwrap();
        self.store
            .insert_net(&NewNet {
                owner_id,
                name: name.to_string(),
                tag,
                subnet: subnet.to_string(),
                gateway: parsed.router_address().to_string(),
                broadcast: parsed.broadcast().to_string(),
                group_name: group_name.map(str::to_string),
                vlan_aware: false,
                status,
            })
            .await
            .expect("Failed to create net")
    }

    pub async fn create_vm(&self, owner_id: i64, name: &str, status: ResourceStatus) -> i64 {
        self.store
            .insert_vm(&NewVm {
                owner_id,
                name: name.to_string(),
                cores: 2,
                ram_mb: 2048,
                disk_gb: 20,
                status,
            })
            .await
            .expect("Failed to create vm")
    }

    pub async fn create_vm_interface(
        &self,
        vm_id: i64,
        net_id: i64,
        address: &str,
        gateway: Option<&str>,
        status: ResourceStatus,
    ) -> i64 {
        self.store
            .insert_vm_interface(&NewVmInterface {
                vm_id,
                net_id,
                address: address.to_string(),
                gateway: gateway.map(str::to_string),
                status,
            })
            .await
            .expect("Failed to create vm interface")
    }

    pub async fn create_backup_request(
        &self,
        vm_id: i64,
        owner_id: i64,
        kind: BackupRequestKind,
        volid: Option<&str>,
    ) -> i64 {
        self.store
            .insert_backup_request(&NewBackupRequest {
                kind,
                vm_id,
                owner_id,
                name: "nightly".to_string(),
                notes: String::new(),
                volid: volid.map(str::to_string),
            })
            .await
            .expect("Failed to create backup request")
    }
}
