// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS reconciler.
//!
//! Every ready net gets a view `net<id>` serving its own subnet, and every
//! user with a VPN address gets a view `user<id>` serving the tunnel
//! address. Each view holds one zone variant (`sasso..<view>`) with an `A`
//! record per VM the clients of that view may reach:
//!
//! | View | Names |
//! |------|-------|
//! | `net<id>` | `<vm>.sasso.` for VMs in the net; `<vm>.<group>.sasso.` too when the net belongs to a group |
//! | `user<id>` | `<vm>.sasso.` for the user's VMs; `<vm>.<group>.sasso.` for VMs in the user's group nets |
//!
//! The desired views are diffed against what the server reports. Views with
//! a managed name that are no longer desired are torn down.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use sasso_core::addressing::parse_host_address;
use sasso_core::backend::{DnsManager, DnsView, DnsZone, RRSet, tolerate_exists, tolerate_missing};
use sasso_core::store::PrimaryAddressRecord;
use sasso_core::{ResourceStatus, Store};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics::{WorkerMetrics, timed};
use crate::worker::{CycleReport, Reconciler};

/// Parent domain of every VM name.
pub const DOMAIN: &str = "sasso.";

/// TTL of generated records.
pub const RECORD_TTL: u32 = 300;

/// Zone variant served by `view`.
pub fn zone_name(view: &str) -> String {
    format!("sasso..{view}")
}

/// Whether `view` is one this reconciler creates.
pub fn is_managed_view(view: &str) -> bool {
    ["net", "user"].iter().any(|prefix| {
        view.strip_prefix(prefix)
            .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// Accumulates `A` records by owner name.
#[derive(Default)]
struct RecordSet(BTreeMap<String, BTreeSet<String>>);

impl RecordSet {
    fn add(&mut self, name: String, address: &str) {
        match parse_host_address(address) {
            Ok(ip) => {
                self.0.entry(name).or_default().insert(ip.to_string());
            }
            Err(e) => warn!(name = %name, error = %e, "Skipping record with bad address"),
        }
    }

    fn into_rrsets(self) -> Vec<RRSet> {
        self.0
            .into_iter()
            .map(|(name, records)| RRSet {
                name,
                record_type: "A".to_string(),
                ttl: RECORD_TTL,
                records: records.into_iter().collect(),
            })
            .collect()
    }
}

fn plain_name(vm: &str) -> String {
    format!("{vm}.{DOMAIN}")
}

fn group_name(vm: &str, group: &str) -> String {
    format!("{vm}.{group}.{DOMAIN}")
}

/// Keeps DNS views in line with nets, VMs and users.
pub struct DnsReconciler {
    store: Arc<dyn Store>,
    dns: Arc<dyn DnsManager>,
    metrics: Option<WorkerMetrics>,
}

impl DnsReconciler {
    /// Create a DNS reconciler.
    pub fn new(store: Arc<dyn Store>, dns: Arc<dyn DnsManager>) -> Self {
        Self {
            store,
            dns,
            metrics: None,
        }
    }

    /// Record sync timing and cycle outcomes on `metrics`.
    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Views the server should have, by name.
    pub async fn desired_views(&self) -> Result<BTreeMap<String, DnsView>> {
        let addresses = self.store.list_primary_addresses().await?;
        let mut views = BTreeMap::new();

        for net in self.store.list_nets_by_status(ResourceStatus::Ready).await? {
            let mut records = RecordSet::default();
            for addr in addresses.iter().filter(|a| a.net_id == net.id) {
                records.add(plain_name(&addr.vm_name), &addr.address);
                if let Some(group) = &net.group_name {
                    records.add(group_name(&addr.vm_name, group), &addr.address);
                }
            }

            let view = format!("net{}", net.id);
            views.insert(
                view.clone(),
                DnsView {
                    networks: vec![net.subnet.clone()],
                    zones: vec![DnsZone {
                        name: zone_name(&view),
                        rrsets: records.into_rrsets(),
                    }],
                    name: view,
                },
            );
        }

        for user in self.store.list_users().await? {
            let Some(vpn) = &user.vpn_address else {
                continue;
            };
            let vpn = match parse_host_address(vpn) {
                Ok(ip) => ip,
                Err(e) => {
                    warn!(user_id = user.id, error = %e, "Skipping user with bad VPN address");
                    continue;
                }
            };

            let groups: BTreeSet<String> = self
                .store
                .list_user_groups(user.id)
                .await?
                .into_iter()
                .collect();

            let mut records = RecordSet::default();
            for addr in &addresses {
                if addr.owner_id == user.id {
                    records.add(plain_name(&addr.vm_name), &addr.address);
                }
                if let Some(group) = member_group(addr, &groups) {
                    records.add(group_name(&addr.vm_name, group), &addr.address);
                }
            }

            let view = format!("user{}", user.id);
            views.insert(
                view.clone(),
                DnsView {
                    networks: vec![format!("{vpn}/32")],
                    zones: vec![DnsZone {
                        name: zone_name(&view),
                        rrsets: records.into_rrsets(),
                    }],
                    name: view,
                },
            );
        }

        Ok(views)
    }

    /// Diff desired views against the server and apply the difference.
    pub async fn sync(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let desired = self.desired_views().await?;
        let actual: HashMap<String, DnsView> = self
            .dns
            .fetch_views()
            .await?
            .into_iter()
            .map(|view| (view.name.clone(), view))
            .collect();

        for (name, view) in &desired {
            let outcome = match actual.get(name) {
                None => self.create_view(view).await.map(|()| true),
                Some(current) => self.update_view(view, current).await,
            };
            match outcome {
                Ok(true) => report.succeed(),
                Ok(false) => {}
                Err(e) => {
                    error!(view = %name, error = %e, "Failed to sync DNS view");
                    report.fail();
                }
            }
        }

        for (name, view) in &actual {
            if desired.contains_key(name) || !is_managed_view(name) {
                continue;
            }
            match self.remove_view(view).await {
                Ok(()) => report.succeed(),
                Err(e) => {
                    error!(view = %name, error = %e, "Failed to remove DNS view");
                    report.fail();
                }
            }
        }

        Ok(report)
    }

    async fn create_view(&self, view: &DnsView) -> Result<()> {
        for zone in &view.zones {
            tolerate_exists(self.dns.create_zone(zone).await)?;
            self.dns.add_zone_to_view(&view.name, &zone.name).await?;
        }
        for network in &view.networks {
            self.dns.set_network_view(network, &view.name).await?;
        }
        info!(view = %view.name, networks = ?view.networks, "DNS view created");
        Ok(())
    }

    /// Returns whether anything changed.
    async fn update_view(&self, desired: &DnsView, current: &DnsView) -> Result<bool> {
        let mut changed = false;

        for zone in &desired.zones {
            match current.zones.iter().find(|z| z.name == zone.name) {
                None => {
                    tolerate_exists(self.dns.create_zone(zone).await)?;
                    self.dns.add_zone_to_view(&desired.name, &zone.name).await?;
                    changed = true;
                }
                Some(existing) => {
                    changed |= self.sync_rrsets(zone, existing).await?;
                }
            }
        }
        for zone in &current.zones {
            if !desired.zones.iter().any(|z| z.name == zone.name) {
                tolerate_missing(self.dns.remove_zone(&zone.name).await)?;
                changed = true;
            }
        }

        for network in &desired.networks {
            if !current.networks.contains(network) {
                self.dns.set_network_view(network, &desired.name).await?;
                changed = true;
            }
        }
        for network in &current.networks {
            if !desired.networks.contains(network) {
                tolerate_missing(self.dns.remove_network(network).await)?;
                changed = true;
            }
        }

        if changed {
            info!(view = %desired.name, "DNS view updated");
        } else {
            debug!(view = %desired.name, "DNS view up to date");
        }
        Ok(changed)
    }

    async fn sync_rrsets(&self, desired: &DnsZone, current: &DnsZone) -> Result<bool> {
        let mut changed = false;

        for rrset in &desired.rrsets {
            let existing = current
                .rrsets
                .iter()
                .find(|r| r.name == rrset.name && r.record_type == rrset.record_type);
            if !existing.is_some_and(|r| same_rrset(r, rrset)) {
                self.dns.upsert_rrset(&desired.name, rrset).await?;
                changed = true;
            }
        }

        // Only A records are generated; anything else in the zone is left alone
        for rrset in current.rrsets.iter().filter(|r| r.record_type == "A") {
            if !desired.rrsets.iter().any(|r| r.name == rrset.name && r.record_type == "A") {
                tolerate_missing(
                    self.dns
                        .remove_rrset(&desired.name, &rrset.name, &rrset.record_type)
                        .await,
                )?;
                changed = true;
            }
        }

        Ok(changed)
    }

    async fn remove_view(&self, view: &DnsView) -> Result<()> {
        for zone in &view.zones {
            tolerate_missing(self.dns.remove_zone(&zone.name).await)?;
        }
        for network in &view.networks {
            tolerate_missing(self.dns.remove_network(network).await)?;
        }
        info!(view = %view.name, "DNS view removed");
        Ok(())
    }
}

fn member_group<'a>(addr: &'a PrimaryAddressRecord, groups: &BTreeSet<String>) -> Option<&'a str> {
    addr.group_name
        .as_deref()
        .filter(|group| groups.contains(*group))
}

fn same_rrset(a: &RRSet, b: &RRSet) -> bool {
    let records = |r: &RRSet| r.records.iter().cloned().collect::<BTreeSet<_>>();
    a.ttl == b.ttl && records(a) == records(b)
}

#[async_trait]
impl Reconciler for DnsReconciler {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn metrics(&self) -> Option<&WorkerMetrics> {
        self.metrics.as_ref()
    }

    async fn reconcile(&mut self) -> Result<CycleReport> {
        timed(self.metrics.as_ref(), "dns", "sync", self.sync()).await
    }
}
