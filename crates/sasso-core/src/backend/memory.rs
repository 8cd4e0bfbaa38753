// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory backend drivers.
//!
//! These keep infrastructure state in process memory. They back the
//! `memory` dry-run mode of the reconciler binary and the test suites, and
//! support failure injection per operation plus a call log so tests can
//! count side effects.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::traits::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

const ANY_OPERATION: &str = "*";

/// Failure injection and call recording shared by the memory drivers.
#[derive(Default)]
pub struct Faults {
    pending: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<String>>,
}

impl Faults {
    /// Fail the next `times` calls of `operation` with an unreachable error.
    pub fn fail(&self, operation: &str, times: usize) {
        lock(&self.pending).insert(operation.to_string(), times);
    }

    /// Fail the next `times` calls of any operation.
    pub fn fail_any(&self, times: usize) {
        self.fail(ANY_OPERATION, times);
    }

    /// Fail every call of `operation` until [`Faults::clear`].
    pub fn fail_always(&self, operation: &str) {
        self.fail(operation, usize::MAX);
    }

    /// Drop all injected failures.
    pub fn clear(&self) {
        lock(&self.pending).clear();
    }

    /// Number of calls made to `operation`, failed ones included.
    pub fn call_count(&self, operation: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == operation).count()
    }

    /// Every call made, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn enter(&self, operation: &str) -> Result<()> {
        lock(&self.calls).push(operation.to_string());

        let mut pending = lock(&self.pending);
        for key in [operation, ANY_OPERATION] {
            if let Some(remaining) = pending.get_mut(key)
                && *remaining > 0
            {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(BackendError::Unreachable(format!(
                    "{operation}: injected failure"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Gateway keeping interfaces in a map keyed by local id.
#[derive(Default)]
pub struct MemoryGateway {
    interfaces: Mutex<BTreeMap<String, InterfaceSpec>>,
    /// Failure injection and call log.
    pub faults: Faults,
}

impl MemoryGateway {
    /// Create an empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the interfaces present.
    pub fn interfaces(&self) -> BTreeMap<String, InterfaceSpec> {
        lock(&self.interfaces).clone()
    }

    /// Remove an interface behind the reconciler's back.
    pub fn drop_interface(&self, local_id: &str) {
        lock(&self.interfaces).remove(local_id);
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn new_interface(&self, spec: &InterfaceSpec) -> Result<ProvisionedInterface> {
        self.faults.enter("new_interface")?;
        let mut interfaces = lock(&self.interfaces);
        if interfaces.values().any(|i| i.vnet == spec.vnet) {
            return Err(BackendError::AlreadyExists(format!("interface for {}", spec.vnet)));
        }
        let local_id = format!("vxlan{}", spec.vnet_tag);
        if interfaces.contains_key(&local_id) {
            return Err(BackendError::AlreadyExists(local_id));
        }
        interfaces.insert(local_id.clone(), spec.clone());
        Ok(ProvisionedInterface {
            firewall_interface: local_id.clone(),
            local_id,
        })
    }

    async fn remove_interface(&self, local_id: &str) -> Result<()> {
        self.faults.enter("remove_interface")?;
        lock(&self.interfaces).remove(local_id);
        Ok(())
    }

    async fn verify_interface(&self, local_id: &str, spec: &InterfaceSpec) -> Result<bool> {
        self.faults.enter("verify_interface")?;
        Ok(lock(&self.interfaces).get(local_id) == Some(spec))
    }

    fn gateway_type(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Firewall
// ============================================================================

#[derive(Default)]
struct FirewallState {
    zones: BTreeSet<String>,
    interfaces: BTreeMap<String, String>,
    policies: Vec<Policy>,
    rules: Vec<FirewallRule>,
    reloads: usize,
}

/// Firewall keeping its configuration in memory.
#[derive(Default)]
pub struct MemoryFirewall {
    state: Mutex<FirewallState>,
    /// Failure injection and call log.
    pub faults: Faults,
}

impl MemoryFirewall {
    /// Create an empty firewall.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configured zones.
    pub fn zones(&self) -> BTreeSet<String> {
        lock(&self.state).zones.clone()
    }

    /// Interface to zone assignments.
    pub fn interfaces(&self) -> BTreeMap<String, String> {
        lock(&self.state).interfaces.clone()
    }

    /// Configured policies.
    pub fn policies(&self) -> Vec<Policy> {
        lock(&self.state).policies.clone()
    }

    /// Configured rules.
    pub fn rules(&self) -> Vec<FirewallRule> {
        lock(&self.state).rules.clone()
    }

    /// Successful reloads so far.
    pub fn reload_count(&self) -> usize {
        lock(&self.state).reloads
    }

    /// Wipe all rules behind the reconciler's back.
    pub fn clear_rules(&self) {
        lock(&self.state).rules.clear();
    }
}

#[async_trait]
impl Firewall for MemoryFirewall {
    async fn add_zone(&self, zone: &str) -> Result<()> {
        self.faults.enter("add_zone")?;
        if !lock(&self.state).zones.insert(zone.to_string()) {
            return Err(BackendError::AlreadyExists(format!("zone {zone}")));
        }
        Ok(())
    }

    async fn remove_zone(&self, zone: &str) -> Result<()> {
        self.faults.enter("remove_zone")?;
        if !lock(&self.state).zones.remove(zone) {
            return Err(BackendError::NotFound(format!("zone {zone}")));
        }
        Ok(())
    }

    async fn add_interface(&self, interface: &str, zone: &str) -> Result<()> {
        self.faults.enter("add_interface")?;
        let mut state = lock(&self.state);
        if !state.zones.contains(zone) {
            return Err(BackendError::NotFound(format!("zone {zone}")));
        }
        if state.interfaces.contains_key(interface) {
            return Err(BackendError::AlreadyExists(format!("interface {interface}")));
        }
        state
            .interfaces
            .insert(interface.to_string(), zone.to_string());
        Ok(())
    }

    async fn remove_interface(&self, interface: &str) -> Result<()> {
        self.faults.enter("remove_interface")?;
        match lock(&self.state).interfaces.remove(interface) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!("interface {interface}"))),
        }
    }

    async fn add_policy(&self, policy: &Policy) -> Result<()> {
        self.faults.enter("add_policy")?;
        let mut state = lock(&self.state);
        if state.policies.contains(policy) {
            return Err(BackendError::AlreadyExists(format!(
                "policy {} -> {}",
                policy.source, policy.destination
            )));
        }
        state.policies.push(policy.clone());
        Ok(())
    }

    async fn remove_policy(&self, policy: &Policy) -> Result<()> {
        self.faults.enter("remove_policy")?;
        let mut state = lock(&self.state);
        let before = state.policies.len();
        state.policies.retain(|p| p != policy);
        if state.policies.len() == before {
            return Err(BackendError::NotFound(format!(
                "policy {} -> {}",
                policy.source, policy.destination
            )));
        }
        Ok(())
    }

    async fn add_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.faults.enter("add_rule")?;
        let mut state = lock(&self.state);
        if state.rules.contains(rule) {
            return Err(BackendError::AlreadyExists(format!(
                "rule {} port {}",
                rule.action, rule.dest_port
            )));
        }
        state.rules.push(rule.clone());
        Ok(())
    }

    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.faults.enter("remove_rule")?;
        let mut state = lock(&self.state);
        let before = state.rules.len();
        state.rules.retain(|r| r != rule);
        if state.rules.len() == before {
            return Err(BackendError::NotFound(format!(
                "rule {} port {}",
                rule.action, rule.dest_port
            )));
        }
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<FirewallRule>> {
        self.faults.enter("list_rules")?;
        Ok(lock(&self.state).rules.clone())
    }

    async fn reload(&self) -> Result<()> {
        self.faults.enter("reload")?;
        lock(&self.state).reloads += 1;
        Ok(())
    }
}

// ============================================================================
// DNS
// ============================================================================

#[derive(Default)]
struct DnsState {
    networks: BTreeMap<String, String>,
    views: BTreeMap<String, BTreeSet<String>>,
    zones: BTreeMap<String, Vec<RRSet>>,
}

/// DNS server keeping views, zones and record sets in memory.
#[derive(Default)]
pub struct MemoryDns {
    state: Mutex<DnsState>,
    /// Failure injection and call log.
    pub faults: Faults,
}

impl MemoryDns {
    /// Create an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Network to view mappings.
    pub fn networks(&self) -> BTreeMap<String, String> {
        lock(&self.state).networks.clone()
    }

    /// Record sets of a zone, if it exists.
    pub fn zone(&self, name: &str) -> Option<Vec<RRSet>> {
        lock(&self.state).zones.get(name).cloned()
    }

    /// Names of all zones.
    pub fn zone_names(&self) -> Vec<String> {
        lock(&self.state).zones.keys().cloned().collect()
    }
}

#[async_trait]
impl DnsManager for MemoryDns {
    async fn fetch_views(&self) -> Result<Vec<DnsView>> {
        self.faults.enter("fetch_views")?;
        let state = lock(&self.state);

        let mut names: BTreeSet<&String> = state.views.keys().collect();
        names.extend(state.networks.values());

        Ok(names
            .into_iter()
            .map(|name| DnsView {
                name: name.clone(),
                networks: state
                    .networks
                    .iter()
                    .filter(|(_, view)| *view == name)
                    .map(|(network, _)| network.clone())
                    .collect(),
                zones: state
                    .views
                    .get(name)
                    .into_iter()
                    .flatten()
                    .filter_map(|zone| {
                        state.zones.get(zone).map(|rrsets| DnsZone {
                            name: zone.clone(),
                            rrsets: rrsets.clone(),
                        })
                    })
                    .collect(),
            })
            .collect())
    }

    async fn set_network_view(&self, network: &str, view: &str) -> Result<()> {
        self.faults.enter("set_network_view")?;
        lock(&self.state)
            .networks
            .insert(network.to_string(), view.to_string());
        Ok(())
    }

    async fn remove_network(&self, network: &str) -> Result<()> {
        self.faults.enter("remove_network")?;
        match lock(&self.state).networks.remove(network) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!("network {network}"))),
        }
    }

    async fn create_zone(&self, zone: &DnsZone) -> Result<()> {
        self.faults.enter("create_zone")?;
        let mut state = lock(&self.state);
        if state.zones.contains_key(&zone.name) {
            return Err(BackendError::AlreadyExists(format!("zone {}", zone.name)));
        }
        state.zones.insert(zone.name.clone(), zone.rrsets.clone());
        Ok(())
    }

    async fn add_zone_to_view(&self, view: &str, zone: &str) -> Result<()> {
        self.faults.enter("add_zone_to_view")?;
        let mut state = lock(&self.state);
        if !state.zones.contains_key(zone) {
            return Err(BackendError::NotFound(format!("zone {zone}")));
        }
        state
            .views
            .entry(view.to_string())
            .or_default()
            .insert(zone.to_string());
        Ok(())
    }

    async fn remove_zone(&self, zone: &str) -> Result<()> {
        self.faults.enter("remove_zone")?;
        let mut state = lock(&self.state);
        if state.zones.remove(zone).is_none() {
            return Err(BackendError::NotFound(format!("zone {zone}")));
        }
        for zones in state.views.values_mut() {
            zones.remove(zone);
        }
        state.views.retain(|_, zones| !zones.is_empty());
        Ok(())
    }

    async fn upsert_rrset(&self, zone: &str, rrset: &RRSet) -> Result<()> {
        self.faults.enter("upsert_rrset")?;
        let mut state = lock(&self.state);
        let rrsets = state
            .zones
            .get_mut(zone)
            .ok_or_else(|| BackendError::NotFound(format!("zone {zone}")))?;
        rrsets.retain(|r| !(r.name == rrset.name && r.record_type == rrset.record_type));
        rrsets.push(rrset.clone());
        Ok(())
    }

    async fn remove_rrset(&self, zone: &str, name: &str, record_type: &str) -> Result<()> {
        self.faults.enter("remove_rrset")?;
        let mut state = lock(&self.state);
        let rrsets = state
            .zones
            .get_mut(zone)
            .ok_or_else(|| BackendError::NotFound(format!("zone {zone}")))?;
        let before = rrsets.len();
        rrsets.retain(|r| !(r.name == name && r.record_type == record_type));
        if rrsets.len() == before {
            return Err(BackendError::NotFound(format!("rrset {name} {record_type}")));
        }
        Ok(())
    }
}

// ============================================================================
// Hypervisor
// ============================================================================

#[derive(Default)]
struct HypervisorState {
    vnets: BTreeMap<String, VnetSpec>,
    vms: BTreeMap<i64, (VmSpec, VmPowerState)>,
    nics: BTreeMap<(i64, i64), NicSpec>,
    backups: BTreeMap<String, BackupSpec>,
    restores: Vec<(i64, String)>,
    backup_seq: u64,
    applies: usize,
}

/// Hypervisor keeping VNets, VMs, NICs and backups in memory.
#[derive(Default)]
pub struct MemoryHypervisor {
    state: Mutex<HypervisorState>,
    /// Failure injection and call log.
    pub faults: Faults,
}

impl MemoryHypervisor {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// VNet names and tags.
    pub fn vnets(&self) -> BTreeMap<String, u32> {
        lock(&self.state)
            .vnets
            .iter()
            .map(|(name, vnet)| (name.clone(), vnet.tag))
            .collect()
    }

    /// A VNet, if present.
    pub fn vnet(&self, name: &str) -> Option<VnetSpec> {
        lock(&self.state).vnets.get(name).cloned()
    }

    /// Replace or add a VNet directly, as if changed outside the reconciler.
    pub fn set_vnet(&self, vnet: VnetSpec) {
        lock(&self.state).vnets.insert(vnet.name.clone(), vnet);
    }

    /// Remove a VNet behind the reconciler's back.
    pub fn drop_vnet(&self, name: &str) {
        lock(&self.state).vnets.remove(name);
    }

    /// Backups by volume id.
    pub fn backups(&self) -> BTreeMap<String, BackupSpec> {
        lock(&self.state).backups.clone()
    }

    /// Restores performed, as `(vm_id, volid)`.
    pub fn restores(&self) -> Vec<(i64, String)> {
        lock(&self.state).restores.clone()
    }

    /// Ids of the VMs present.
    pub fn vm_ids(&self) -> Vec<i64> {
        lock(&self.state).vms.keys().copied().collect()
    }

    /// Spec of a VM, if present.
    pub fn vm(&self, id: i64) -> Option<VmSpec> {
        lock(&self.state).vms.get(&id).map(|(spec, _)| spec.clone())
    }

    /// NICs attached to a VM.
    pub fn nics(&self, vm_id: i64) -> Vec<NicSpec> {
        lock(&self.state)
            .nics
            .range((vm_id, i64::MIN)..=(vm_id, i64::MAX))
            .map(|(_, nic)| nic.clone())
            .collect()
    }

    /// Successful SDN applies so far.
    pub fn apply_count(&self) -> usize {
        lock(&self.state).applies
    }

    /// Add a VM directly, as if created outside the reconciler.
    pub fn insert_vm(&self, vm: VmSpec, state: VmPowerState) {
        lock(&self.state).vms.insert(vm.id, (vm, state));
    }

    /// Remove a VM behind the reconciler's back.
    pub fn drop_vm(&self, id: i64) {
        let mut state = lock(&self.state);
        state.vms.remove(&id);
        state.nics.retain(|(vm_id, _), _| *vm_id != id);
    }
}

#[async_trait]
impl Hypervisor for MemoryHypervisor {
    async fn create_vnet(&self, vnet: &VnetSpec) -> Result<()> {
        self.faults.enter("create_vnet")?;
        let mut state = lock(&self.state);
        if state.vnets.contains_key(&vnet.name) {
            return Err(BackendError::AlreadyExists(format!("vnet {}", vnet.name)));
        }
        state.vnets.insert(vnet.name.clone(), vnet.clone());
        Ok(())
    }

    async fn update_vnet(&self, vnet: &VnetSpec) -> Result<()> {
        self.faults.enter("update_vnet")?;
        let mut state = lock(&self.state);
        let existing = state
            .vnets
            .get_mut(&vnet.name)
            .ok_or_else(|| BackendError::NotFound(format!("vnet {}", vnet.name)))?;
        *existing = vnet.clone();
        Ok(())
    }

    async fn delete_vnet(&self, name: &str) -> Result<()> {
        self.faults.enter("delete_vnet")?;
        match lock(&self.state).vnets.remove(name) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!("vnet {name}"))),
        }
    }

    async fn list_vnets(&self) -> Result<Vec<VnetSpec>> {
        self.faults.enter("list_vnets")?;
        Ok(lock(&self.state).vnets.values().cloned().collect())
    }

    async fn apply_network_changes(&self) -> Result<()> {
        self.faults.enter("apply_network_changes")?;
        lock(&self.state).applies += 1;
        Ok(())
    }

    async fn clone_vm(&self, vm: &VmSpec) -> Result<()> {
        self.faults.enter("clone_vm")?;
        let mut state = lock(&self.state);
        if state.vms.contains_key(&vm.id) {
            return Err(BackendError::AlreadyExists(format!("vm {}", vm.id)));
        }
        state.vms.insert(vm.id, (vm.clone(), VmPowerState::Stopped));
        Ok(())
    }

    async fn configure_vm(&self, vm: &VmSpec) -> Result<()> {
        self.faults.enter("configure_vm")?;
        let mut state = lock(&self.state);
        let entry = state
            .vms
            .get_mut(&vm.id)
            .ok_or_else(|| BackendError::NotFound(format!("vm {}", vm.id)))?;
        entry.0 = vm.clone();
        Ok(())
    }

    async fn delete_vm(&self, vm_id: i64) -> Result<()> {
        self.faults.enter("delete_vm")?;
        let mut state = lock(&self.state);
        if state.vms.remove(&vm_id).is_none() {
            return Err(BackendError::NotFound(format!("vm {vm_id}")));
        }
        state.nics.retain(|(id, _), _| *id != vm_id);
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<HypervisorVm>> {
        self.faults.enter("list_vms")?;
        Ok(lock(&self.state)
            .vms
            .iter()
            .map(|(id, (_, power))| HypervisorVm {
                id: *id,
                state: *power,
            })
            .collect())
    }

    async fn attach_interface(&self, nic: &NicSpec) -> Result<()> {
        self.faults.enter("attach_interface")?;
        let mut state = lock(&self.state);
        if !state.vms.contains_key(&nic.vm_id) {
            return Err(BackendError::NotFound(format!("vm {}", nic.vm_id)));
        }
        let key = (nic.vm_id, nic.interface_id);
        if state.nics.contains_key(&key) {
            return Err(BackendError::AlreadyExists(format!(
                "interface {} on vm {}",
                nic.interface_id, nic.vm_id
            )));
        }
        state.nics.insert(key, nic.clone());
        Ok(())
    }

    async fn configure_interface(&self, nic: &NicSpec) -> Result<()> {
        self.faults.enter("configure_interface")?;
        let mut state = lock(&self.state);
        let existing = state
            .nics
            .get_mut(&(nic.vm_id, nic.interface_id))
            .ok_or_else(|| {
                BackendError::NotFound(format!(
                    "interface {} on vm {}",
                    nic.interface_id, nic.vm_id
                ))
            })?;
        *existing = nic.clone();
        Ok(())
    }

    async fn detach_interface(&self, vm_id: i64, interface_id: i64) -> Result<()> {
        self.faults.enter("detach_interface")?;
        match lock(&self.state).nics.remove(&(vm_id, interface_id)) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!(
                "interface {interface_id} on vm {vm_id}"
            ))),
        }
    }

    async fn create_backup(&self, backup: &BackupSpec) -> Result<String> {
        self.faults.enter("create_backup")?;
        let mut state = lock(&self.state);
        if !state.vms.contains_key(&backup.vm_id) {
            return Err(BackendError::NotFound(format!("vm {}", backup.vm_id)));
        }
        state.backup_seq += 1;
        let volid = format!("backup:vzdump-qemu-{}-{}", backup.vm_id, state.backup_seq);
        state.backups.insert(volid.clone(), backup.clone());
        Ok(volid)
    }

    async fn restore_backup(&self, vm_id: i64, volid: &str) -> Result<()> {
        self.faults.enter("restore_backup")?;
        let mut state = lock(&self.state);
        if !state.vms.contains_key(&vm_id) {
            return Err(BackendError::NotFound(format!("vm {vm_id}")));
        }
        match state.backups.get(volid) {
            Some(backup) if backup.vm_id == vm_id => {}
            Some(_) => {
                return Err(BackendError::Rejected(format!(
                    "backup {volid} does not belong to vm {vm_id}"
                )));
            }
            None => return Err(BackendError::NotFound(format!("backup {volid}"))),
        }
        state.restores.push((vm_id, volid.to_string()));
        Ok(())
    }

    async fn delete_backup(&self, volid: &str) -> Result<()> {
        self.faults.enter("delete_backup")?;
        match lock(&self.state).backups.remove(volid) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!("backup {volid}"))),
        }
    }
}

// ============================================================================
// Notification channels
// ============================================================================

/// A message captured by [`MemoryEmail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    /// Recipient.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Body.
    pub body: String,
}

/// Email sender that records messages instead of delivering them.
#[derive(Default)]
pub struct MemoryEmail {
    sent: Mutex<Vec<SentEmail>>,
    /// Failure injection and call log.
    pub faults: Faults,
}

impl MemoryEmail {
    /// Create a sender with an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered so far.
    pub fn sent(&self) -> Vec<SentEmail> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl EmailSender for MemoryEmail {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        self.faults.enter("send")?;
        lock(&self.sent).push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Telegram sender that records messages instead of posting them.
#[derive(Default)]
pub struct MemoryTelegram {
    sent: Mutex<Vec<(String, String)>>,
    /// Failure injection and call log.
    pub faults: Faults,
}

impl MemoryTelegram {
    /// Create a sender with an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(chat_id, text)` pairs delivered so far.
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl TelegramSender for MemoryTelegram {
    async fn send(&self, target: &TelegramTarget, text: &str) -> Result<()> {
        self.faults.enter("send")?;
        lock(&self.sent).push((target.chat_id.clone(), text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::Ipv4Subnet;
    use std::net::Ipv4Addr;

    fn spec(vnet: &str, tag: u32) -> InterfaceSpec {
        let subnet: Ipv4Subnet = "10.0.0.0/24".parse().unwrap();
        InterfaceSpec {
            vnet: vnet.to_string(),
            vnet_tag: tag,
            subnet,
            router_ip: subnet.router_address(),
            broadcast: subnet.broadcast(),
        }
    }

    #[tokio::test]
    async fn test_faults_fail_then_recover() {
        let gateway = MemoryGateway::new();
        gateway.faults.fail("new_interface", 2);

        assert!(gateway.new_interface(&spec("alpha", 100)).await.is_err());
        assert!(gateway.new_interface(&spec("alpha", 100)).await.is_err());
        assert!(gateway.new_interface(&spec("alpha", 100)).await.is_ok());
        assert_eq!(gateway.faults.call_count("new_interface"), 3);
    }

    #[tokio::test]
    async fn test_fail_any_applies_to_every_operation() {
        let firewall = MemoryFirewall::new();
        firewall.faults.fail_any(1);
        assert!(matches!(
            firewall.reload().await,
            Err(BackendError::Unreachable(_))
        ));
        assert!(firewall.reload().await.is_ok());
        assert_eq!(firewall.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_gateway_verify_detects_drift() {
        let gateway = MemoryGateway::new();
        let s = spec("alpha", 100);
        let created = gateway.new_interface(&s).await.unwrap();
        assert!(gateway.verify_interface(&created.local_id, &s).await.unwrap());

        let mut changed = s.clone();
        changed.router_ip = Ipv4Addr::new(10, 0, 0, 1);
        assert!(!gateway
            .verify_interface(&created.local_id, &changed)
            .await
            .unwrap());

        gateway.drop_interface(&created.local_id);
        assert!(!gateway.verify_interface(&created.local_id, &s).await.unwrap());
    }

    #[tokio::test]
    async fn test_firewall_duplicate_and_missing() {
        let firewall = MemoryFirewall::new();
        firewall.add_zone("alpha").await.unwrap();
        assert!(firewall.add_zone("alpha").await.unwrap_err().is_already_exists());
        assert!(firewall.remove_zone("beta").await.unwrap_err().is_not_found());
        assert!(tolerate_missing(firewall.remove_zone("beta").await).is_ok());
    }

    #[tokio::test]
    async fn test_dns_remove_zone_drops_empty_view() {
        let dns = MemoryDns::new();
        dns.create_zone(&DnsZone {
            name: "sasso..net1".into(),
            rrsets: vec![],
        })
        .await
        .unwrap();
        dns.add_zone_to_view("net1", "sasso..net1").await.unwrap();
        dns.set_network_view("10.0.0.0/24", "net1").await.unwrap();

        let views = dns.fetch_views().await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].networks, vec!["10.0.0.0/24".to_string()]);
        assert_eq!(views[0].zones.len(), 1);

        dns.remove_zone("sasso..net1").await.unwrap();
        dns.remove_network("10.0.0.0/24").await.unwrap();
        assert!(dns.fetch_views().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hypervisor_delete_missing_vm() {
        let hv = MemoryHypervisor::new();
        assert!(hv.delete_vm(5).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_hypervisor_vnet_update_and_list() {
        let hv = MemoryHypervisor::new();
        let mut vnet = VnetSpec {
            name: "alpha".into(),
            tag: 100,
            vlan_aware: false,
        };
        hv.create_vnet(&vnet).await.unwrap();

        vnet.vlan_aware = true;
        hv.update_vnet(&vnet).await.unwrap();
        assert_eq!(hv.list_vnets().await.unwrap(), vec![vnet]);

        let missing = VnetSpec {
            name: "beta".into(),
            tag: 101,
            vlan_aware: false,
        };
        assert!(hv.update_vnet(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_hypervisor_backup_lifecycle() {
        let hv = MemoryHypervisor::new();
        let vm = VmSpec {
            id: 7,
            name: "web".into(),
            cores: 1,
            ram_mb: 512,
            disk_gb: 8,
        };
        let backup = BackupSpec {
            vm_id: 7,
            name: "nightly".into(),
            notes: String::new(),
        };
        assert!(hv.create_backup(&backup).await.unwrap_err().is_not_found());

        hv.insert_vm(vm, VmPowerState::Running);
        let volid = hv.create_backup(&backup).await.unwrap();
        assert_eq!(volid, "backup:vzdump-qemu-7-1");

        hv.restore_backup(7, &volid).await.unwrap();
        assert_eq!(hv.restores(), vec![(7, volid.clone())]);

        hv.delete_backup(&volid).await.unwrap();
        assert!(hv.backups().is_empty());
        assert!(hv.delete_backup(&volid).await.unwrap_err().is_not_found());
    }
}
