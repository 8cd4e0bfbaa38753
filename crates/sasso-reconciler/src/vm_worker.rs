// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hypervisor-domain reconciler: nets, VMs, VM interfaces, backups and
//! status drift of VMs and nets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sasso_core::backend::{
    BackupSpec, Hypervisor, NicSpec, VmSpec, VnetSpec, tolerate_exists, tolerate_missing,
};
use sasso_core::store::{
    BackupRequestKind, BackupRequestRecord, BackupRequestStatus, NetRecord, NewNotification,
    VmInterfaceRecord, VmRecord,
};
use sasso_core::{GuardKey, GuardTable, ResourceStatus, SassoError, Store};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::{WorkerMetrics, timed};
use crate::worker::{CycleReport, Reconciler};

/// What happened to one item.
enum Step {
    Done,
    Skipped,
}

/// Reconciles hypervisor resources against their recorded status.
pub struct VmReconciler {
    store: Arc<dyn Store>,
    hypervisor: Arc<dyn Hypervisor>,
    guards: Arc<GuardTable>,
    metrics: Option<WorkerMetrics>,
}

impl VmReconciler {
    /// Create a hypervisor reconciler.
    pub fn new(
        store: Arc<dyn Store>,
        hypervisor: Arc<dyn Hypervisor>,
        guards: Arc<GuardTable>,
    ) -> Self {
        Self {
            store,
            hypervisor,
            guards,
            metrics: None,
        }
    }

    /// Record step timings, object counts and cycle outcomes on `metrics`.
    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // ========================================================================
    // Nets
    // ========================================================================

    /// Create and delete VNets.
    pub async fn process_nets(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for status in [ResourceStatus::PreCreating, ResourceStatus::PreDeleting] {
            for net in self.store.list_nets_by_status(status).await? {
                let _guard = self.guards.acquire(&GuardKey::network(&net.name)).await;
                let outcome = match status {
                    ResourceStatus::PreCreating => self.create_net(&net).await,
                    _ => self.delete_net(&net).await,
                };
                tally(&mut report, outcome, "net", net.id);
            }
        }

        Ok(report)
    }

    async fn create_net(&self, net: &NetRecord) -> Result<Step> {
        if !still(self.store.get_net(net.id).await?.map(|n| n.status), net.status) {
            return Ok(Step::Skipped);
        }

        tolerate_exists(self.hypervisor.create_vnet(&vnet_spec(net)).await)?;
        self.hypervisor.apply_network_changes().await?;
        self.store
            .update_net_status(net.id, ResourceStatus::Ready)
            .await?;

        info!(net_id = net.id, vnet = %net.name, tag = net.tag, "Net created");
        Ok(Step::Done)
    }

    async fn delete_net(&self, net: &NetRecord) -> Result<Step> {
        let forwards_left = self
            .store
            .list_port_forwards_by_status(ResourceStatus::PreDeleting)
            .await?
            .iter()
            .any(|pf| pf.net_id == net.id);
        if forwards_left {
            debug!(net_id = net.id, "Waiting for port forwards to be removed first");
            return Ok(Step::Skipped);
        }
        if !self.store.list_vm_interfaces_for_net(net.id).await?.is_empty() {
            debug!(net_id = net.id, "Waiting for VM interfaces to be removed first");
            return Ok(Step::Skipped);
        }

        tolerate_missing(self.hypervisor.delete_vnet(&net.name).await)?;
        self.hypervisor.apply_network_changes().await?;
        self.store.delete_net(net.id).await?;

        info!(net_id = net.id, vnet = %net.name, "Net deleted");
        Ok(Step::Done)
    }

    /// Push changed VNet settings to the hypervisor.
    ///
    /// Retryable failures leave the net `pre-configuring`; any other failure
    /// marks it `unknown`.
    pub async fn configure_nets(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for net in self
            .store
            .list_nets_by_status(ResourceStatus::PreConfiguring)
            .await?
        {
            let _guard = self.guards.acquire(&GuardKey::network(&net.name)).await;
            let outcome = self.configure_net(&net).await;
            tally(&mut report, outcome, "net", net.id);
        }

        Ok(report)
    }

    async fn configure_net(&self, net: &NetRecord) -> Result<Step> {
        let Some(current) = self.store.get_net(net.id).await? else {
            return Ok(Step::Skipped);
        };
        if current.status != ResourceStatus::PreConfiguring {
            return Ok(Step::Skipped);
        }

        let applied = match self.hypervisor.update_vnet(&vnet_spec(&current)).await {
            Ok(()) => self.hypervisor.apply_network_changes().await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(()) => {
                self.store
                    .update_net_status(net.id, ResourceStatus::Ready)
                    .await?;
                info!(net_id = net.id, vnet = %net.name, vlan_aware = current.vlan_aware, "Net configured");
                Ok(Step::Done)
            }
            Err(e) if e.is_retryable() => Err(e.into()),
            Err(e) => {
                self.store
                    .update_net_status(net.id, ResourceStatus::Unknown)
                    .await?;
                error!(net_id = net.id, vnet = %net.name, error = %e, "Net configuration failed");
                Err(e.into())
            }
        }
    }

    /// Flag ready nets whose VNet is gone or differs from the record, and
    /// recover the ones that match again.
    pub async fn check_net_drift(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let present: HashMap<String, VnetSpec> = self
            .hypervisor
            .list_vnets()
            .await?
            .into_iter()
            .map(|vnet| (vnet.name.clone(), vnet))
            .collect();

        for net in self.store.list_nets_by_status(ResourceStatus::Ready).await? {
            let Some(reason) = net_drift(&net, present.get(&net.name)) else {
                continue;
            };
            let outcome = self.transition_net(&net, ResourceStatus::Unknown, reason).await;
            tally(&mut report, outcome, "net", net.id);
        }

        for net in self.store.list_nets_by_status(ResourceStatus::Unknown).await? {
            if net_drift(&net, present.get(&net.name)).is_some() {
                continue;
            }
            let outcome = self
                .transition_net(&net, ResourceStatus::Ready, "matches the hypervisor again")
                .await;
            tally(&mut report, outcome, "net", net.id);
        }

        Ok(report)
    }

    async fn transition_net(&self, net: &NetRecord, to: ResourceStatus, reason: &str) -> Result<Step> {
        let _guard = self.guards.acquire(&GuardKey::network(&net.name)).await;
        if !still(self.store.get_net(net.id).await?.map(|n| n.status), net.status) {
            return Ok(Step::Skipped);
        }

        self.store.update_net_status(net.id, to).await?;
        warn!(
            net_id = net.id,
            vnet = %net.name,
            from = net.status.as_str(),
            to = to.as_str(),
            reason,
            "Net status drift"
        );
        Ok(Step::Done)
    }

    // ========================================================================
    // VMs
    // ========================================================================

    /// Clone, configure and delete VMs.
    pub async fn process_vms(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for status in [
            ResourceStatus::PreCreating,
            ResourceStatus::PreConfiguring,
            ResourceStatus::PreDeleting,
        ] {
            for vm in self.store.list_vms_by_status(status).await? {
                let _guard = self.guards.acquire(&GuardKey::vm(vm.id)).await;
                let current = self.store.get_vm(vm.id).await?.map(|v| v.status);
                let outcome = if !still(current, status) {
                    Ok(Step::Skipped)
                } else {
                    match status {
                        ResourceStatus::PreCreating => self.clone_vm(&vm).await,
                        ResourceStatus::PreConfiguring => self.configure_vm(&vm).await,
                        _ => self.delete_vm(&vm).await,
                    }
                };
                tally(&mut report, outcome, "vm", vm.id);
            }
        }

        Ok(report)
    }

    async fn clone_vm(&self, vm: &VmRecord) -> Result<Step> {
        tolerate_exists(self.hypervisor.clone_vm(&vm_spec(vm)).await)?;
        self.store
            .update_vm_status(vm.id, ResourceStatus::PreConfiguring)
            .await?;
        info!(vm_id = vm.id, name = %vm.name, "VM cloned");
        Ok(Step::Done)
    }

    async fn configure_vm(&self, vm: &VmRecord) -> Result<Step> {
        self.hypervisor.configure_vm(&vm_spec(vm)).await?;
        self.store
            .update_vm_status(vm.id, ResourceStatus::Ready)
            .await?;
        self.store
            .insert_notification(&NewNotification::to_user(
                vm.owner_id,
                "VM ready",
                format!("Your VM {} is ready.", vm.name),
            ))
            .await?;
        info!(vm_id = vm.id, name = %vm.name, "VM ready");
        Ok(Step::Done)
    }

    async fn delete_vm(&self, vm: &VmRecord) -> Result<Step> {
        self.store.delete_vm_interfaces_for_vm(vm.id).await?;
        tolerate_missing(self.hypervisor.delete_vm(vm.id).await)?;
        self.store.delete_vm(vm.id).await?;
        info!(vm_id = vm.id, name = %vm.name, "VM deleted");
        Ok(Step::Done)
    }

    // ========================================================================
    // VM interfaces
    // ========================================================================

    /// Attach, configure and detach VM interfaces.
    pub async fn process_interfaces(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for status in [
            ResourceStatus::PreCreating,
            ResourceStatus::PreConfiguring,
            ResourceStatus::PreDeleting,
        ] {
            for iface in self.store.list_vm_interfaces_by_status(status).await? {
                let _guard = self.guards.acquire(&GuardKey::vm(iface.vm_id)).await;
                let outcome = self.process_interface(&iface).await;
                match outcome {
                    Err(Error::Core(e @ SassoError::InvalidState { .. })) => {
                        debug!(interface_id = iface.id, reason = %e, "Interface skipped");
                        report.skip();
                    }
                    other => tally(&mut report, other, "vm interface", iface.id),
                }
            }
        }

        Ok(report)
    }

    async fn process_interface(&self, iface: &VmInterfaceRecord) -> Result<Step> {
        let Some(current) = self.store.get_vm_interface(iface.id).await? else {
            return Ok(Step::Skipped);
        };
        if current.status != iface.status {
            return Ok(Step::Skipped);
        }

        let Some(vm) = self.store.get_vm(iface.vm_id).await? else {
            return Ok(Step::Skipped);
        };
        match vm.status {
            // The VM deletion takes its interfaces with it
            ResourceStatus::PreDeleting => {
                return Err(SassoError::InvalidState {
                    entity: "vm",
                    id: vm.id.to_string(),
                    status: vm.status.as_str().to_string(),
                }
                .into());
            }
            ResourceStatus::PreCreating if iface.status != ResourceStatus::PreDeleting => {
                debug!(interface_id = iface.id, vm_id = vm.id, "VM not cloned yet");
                return Ok(Step::Skipped);
            }
            _ => {}
        }

        if iface.status == ResourceStatus::PreDeleting {
            tolerate_missing(self.hypervisor.detach_interface(iface.vm_id, iface.id).await)?;
            self.store.delete_vm_interface(iface.id).await?;
            info!(interface_id = iface.id, vm_id = iface.vm_id, "VM interface detached");
            return Ok(Step::Done);
        }

        let Some(net) = self.store.get_net(iface.net_id).await? else {
            warn!(interface_id = iface.id, net_id = iface.net_id, "Interface references a missing net");
            return Ok(Step::Skipped);
        };
        let nic = NicSpec {
            vm_id: iface.vm_id,
            interface_id: iface.id,
            vnet: net.name.clone(),
            vnet_tag: net.tag,
            address: iface.address.clone(),
            gateway: iface.gateway.clone(),
        };

        if iface.status == ResourceStatus::PreCreating {
            tolerate_exists(self.hypervisor.attach_interface(&nic).await)?;
        } else {
            self.hypervisor.configure_interface(&nic).await?;
        }
        self.store
            .update_vm_interface_status(iface.id, ResourceStatus::Ready)
            .await?;

        info!(
            interface_id = iface.id,
            vm_id = iface.vm_id,
            vnet = %net.name,
            address = %iface.address,
            "VM interface ready"
        );
        Ok(Step::Done)
    }

    // ========================================================================
    // Status drift
    // ========================================================================

    /// Flag ready VMs the hypervisor lost, and recover the ones that came back.
    pub async fn check_status_drift(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let present: HashSet<i64> = self
            .hypervisor
            .list_vms()
            .await?
            .into_iter()
            .map(|vm| vm.id)
            .collect();

        for vm in self.store.list_vms_by_status(ResourceStatus::Ready).await? {
            if present.contains(&vm.id) {
                continue;
            }
            let outcome = self
                .transition(&vm, ResourceStatus::Unknown, "is no longer reported by the hypervisor")
                .await;
            tally(&mut report, outcome, "vm", vm.id);
        }

        for vm in self.store.list_vms_by_status(ResourceStatus::Unknown).await? {
            if !present.contains(&vm.id) {
                continue;
            }
            let outcome = self
                .transition(&vm, ResourceStatus::Ready, "is available again")
                .await;
            tally(&mut report, outcome, "vm", vm.id);
        }

        Ok(report)
    }

    async fn transition(&self, vm: &VmRecord, to: ResourceStatus, what: &str) -> Result<Step> {
        let _guard = self.guards.acquire(&GuardKey::vm(vm.id)).await;
        if !still(self.store.get_vm(vm.id).await?.map(|v| v.status), vm.status) {
            return Ok(Step::Skipped);
        }

        self.store.update_vm_status(vm.id, to).await?;
        self.store
            .insert_notification(&NewNotification::to_user(
                vm.owner_id,
                "VM status changed",
                format!("Your VM {} {what}.", vm.name),
            ))
            .await?;

        warn!(vm_id = vm.id, name = %vm.name, from = vm.status.as_str(), to = to.as_str(), "VM status drift");
        Ok(Step::Done)
    }

    // ========================================================================
    // Backups
    // ========================================================================

    /// Run pending backup requests: deletes, then restores, then creates.
    ///
    /// Retryable hypervisor failures leave the request pending. Any other
    /// outcome resolves it and notifies the owner.
    pub async fn process_backups(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for kind in [
            BackupRequestKind::Delete,
            BackupRequestKind::Restore,
            BackupRequestKind::Create,
        ] {
            for request in self.store.list_pending_backup_requests(kind).await? {
                let _guard = self.guards.acquire(&GuardKey::vm(request.vm_id)).await;
                let outcome = self.process_backup(&request).await;
                tally(&mut report, outcome, "backup request", request.id);
            }
        }

        Ok(report)
    }

    async fn process_backup(&self, request: &BackupRequestRecord) -> Result<Step> {
        match self.store.get_backup_request(request.id).await? {
            Some(current) if current.status == BackupRequestStatus::Pending => {}
            _ => return Ok(Step::Skipped),
        }

        let vm = match self.store.get_vm(request.vm_id).await? {
            Some(vm) if vm.status != ResourceStatus::PreDeleting => vm,
            _ => {
                return self
                    .fail_backup(request, "the VM no longer exists")
                    .await;
            }
        };
        let volid = request.volid.as_deref().filter(|v| !v.is_empty());

        let outcome = match (request.kind, volid) {
            (BackupRequestKind::Create, _) => self
                .hypervisor
                .create_backup(&BackupSpec {
                    vm_id: vm.id,
                    name: request.name.clone(),
                    notes: request.notes.clone(),
                })
                .await
                .map(Some),
            (BackupRequestKind::Restore, Some(volid)) => self
                .hypervisor
                .restore_backup(vm.id, volid)
                .await
                .map(|()| None),
            (BackupRequestKind::Delete, Some(volid)) => self
                .hypervisor
                .delete_backup(volid)
                .await
                .map(|()| None),
            (_, None) => return self.fail_backup(request, "no backup volume given").await,
        };

        match outcome {
            Ok(created) => {
                self.store
                    .finish_backup_request(
                        request.id,
                        BackupRequestStatus::Completed,
                        created.as_deref(),
                        None,
                    )
                    .await?;
                self.store
                    .insert_notification(&NewNotification::to_user(
                        request.owner_id,
                        "Backup request completed",
                        format!(
                            "The {} backup request for VM {} has completed.",
                            request.kind.as_str(),
                            vm.name
                        ),
                    ))
                    .await?;
                info!(
                    backup_request_id = request.id,
                    vm_id = vm.id,
                    kind = request.kind.as_str(),
                    volid = created.as_deref().or(volid),
                    "Backup request completed"
                );
                Ok(Step::Done)
            }
            Err(e) if e.is_retryable() => Err(e.into()),
            Err(e) => self.fail_backup(request, &e.to_string()).await,
        }
    }

    async fn fail_backup(&self, request: &BackupRequestRecord, reason: &str) -> Result<Step> {
        self.store
            .finish_backup_request(request.id, BackupRequestStatus::Failed, None, Some(reason))
            .await?;
        self.store
            .insert_notification(&NewNotification::to_user(
                request.owner_id,
                "Backup request failed",
                format!(
                    "The {} backup request for VM {} failed: {reason}",
                    request.kind.as_str(),
                    request.vm_id
                ),
            ))
            .await?;
        warn!(
            backup_request_id = request.id,
            vm_id = request.vm_id,
            kind = request.kind.as_str(),
            reason,
            "Backup request failed"
        );
        Ok(Step::Done)
    }

    /// Publish row counts of the reconciled resources.
    async fn record_objects(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match self.store.count_objects().await {
            Ok(counts) => metrics.record_objects(&counts),
            Err(e) => warn!(error = %e, "Failed to count objects"),
        }
    }
}

/// Why a net no longer matches its VNet, if it does not.
fn net_drift(net: &NetRecord, vnet: Option<&VnetSpec>) -> Option<&'static str> {
    match vnet {
        None => Some("is no longer reported by the hypervisor"),
        Some(vnet) if vnet.tag != net.tag => Some("has a different tag"),
        Some(vnet) if vnet.vlan_aware != net.vlan_aware => Some("has a different VLAN awareness"),
        Some(_) => None,
    }
}

fn vnet_spec(net: &NetRecord) -> VnetSpec {
    VnetSpec {
        name: net.name.clone(),
        tag: net.tag,
        vlan_aware: net.vlan_aware,
    }
}

/// Whether the row still has the status it was listed with.
fn still(current: Option<ResourceStatus>, listed: ResourceStatus) -> bool {
    current == Some(listed)
}

fn vm_spec(vm: &VmRecord) -> VmSpec {
    VmSpec {
        id: vm.id,
        name: vm.name.clone(),
        cores: vm.cores,
        ram_mb: vm.ram_mb,
        disk_gb: vm.disk_gb,
    }
}

fn tally(report: &mut CycleReport, outcome: Result<Step>, entity: &'static str, id: i64) {
    match outcome {
        Ok(Step::Done) => report.succeed(),
        Ok(Step::Skipped) => report.skip(),
        Err(e) => {
            error!(entity, id, error = %e, "Reconcile action failed, will retry");
            report.fail();
        }
    }
}

#[async_trait]
impl Reconciler for VmReconciler {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn metrics(&self) -> Option<&WorkerMetrics> {
        self.metrics.as_ref()
    }

    async fn reconcile(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let metrics = self.metrics.as_ref();

        match timed(metrics, "vm", "process_nets", self.process_nets()).await {
            Ok(r) => report.merge(r),
            Err(e) => error!(error = %e, "Net processing failed"),
        }
        match timed(metrics, "vm", "configure_nets", self.configure_nets()).await {
            Ok(r) => report.merge(r),
            Err(e) => error!(error = %e, "Net configuration failed"),
        }
        match timed(metrics, "vm", "check_net_drift", self.check_net_drift()).await {
            Ok(r) => report.merge(r),
            Err(e) => error!(error = %e, "Net status check failed"),
        }
        match timed(metrics, "vm", "process_vms", self.process_vms()).await {
            Ok(r) => report.merge(r),
            Err(e) => error!(error = %e, "VM processing failed"),
        }
        match timed(metrics, "vm", "process_interfaces", self.process_interfaces()).await {
            Ok(r) => report.merge(r),
            Err(e) => error!(error = %e, "VM interface processing failed"),
        }
        match timed(metrics, "vm", "check_status_drift", self.check_status_drift()).await {
            Ok(r) => report.merge(r),
            Err(e) => error!(error = %e, "VM status check failed"),
        }
        match timed(metrics, "vm", "process_backups", self.process_backups()).await {
            Ok(r) => report.merge(r),
            Err(e) => error!(error = %e, "Backup processing failed"),
        }
        self.record_objects().await;

        Ok(report)
    }
}
