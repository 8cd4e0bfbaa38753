// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Check-then-act operations for API handlers.
//!
//! Each operation holds the resource's guard from the first read to the
//! last write, so a concurrent handler or the reconciler cannot slip a
//! conflicting change in between. Network resources are guarded by VNet
//! name; operations that take a VM guard as well take it first.

use std::net::Ipv4Addr;

use sasso_core::addressing::{Ipv4Subnet, parse_host_address};
use sasso_core::store::{
    BackupRequestKind, NetRecord, NewBackupRequest, NewPortForward, NewVmInterface, VmRecord,
};
use sasso_core::{GuardKey, GuardTable, ResourceStatus, Result, SassoError, Store};
use tokio::sync::OwnedMutexGuard;
use tracing::info;

/// Longest accepted backup name, in characters.
pub const MAX_BACKUP_NAME_CHARS: usize = 40;

/// Longest accepted backup notes, in bytes. The hypervisor stores notes
/// base64-encoded in a 900 byte field.
pub const MAX_BACKUP_NOTES_BYTES: usize = 900 * 3 / 4;

/// A port forward a user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardRequest {
    /// Net the destination lives in.
    pub net_id: i64,
    /// Requesting user.
    pub owner_id: i64,
    /// Public port.
    pub out_port: u16,
    /// Destination port.
    pub dest_port: u16,
    /// Destination address.
    pub dest_ip: Ipv4Addr,
}

/// A backup operation a user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    /// VM the backup belongs to.
    pub vm_id: i64,
    /// Requesting user.
    pub owner_id: i64,
    /// Operation.
    pub kind: BackupRequestKind,
    /// Backup name, for `create`.
    pub name: String,
    /// Free-form notes, for `create`.
    pub notes: String,
    /// Volume id of an existing backup, for `restore` and `delete`.
    pub volid: Option<String>,
}

/// A VM interface a user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInterfaceRequest {
    /// VM to attach to.
    pub vm_id: i64,
    /// Net to attach to.
    pub net_id: i64,
    /// Address in CIDR form.
    pub address: String,
    /// Default gateway, for the primary interface.
    pub gateway: Option<String>,
}

fn invalid_state(entity: &'static str, id: i64, status: ResourceStatus) -> SassoError {
    SassoError::InvalidState {
        entity,
        id: id.to_string(),
        status: status.as_str().to_string(),
    }
}

async fn live_net(store: &dyn Store, net_id: i64) -> Result<NetRecord> {
    let net = store
        .get_net(net_id)
        .await?
        .ok_or_else(|| SassoError::not_found("net", net_id))?;
    if net.status == ResourceStatus::PreDeleting {
        return Err(invalid_state("net", net.id, net.status));
    }
    Ok(net)
}

/// Resolve the net's VNet name and take its guard.
async fn lock_net(store: &dyn Store, guards: &GuardTable, net_id: i64) -> Result<OwnedMutexGuard<()>> {
    let net = store
        .get_net(net_id)
        .await?
        .ok_or_else(|| SassoError::not_found("net", net_id))?;
    Ok(guards.acquire(&GuardKey::network(&net.name)).await)
}

async fn live_vm(store: &dyn Store, vm_id: i64) -> Result<VmRecord> {
    let vm = store
        .get_vm(vm_id)
        .await?
        .ok_or_else(|| SassoError::not_found("vm", vm_id))?;
    if vm.status == ResourceStatus::PreDeleting {
        return Err(invalid_state("vm", vm.id, vm.status));
    }
    Ok(vm)
}

/// Record a new port forward for the reconciler to create.
pub async fn request_port_forward(
    store: &dyn Store,
    guards: &GuardTable,
    request: &PortForwardRequest,
) -> Result<i64> {
    let _guard = lock_net(store, guards, request.net_id).await?;

    let net = live_net(store, request.net_id).await?;
    let subnet: Ipv4Subnet = net.subnet.parse()?;
    if !subnet.contains(request.dest_ip) {
        return Err(SassoError::validation(
            "dest_ip",
            format!("{} is not inside {}", request.dest_ip, subnet),
        ));
    }
    if store
        .get_port_forward_by_out_port(request.out_port)
        .await?
        .is_some()
    {
        return Err(SassoError::Conflict(format!(
            "port {} is already forwarded",
            request.out_port
        )));
    }

    let id = store
        .insert_port_forward(&NewPortForward {
            net_id: request.net_id,
            owner_id: request.owner_id,
            out_port: request.out_port,
            dest_port: request.dest_port,
            dest_ip: request.dest_ip.to_string(),
            status: ResourceStatus::PreCreating,
        })
        .await?;

    info!(port_forward_id = id, net_id = request.net_id, out_port = request.out_port, "Port forward requested");
    Ok(id)
}

/// Mark a net and all its port forwards for deletion.
///
/// Refused while any VM interface on the net is not itself being deleted.
pub async fn request_net_deletion(store: &dyn Store, guards: &GuardTable, net_id: i64) -> Result<()> {
    let _guard = lock_net(store, guards, net_id).await?;

    let net = store
        .get_net(net_id)
        .await?
        .ok_or_else(|| SassoError::not_found("net", net_id))?;
    if net.status == ResourceStatus::PreDeleting {
        return Ok(());
    }

    let attached = store.list_vm_interfaces_for_net(net_id).await?;
    if let Some(iface) = attached
        .iter()
        .find(|iface| iface.status != ResourceStatus::PreDeleting)
    {
        return Err(SassoError::InvalidState {
            entity: "net",
            id: net_id.to_string(),
            status: format!("in use by interface {} of vm {}", iface.id, iface.vm_id),
        });
    }

    store.mark_net_for_deletion(net_id).await?;
    info!(net_id, vnet = %net.name, "Net deletion requested");
    Ok(())
}

/// Mark a port forward for deletion.
pub async fn request_port_forward_deletion(
    store: &dyn Store,
    guards: &GuardTable,
    port_forward_id: i64,
) -> Result<()> {
    let not_found = || SassoError::not_found("port forward", port_forward_id);
    let pf = store
        .get_port_forward(port_forward_id)
        .await?
        .ok_or_else(not_found)?;

    let _guard = lock_net(store, guards, pf.net_id).await?;

    // Re-read under the guard
    let pf = store
        .get_port_forward(port_forward_id)
        .await?
        .ok_or_else(not_found)?;
    if pf.status == ResourceStatus::PreDeleting {
        return Ok(());
    }

    store
        .update_port_forward_status(pf.id, ResourceStatus::PreDeleting)
        .await?;
    info!(port_forward_id, out_port = pf.out_port, "Port forward deletion requested");
    Ok(())
}

/// Record a new VM interface for the reconciler to attach.
pub async fn request_vm_interface(
    store: &dyn Store,
    guards: &GuardTable,
    request: &VmInterfaceRequest,
) -> Result<i64> {
    let _vm_guard = guards.acquire(&GuardKey::vm(request.vm_id)).await;
    let _net_guard = lock_net(store, guards, request.net_id).await?;

    live_vm(store, request.vm_id).await?;
    let net = live_net(store, request.net_id).await?;

    let subnet: Ipv4Subnet = net.subnet.parse()?;
    let address = parse_host_address(&request.address)?;
    if !subnet.contains(address) {
        return Err(SassoError::validation(
            "address",
            format!("{address} is not inside {subnet}"),
        ));
    }

    let id = store
        .insert_vm_interface(&NewVmInterface {
            vm_id: request.vm_id,
            net_id: request.net_id,
            address: request.address.clone(),
            gateway: request.gateway.clone(),
            status: ResourceStatus::PreCreating,
        })
        .await?;

    info!(interface_id = id, vm_id = request.vm_id, net_id = request.net_id, "VM interface requested");
    Ok(id)
}

/// Mark a VM for deletion.
pub async fn request_vm_deletion(store: &dyn Store, guards: &GuardTable, vm_id: i64) -> Result<()> {
    let _guard = guards.acquire(&GuardKey::vm(vm_id)).await;

    let vm = store
        .get_vm(vm_id)
        .await?
        .ok_or_else(|| SassoError::not_found("vm", vm_id))?;
    if vm.status == ResourceStatus::PreDeleting {
        return Ok(());
    }

    store
        .update_vm_status(vm_id, ResourceStatus::PreDeleting)
        .await?;
    info!(vm_id, name = %vm.name, "VM deletion requested");
    Ok(())
}

/// Change a net's VNet settings. The VM worker applies them.
pub async fn request_net_update(
    store: &dyn Store,
    guards: &GuardTable,
    net_id: i64,
    vlan_aware: bool,
) -> Result<()> {
    let _guard = lock_net(store, guards, net_id).await?;

    let net = store
        .get_net(net_id)
        .await?
        .ok_or_else(|| SassoError::not_found("net", net_id))?;
    if !matches!(net.status, ResourceStatus::Ready | ResourceStatus::Unknown) {
        return Err(invalid_state("net", net.id, net.status));
    }

    store.reconfigure_net(net_id, vlan_aware).await?;
    info!(net_id, vnet = %net.name, vlan_aware, "Net update requested");
    Ok(())
}

/// Record a backup create, restore or delete for the VM worker.
///
/// A VM has at most one pending backup request at a time.
pub async fn request_backup(
    store: &dyn Store,
    guards: &GuardTable,
    request: &BackupRequest,
) -> Result<i64> {
    let _guard = guards.acquire(&GuardKey::vm(request.vm_id)).await;

    live_vm(store, request.vm_id).await?;
    if request.name.chars().count() > MAX_BACKUP_NAME_CHARS {
        return Err(SassoError::validation(
            "name",
            format!("longer than {MAX_BACKUP_NAME_CHARS} characters"),
        ));
    }
    if request.notes.len() > MAX_BACKUP_NOTES_BYTES {
        return Err(SassoError::validation(
            "notes",
            format!("longer than {MAX_BACKUP_NOTES_BYTES} bytes"),
        ));
    }
    let needs_volid = matches!(
        request.kind,
        BackupRequestKind::Restore | BackupRequestKind::Delete
    );
    if needs_volid && request.volid.as_deref().is_none_or(str::is_empty) {
        return Err(SassoError::validation(
            "volid",
            format!("required to {} a backup", request.kind.as_str()),
        ));
    }
    if store.has_pending_backup_request(request.vm_id).await? {
        return Err(SassoError::Conflict(format!(
            "vm {} already has a pending backup request",
            request.vm_id
        )));
    }

    let id = store
        .insert_backup_request(&NewBackupRequest {
            kind: request.kind,
            vm_id: request.vm_id,
            owner_id: request.owner_id,
            name: request.name.clone(),
            notes: request.notes.clone(),
            volid: request.volid.clone(),
        })
        .await?;

    info!(
        backup_request_id = id,
        vm_id = request.vm_id,
        kind = request.kind.as_str(),
        "Backup requested"
    );
    Ok(id)
}
