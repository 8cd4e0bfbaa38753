// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend capability trait definitions.
//!
//! Each trait is the narrow surface the reconcilers need from one piece of
//! infrastructure. Vendor drivers (netlink, Proxmox, Shorewall, PowerDNS,
//! SMTP) live outside this crate and implement these traits.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addressing::Ipv4Subnet;

/// Errors from backend operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// The backend could not be reached or timed out.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The object the operation targets does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object the operation would create already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Whether retrying later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Whether this is [`BackendError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this is [`BackendError::AlreadyExists`].
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Treat "already exists" as success.
pub fn tolerate_exists(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

/// Treat "not found" as success.
pub fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Parameters of a gateway interface for one VNet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    /// VNet name.
    pub vnet: String,
    /// VXLAN / VLAN tag.
    pub vnet_tag: u32,
    /// Subnet routed through the interface.
    pub subnet: Ipv4Subnet,
    /// Router address inside the subnet.
    pub router_ip: Ipv4Addr,
    /// Broadcast address of the subnet.
    pub broadcast: Ipv4Addr,
}

/// Result of creating a gateway interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedInterface {
    /// Identifier of the interface on the gateway host.
    pub local_id: String,
    /// Name the firewall knows the interface by.
    pub firewall_interface: String,
}

/// Router host that terminates VNets.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Create the interface for a VNet.
    async fn new_interface(&self, spec: &InterfaceSpec) -> Result<ProvisionedInterface>;

    /// Remove an interface. Removing a missing interface succeeds.
    async fn remove_interface(&self, local_id: &str) -> Result<()>;

    /// Check that the interface still exists with the recorded parameters.
    async fn verify_interface(&self, local_id: &str, spec: &InterfaceSpec) -> Result<bool>;

    /// Driver name for logs.
    fn gateway_type(&self) -> &'static str;
}

// ============================================================================
// Firewall
// ============================================================================

/// Zone-to-zone policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Policy {
    /// Source zone.
    pub source: String,
    /// Destination zone.
    pub destination: String,
    /// Policy verdict (`ACCEPT`, `DROP`, ...).
    pub action: String,
}

/// A single firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Rule action (`DNAT`, `ACCEPT`, ...).
    pub action: String,
    /// Source zone (optionally `zone:address`).
    pub source: String,
    /// Destination (`zone:address:port` for DNAT).
    pub destination: String,
    /// Protocols the rule matches.
    pub protocol: String,
    /// Destination port on the firewall.
    pub dest_port: u16,
    /// Original destination, set for NAT reflection rules.
    pub orig_dest: Option<String>,
}

/// Host firewall with zones, interfaces, policies and rules.
///
/// Mutations take effect after [`Firewall::reload`].
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Register a zone.
    async fn add_zone(&self, zone: &str) -> Result<()>;

    /// Remove a zone.
    async fn remove_zone(&self, zone: &str) -> Result<()>;

    /// Attach an interface to a zone.
    async fn add_interface(&self, interface: &str, zone: &str) -> Result<()>;

    /// Detach an interface.
    async fn remove_interface(&self, interface: &str) -> Result<()>;

    /// Add a policy.
    async fn add_policy(&self, policy: &Policy) -> Result<()>;

    /// Remove a policy.
    async fn remove_policy(&self, policy: &Policy) -> Result<()>;

    /// Add a rule.
    async fn add_rule(&self, rule: &FirewallRule) -> Result<()>;

    /// Remove a rule.
    async fn remove_rule(&self, rule: &FirewallRule) -> Result<()>;

    /// Rules currently configured.
    async fn list_rules(&self) -> Result<Vec<FirewallRule>>;

    /// Apply pending configuration.
    async fn reload(&self) -> Result<()>;
}

// ============================================================================
// DNS
// ============================================================================

/// A resource record set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RRSet {
    /// Fully qualified owner name, with the trailing dot.
    pub name: String,
    /// Record type (`A`, `AAAA`, ...).
    pub record_type: String,
    /// Time to live in seconds.
    pub ttl: u32,
    /// Record contents.
    pub records: Vec<String>,
}

/// A zone variant and its record sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsZone {
    /// Zone name, including the view variant (`sasso..net3`).
    pub name: String,
    /// Record sets served by the zone.
    pub rrsets: Vec<RRSet>,
}

/// A DNS view: the zones served to clients from a set of networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsView {
    /// View name.
    pub name: String,
    /// Client networks (CIDR) mapped to the view.
    pub networks: Vec<String>,
    /// Zones in the view.
    pub zones: Vec<DnsZone>,
}

/// Authoritative DNS server with network-scoped views.
#[async_trait]
pub trait DnsManager: Send + Sync {
    /// Snapshot of every view with its networks, zones and record sets.
    async fn fetch_views(&self) -> Result<Vec<DnsView>>;

    /// Map a client network to a view.
    async fn set_network_view(&self, network: &str, view: &str) -> Result<()>;

    /// Drop a client network mapping.
    async fn remove_network(&self, network: &str) -> Result<()>;

    /// Create a zone with its initial record sets.
    async fn create_zone(&self, zone: &DnsZone) -> Result<()>;

    /// Serve a zone from a view.
    async fn add_zone_to_view(&self, view: &str, zone: &str) -> Result<()>;

    /// Delete a zone and remove it from every view.
    async fn remove_zone(&self, zone: &str) -> Result<()>;

    /// Create or replace a record set.
    async fn upsert_rrset(&self, zone: &str, rrset: &RRSet) -> Result<()>;

    /// Delete a record set.
    async fn remove_rrset(&self, zone: &str, name: &str, record_type: &str) -> Result<()>;
}

// ============================================================================
// Hypervisor
// ============================================================================

/// Virtual machine sizing and identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    /// Database id, used as the hypervisor VM id.
    pub id: i64,
    /// VM name.
    pub name: String,
    /// vCPU count.
    pub cores: u32,
    /// Memory in MiB.
    pub ram_mb: u32,
    /// Disk size in GiB.
    pub disk_gb: u32,
}

/// A VM network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicSpec {
    /// VM the interface belongs to.
    pub vm_id: i64,
    /// Interface database id.
    pub interface_id: i64,
    /// VNet the interface is bridged to.
    pub vnet: String,
    /// VNet tag.
    pub vnet_tag: u32,
    /// Address in CIDR form.
    pub address: String,
    /// Default gateway, set on the primary interface.
    pub gateway: Option<String>,
}

/// An SDN VNet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnetSpec {
    /// VNet name.
    pub name: String,
    /// VXLAN tag.
    pub tag: u32,
    /// Whether guests may send VLAN-tagged frames.
    pub vlan_aware: bool,
}

/// A backup to take of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSpec {
    /// VM to back up.
    pub vm_id: i64,
    /// Backup name.
    pub name: String,
    /// Free-form notes stored with the backup.
    pub notes: String,
}

/// Power state reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmPowerState {
    /// Running.
    Running,
    /// Stopped.
    Stopped,
    /// Paused or suspended.
    Paused,
}

/// A VM as seen by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorVm {
    /// VM id.
    pub id: i64,
    /// Power state.
    pub state: VmPowerState,
}

/// Virtualization cluster.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Create a VNet.
    async fn create_vnet(&self, vnet: &VnetSpec) -> Result<()>;

    /// Change the settings of an existing VNet.
    async fn update_vnet(&self, vnet: &VnetSpec) -> Result<()>;

    /// Delete a VNet.
    async fn delete_vnet(&self, name: &str) -> Result<()>;

    /// Every VNet in the SDN zone.
    async fn list_vnets(&self) -> Result<Vec<VnetSpec>>;

    /// Apply pending SDN changes cluster-wide.
    async fn apply_network_changes(&self) -> Result<()>;

    /// Clone a VM from the template.
    async fn clone_vm(&self, vm: &VmSpec) -> Result<()>;

    /// Apply sizing to a cloned VM.
    async fn configure_vm(&self, vm: &VmSpec) -> Result<()>;

    /// Stop (if running) and delete a VM. Fails with not-found when missing.
    async fn delete_vm(&self, vm_id: i64) -> Result<()>;

    /// Every VM on the cluster.
    async fn list_vms(&self) -> Result<Vec<HypervisorVm>>;

    /// Add a network interface to a VM.
    async fn attach_interface(&self, nic: &NicSpec) -> Result<()>;

    /// Update addressing on an attached interface.
    async fn configure_interface(&self, nic: &NicSpec) -> Result<()>;

    /// Remove a network interface from a VM.
    async fn detach_interface(&self, vm_id: i64, interface_id: i64) -> Result<()>;

    /// Back up a VM. Returns the volume id of the new backup.
    async fn create_backup(&self, backup: &BackupSpec) -> Result<String>;

    /// Restore a VM from a backup volume.
    async fn restore_backup(&self, vm_id: i64, volid: &str) -> Result<()>;

    /// Delete a backup volume.
    async fn delete_backup(&self, volid: &str) -> Result<()>;
}

// ============================================================================
// Notification channels
// ============================================================================

/// Outbound email.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send a message to one address.
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// A Telegram bot and the chat it posts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramTarget {
    /// Bot API token.
    pub token: String,
    /// Destination chat.
    pub chat_id: String,
}

/// Outbound Telegram messages.
#[async_trait]
pub trait TelegramSender: Send + Sync {
    /// Post `text` to the bot's chat.
    async fn send(&self, target: &TelegramTarget, text: &str) -> Result<()>;
}
