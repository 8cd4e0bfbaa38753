//! Resource store.
//!
//! Durable record of tickets, requests and every reconciled resource. The
//! [`Store`] trait is implemented for SQLite and PostgreSQL; both share the
//! record types below.
//!
//! # Example
//!
//! ```ignore
//! use sasso_core::store::{self, Store};
//!
//! let store = store::connect("sqlite::memory:").await?;
//! let pending = store.list_pending_tickets(50).await?;
//! ```

pub mod postgres;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SassoError};
use crate::request::RequestStatus;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Raised when a status column holds an unknown value.
#[derive(Debug, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct ParseStatusError(pub String);

/// Lifecycle status shared by every reconciled resource.
///
/// Pre-* states mean exactly one reconciliation action is outstanding.
/// Deletion is row removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceStatus {
    /// Waiting to be created on the backend.
    PreCreating,
    /// Waiting to be deleted from the backend.
    PreDeleting,
    /// Created, waiting for configuration.
    PreConfiguring,
    /// In sync with the backend.
    Ready,
    /// Backend state no longer matches.
    Unknown,
}

impl ResourceStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreCreating => "pre-creating",
            Self::PreDeleting => "pre-deleting",
            Self::PreConfiguring => "pre-configuring",
            Self::Ready => "ready",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a reconciliation action is outstanding.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PreCreating | Self::PreDeleting | Self::PreConfiguring
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pre-creating" => Ok(Self::PreCreating),
            "pre-deleting" => Ok(Self::PreDeleting),
            "pre-configuring" => Ok(Self::PreConfiguring),
            "ready" => Ok(Self::Ready),
            "unknown" => Ok(Self::Unknown),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

impl TryFrom<String> for ResourceStatus {
    type Error = ParseStatusError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

/// Delivery status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// Not yet handled by the notifier.
    Pending,
    /// Handled (delivered or given up on).
    Sent,
}

impl NotificationStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
        }
    }
}

impl TryFrom<String> for NotificationStatus {
    type Error = ParseStatusError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            _ => Err(ParseStatusError(s)),
        }
    }
}

// ============================================================================
// Tickets and requests
// ============================================================================

/// Ticket row. The status mirrors the request status.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TicketRecord {
    /// Ticket id (UUIDv7 string).
    pub id: String,
    /// Request kind tag.
    pub request_type: String,
    /// Mirrored request status.
    #[sqlx(try_from = "String")]
    pub status: RequestStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Row of the `new_network_requests` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct NewNetworkRecord {
    /// Owning ticket.
    pub ticket_id: String,
    /// VNet name.
    pub vnet: String,
    /// VNet tag.
    #[sqlx(try_from = "i64")]
    pub vnet_tag: u32,
    /// Request status.
    #[sqlx(try_from = "String")]
    pub status: RequestStatus,
    /// Failure reason.
    pub error: Option<String>,
    /// Allocated subnet.
    pub subnet: Option<String>,
    /// Router address.
    pub router_ip: Option<String>,
    /// Broadcast address.
    pub broadcast: Option<String>,
}

/// Row of the `delete_network_requests` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeleteNetworkRecord {
    /// Owning ticket.
    pub ticket_id: String,
    /// VNet name.
    pub vnet: String,
    /// Request status.
    #[sqlx(try_from = "String")]
    pub status: RequestStatus,
    /// Failure reason.
    pub error: Option<String>,
}

/// A request row of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestRecord {
    /// `new-network`.
    NewNetwork(NewNetworkRecord),
    /// `delete-network`.
    DeleteNetwork(DeleteNetworkRecord),
}

// ============================================================================
// Router domain
// ============================================================================

/// A gateway interface created for a VNet.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct GatewayInterfaceRecord {
    /// Row id.
    pub id: i64,
    /// Ticket that created the interface.
    pub ticket_id: Option<String>,
    /// Interface id on the gateway host.
    pub local_id: String,
    /// VNet name.
    pub vnet: String,
    /// VNet tag.
    #[sqlx(try_from = "i64")]
    pub vnet_tag: u32,
    /// Subnet (CIDR).
    pub subnet: String,
    /// Router address.
    pub router_ip: String,
    /// Broadcast address.
    pub broadcast: String,
    /// Interface name on the firewall.
    pub firewall_interface: String,
}

/// Fields of a new gateway interface.
#[derive(Debug, Clone)]
pub struct NewGatewayInterface {
    /// Creating ticket.
    pub ticket_id: Option<String>,
    /// Interface id on the gateway host.
    pub local_id: String,
    /// VNet name.
    pub vnet: String,
    /// VNet tag.
    pub vnet_tag: u32,
    /// Subnet (CIDR).
    pub subnet: String,
    /// Router address.
    pub router_ip: String,
    /// Broadcast address.
    pub broadcast: String,
    /// Interface name on the firewall.
    pub firewall_interface: String,
}

/// A port forward from the public address into a VNet.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PortForwardRecord {
    /// Row id.
    pub id: i64,
    /// Net the destination lives in.
    pub net_id: i64,
    /// Owning user.
    pub owner_id: i64,
    /// Public port.
    #[sqlx(try_from = "i64")]
    pub out_port: u16,
    /// Destination port.
    #[sqlx(try_from = "i64")]
    pub dest_port: u16,
    /// Destination address.
    pub dest_ip: String,
    /// Lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: ResourceStatus,
}

/// Fields of a new port forward.
#[derive(Debug, Clone)]
pub struct NewPortForward {
    /// Net the destination lives in.
    pub net_id: i64,
    /// Owning user.
    pub owner_id: i64,
    /// Public port.
    pub out_port: u16,
    /// Destination port.
    pub dest_port: u16,
    /// Destination address.
    pub dest_ip: String,
    /// Initial status.
    pub status: ResourceStatus,
}

// ============================================================================
// Hypervisor domain
// ============================================================================

/// A user network (VNet on the hypervisor).
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct NetRecord {
    /// Row id.
    pub id: i64,
    /// Owning user.
    pub owner_id: i64,
    /// VNet name.
    pub name: String,
    /// VNet tag.
    #[sqlx(try_from = "i64")]
    pub tag: u32,
    /// Subnet (CIDR).
    pub subnet: String,
    /// Gateway address.
    pub gateway: String,
    /// Broadcast address.
    pub broadcast: String,
    /// Group sharing the net, if any.
    pub group_name: Option<String>,
    /// Whether the VNet passes VLAN-tagged traffic.
    pub vlan_aware: bool,
    /// Lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: ResourceStatus,
}

/// Fields of a new net.
#[derive(Debug, Clone)]
pub struct NewNet {
    /// Owning user.
    pub owner_id: i64,
    /// VNet name.
    pub name: String,
    /// VNet tag.
    pub tag: u32,
    /// Subnet (CIDR).
    pub subnet: String,
    /// Gateway address.
    pub gateway: String,
    /// Broadcast address.
    pub broadcast: String,
    /// Group sharing the net.
    pub group_name: Option<String>,
    /// Whether the VNet passes VLAN-tagged traffic.
    pub vlan_aware: bool,
    /// Initial status.
    pub status: ResourceStatus,
}

/// A virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct VmRecord {
    /// Row id, also the hypervisor VM id.
    pub id: i64,
    /// Owning user.
    pub owner_id: i64,
    /// VM name (DNS label).
    pub name: String,
    /// vCPU count.
    #[sqlx(try_from = "i64")]
    pub cores: u32,
    /// Memory in MiB.
    #[sqlx(try_from = "i64")]
    pub ram_mb: u32,
    /// Disk in GiB.
    #[sqlx(try_from = "i64")]
    pub disk_gb: u32,
    /// Lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: ResourceStatus,
}

/// Fields of a new VM.
#[derive(Debug, Clone)]
pub struct NewVm {
    /// Owning user.
    pub owner_id: i64,
    /// VM name.
    pub name: String,
    /// vCPU count.
    pub cores: u32,
    /// Memory in MiB.
    pub ram_mb: u32,
    /// Disk in GiB.
    pub disk_gb: u32,
    /// Initial status.
    pub status: ResourceStatus,
}

/// A VM network interface.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct VmInterfaceRecord {
    /// Row id.
    pub id: i64,
    /// VM the interface belongs to.
    pub vm_id: i64,
    /// Net the interface is attached to.
    pub net_id: i64,
    /// Address in CIDR form.
    pub address: String,
    /// Default gateway; set on the VM's primary interface.
    pub gateway: Option<String>,
    /// Lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: ResourceStatus,
}

/// Fields of a new VM interface.
#[derive(Debug, Clone)]
pub struct NewVmInterface {
    /// VM the interface belongs to.
    pub vm_id: i64,
    /// Net to attach to.
    pub net_id: i64,
    /// Address in CIDR form.
    pub address: String,
    /// Default gateway.
    pub gateway: Option<String>,
    /// Initial status.
    pub status: ResourceStatus,
}

/// Primary address of a ready VM, joined with its net.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PrimaryAddressRecord {
    /// VM id.
    pub vm_id: i64,
    /// VM name.
    pub vm_name: String,
    /// VM owner.
    pub owner_id: i64,
    /// Net id.
    pub net_id: i64,
    /// Group sharing the net.
    pub group_name: Option<String>,
    /// Address in CIDR form.
    pub address: String,
}

// ============================================================================
// Backups
// ============================================================================

/// What a backup request asks the hypervisor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupRequestKind {
    /// Take a new backup of the VM.
    Create,
    /// Restore the VM from an existing backup.
    Restore,
    /// Delete an existing backup.
    Delete,
}

impl BackupRequestKind {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Restore => "restore",
            Self::Delete => "delete",
        }
    }
}

impl TryFrom<String> for BackupRequestKind {
    type Error = ParseStatusError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "create" => Ok(Self::Create),
            "restore" => Ok(Self::Restore),
            "delete" => Ok(Self::Delete),
            _ => Err(ParseStatusError(s)),
        }
    }
}

/// Lifecycle of a backup request. `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupRequestStatus {
    /// Waiting for the VM worker.
    Pending,
    /// The hypervisor finished the operation.
    Completed,
    /// The operation cannot succeed.
    Failed,
}

impl BackupRequestStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<String> for BackupRequestStatus {
    type Error = ParseStatusError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseStatusError(s)),
        }
    }
}

/// A backup create, restore or delete request.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct BackupRequestRecord {
    /// Row id.
    pub id: i64,
    /// Requested operation.
    #[sqlx(try_from = "String")]
    pub kind: BackupRequestKind,
    /// Request status.
    #[sqlx(try_from = "String")]
    pub status: BackupRequestStatus,
    /// VM the backup belongs to.
    pub vm_id: i64,
    /// Requesting user.
    pub owner_id: i64,
    /// Backup name, for `create`.
    pub name: String,
    /// Free-form notes, for `create`.
    pub notes: String,
    /// Hypervisor volume id. Given for `restore` and `delete`, filled in
    /// when a `create` completes.
    pub volid: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
}

/// Fields of a new backup request. Requests start `pending`.
#[derive(Debug, Clone)]
pub struct NewBackupRequest {
    /// Requested operation.
    pub kind: BackupRequestKind,
    /// VM the backup belongs to.
    pub vm_id: i64,
    /// Requesting user.
    pub owner_id: i64,
    /// Backup name.
    pub name: String,
    /// Free-form notes.
    pub notes: String,
    /// Volume id of an existing backup.
    pub volid: Option<String>,
}

// ============================================================================
// Counts
// ============================================================================

/// Row counts of the reconciled resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct ObjectCounts {
    /// VMs.
    pub vms: i64,
    /// VM interfaces.
    pub vm_interfaces: i64,
    /// Nets.
    pub nets: i64,
    /// Port forwards.
    pub port_forwards: i64,
}

/// Notifications grouped by status and channels.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct NotificationCountRecord {
    /// Delivery status.
    #[sqlx(try_from = "String")]
    pub status: NotificationStatus,
    /// Email requested.
    pub email: bool,
    /// Telegram requested.
    pub telegram: bool,
    /// Notifications in the group.
    pub count: i64,
}

// ============================================================================
// Users and notifications
// ============================================================================

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserRecord {
    /// Row id.
    pub id: i64,
    /// Login name.
    pub username: String,
    /// Email address.
    pub email: String,
    /// VPN tunnel address, when the user has one.
    pub vpn_address: Option<String>,
}

/// Fields of a new user.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Login name.
    pub username: String,
    /// Email address.
    pub email: String,
    /// VPN tunnel address.
    pub vpn_address: Option<String>,
}

/// A Telegram bot a user receives notifications through.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TelegramBotRecord {
    /// Row id.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Bot API token.
    pub token: String,
    /// Chat to post to.
    pub chat_id: String,
    /// Whether notifications go through this bot.
    pub enabled: bool,
}

/// Fields of a new Telegram bot.
#[derive(Debug, Clone)]
pub struct NewTelegramBot {
    /// Owning user.
    pub user_id: i64,
    /// Bot API token.
    pub token: String,
    /// Chat to post to.
    pub chat_id: String,
    /// Whether the bot is used.
    pub enabled: bool,
}

/// A queued notification.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct NotificationRecord {
    /// Row id.
    pub id: i64,
    /// Recipient; `None` sends to every user.
    pub user_id: Option<i64>,
    /// Subject line.
    pub subject: String,
    /// Message body.
    pub body: String,
    /// Deliver by email.
    pub email: bool,
    /// Deliver through Telegram.
    pub telegram: bool,
    /// Delivery status.
    #[sqlx(try_from = "String")]
    pub status: NotificationStatus,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
}

/// Fields of a new notification.
#[derive(Debug, Clone)]
pub struct NewNotification {
    /// Recipient; `None` sends to every user.
    pub user_id: Option<i64>,
    /// Subject line.
    pub subject: String,
    /// Message body.
    pub body: String,
    /// Deliver by email.
    pub email: bool,
    /// Deliver through Telegram.
    pub telegram: bool,
}

impl NewNotification {
    /// Notification for one user over both channels.
    pub fn to_user(user_id: i64, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            subject: subject.into(),
            body: body.into(),
            email: true,
            telegram: true,
        }
    }
}

// ============================================================================
// Store trait
// ============================================================================

/// Durable storage for tickets and resources.
///
/// Lookups return `Ok(None)` for missing rows. Inserts that would break a
/// uniqueness rule fail with [`SassoError::Conflict`].
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Tickets
    // ------------------------------------------------------------------

    /// Insert or update a ticket and its request in one transaction.
    async fn save_ticket(&self, ticket: &TicketRecord, request: &RequestRecord) -> Result<()>;

    /// Fetch a ticket.
    async fn get_ticket(&self, id: &str) -> Result<Option<TicketRecord>>;

    /// Fetch the `new-network` request of a ticket.
    async fn get_new_network_request(&self, ticket_id: &str) -> Result<Option<NewNetworkRecord>>;

    /// Fetch the `delete-network` request of a ticket.
    async fn get_delete_network_request(
        &self,
        ticket_id: &str,
    ) -> Result<Option<DeleteNetworkRecord>>;

    /// Pending tickets, least recently updated first.
    ///
    /// A ticket whose attempt fails gets a fresh `updated_at`, so it moves
    /// behind the tickets that have not been tried yet.
    async fn list_pending_tickets(&self, limit: i64) -> Result<Vec<TicketRecord>>;

    /// Bump a ticket's `updated_at` without changing anything else.
    async fn touch_ticket(&self, id: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Gateway interfaces
    // ------------------------------------------------------------------

    /// Record a gateway interface.
    async fn insert_gateway_interface(&self, iface: &NewGatewayInterface) -> Result<i64>;

    /// Interface of a VNet.
    async fn get_gateway_interface_by_vnet(
        &self,
        vnet: &str,
    ) -> Result<Option<GatewayInterfaceRecord>>;

    /// Interface using a tag.
    async fn get_gateway_interface_by_tag(
        &self,
        vnet_tag: u32,
    ) -> Result<Option<GatewayInterfaceRecord>>;

    /// Every gateway interface.
    async fn list_gateway_interfaces(&self) -> Result<Vec<GatewayInterfaceRecord>>;

    /// Forget a gateway interface.
    async fn delete_gateway_interface(&self, id: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // Nets
    // ------------------------------------------------------------------

    /// Record a net.
    async fn insert_net(&self, net: &NewNet) -> Result<i64>;

    /// Fetch a net.
    async fn get_net(&self, id: i64) -> Result<Option<NetRecord>>;

    /// Every net.
    async fn list_nets(&self) -> Result<Vec<NetRecord>>;

    /// Nets in a status.
    async fn list_nets_by_status(&self, status: ResourceStatus) -> Result<Vec<NetRecord>>;

    /// Change a net's status.
    async fn update_net_status(&self, id: i64, status: ResourceStatus) -> Result<()>;

    /// Mark a net and all its port forwards `pre-deleting` atomically.
    async fn mark_net_for_deletion(&self, id: i64) -> Result<()>;

    /// Record new VNet settings and mark the net `pre-configuring`.
    async fn reconfigure_net(&self, id: i64, vlan_aware: bool) -> Result<()>;

    /// Remove a net row. Fails while VM interfaces still reference it.
    async fn delete_net(&self, id: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // VMs
    // ------------------------------------------------------------------

    /// Record a VM.
    async fn insert_vm(&self, vm: &NewVm) -> Result<i64>;

    /// Fetch a VM.
    async fn get_vm(&self, id: i64) -> Result<Option<VmRecord>>;

    /// Every VM.
    async fn list_vms(&self) -> Result<Vec<VmRecord>>;

    /// VMs in a status.
    async fn list_vms_by_status(&self, status: ResourceStatus) -> Result<Vec<VmRecord>>;

    /// Change a VM's status.
    async fn update_vm_status(&self, id: i64, status: ResourceStatus) -> Result<()>;

    /// Remove a VM row.
    async fn delete_vm(&self, id: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // VM interfaces
    // ------------------------------------------------------------------

    /// Record a VM interface.
    async fn insert_vm_interface(&self, iface: &NewVmInterface) -> Result<i64>;

    /// Fetch a VM interface.
    async fn get_vm_interface(&self, id: i64) -> Result<Option<VmInterfaceRecord>>;

    /// Interfaces of a VM.
    async fn list_vm_interfaces(&self, vm_id: i64) -> Result<Vec<VmInterfaceRecord>>;

    /// Interfaces attached to a net, in any status.
    async fn list_vm_interfaces_for_net(&self, net_id: i64) -> Result<Vec<VmInterfaceRecord>>;

    /// Interfaces in a status.
    async fn list_vm_interfaces_by_status(
        &self,
        status: ResourceStatus,
    ) -> Result<Vec<VmInterfaceRecord>>;

    /// Change an interface's status.
    async fn update_vm_interface_status(&self, id: i64, status: ResourceStatus) -> Result<()>;

    /// Remove an interface row.
    async fn delete_vm_interface(&self, id: i64) -> Result<()>;

    /// Remove every interface row of a VM.
    async fn delete_vm_interfaces_for_vm(&self, vm_id: i64) -> Result<()>;

    /// Primary addresses of ready VMs on ready nets.
    async fn list_primary_addresses(&self) -> Result<Vec<PrimaryAddressRecord>>;

    // ------------------------------------------------------------------
    // Port forwards
    // ------------------------------------------------------------------

    /// Record a port forward.
    async fn insert_port_forward(&self, pf: &NewPortForward) -> Result<i64>;

    /// Fetch a port forward.
    async fn get_port_forward(&self, id: i64) -> Result<Option<PortForwardRecord>>;

    /// Port forward using a public port.
    async fn get_port_forward_by_out_port(&self, out_port: u16)
    -> Result<Option<PortForwardRecord>>;

    /// Port forwards in a status.
    async fn list_port_forwards_by_status(
        &self,
        status: ResourceStatus,
    ) -> Result<Vec<PortForwardRecord>>;

    /// Change a port forward's status.
    async fn update_port_forward_status(&self, id: i64, status: ResourceStatus) -> Result<()>;

    /// Remove a port forward row.
    async fn delete_port_forward(&self, id: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    /// Record a pending backup request.
    async fn insert_backup_request(&self, request: &NewBackupRequest) -> Result<i64>;

    /// Fetch a backup request.
    async fn get_backup_request(&self, id: i64) -> Result<Option<BackupRequestRecord>>;

    /// Pending requests of one kind, oldest first.
    async fn list_pending_backup_requests(
        &self,
        kind: BackupRequestKind,
    ) -> Result<Vec<BackupRequestRecord>>;

    /// Whether a VM has a backup request still pending.
    async fn has_pending_backup_request(&self, vm_id: i64) -> Result<bool>;

    /// Resolve a backup request.
    async fn finish_backup_request(
        &self,
        id: i64,
        status: BackupRequestStatus,
        volid: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Record a user.
    async fn insert_user(&self, user: &NewUser) -> Result<i64>;

    /// Fetch a user.
    async fn get_user(&self, id: i64) -> Result<Option<UserRecord>>;

    /// Every user.
    async fn list_users(&self) -> Result<Vec<UserRecord>>;

    /// Add a user to a group.
    async fn add_group_member(&self, group_name: &str, user_id: i64) -> Result<()>;

    /// Groups a user belongs to.
    async fn list_user_groups(&self, user_id: i64) -> Result<Vec<String>>;

    /// Record a Telegram bot.
    async fn insert_telegram_bot(&self, bot: &NewTelegramBot) -> Result<i64>;

    /// Enabled bots of a user, or of every user when `user_id` is `None`.
    async fn list_enabled_telegram_bots(
        &self,
        user_id: Option<i64>,
    ) -> Result<Vec<TelegramBotRecord>>;

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Queue a notification.
    async fn insert_notification(&self, notification: &NewNotification) -> Result<i64>;

    /// Fetch a notification.
    async fn get_notification(&self, id: i64) -> Result<Option<NotificationRecord>>;

    /// Pending notifications, oldest first.
    async fn list_pending_notifications(&self) -> Result<Vec<NotificationRecord>>;

    /// Mark a notification sent.
    async fn mark_notification_sent(&self, id: i64) -> Result<()>;

    /// Notifications per status and channel combination.
    async fn count_notifications(&self) -> Result<Vec<NotificationCountRecord>>;

    // ------------------------------------------------------------------
    // Counts
    // ------------------------------------------------------------------

    /// Row counts of VMs, VM interfaces, nets and port forwards.
    async fn count_objects(&self) -> Result<ObjectCounts>;
}

/// Open a store for `database_url` and run its migrations.
///
/// `sqlite:` URLs select [`SqliteStore`], `postgres://` and `postgresql://`
/// select [`PostgresStore`].
pub async fn connect(database_url: &str) -> Result<Arc<dyn Store>> {
    if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::connect(database_url).await?))
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")
    {
        Ok(Arc::new(PostgresStore::connect(database_url).await?))
    } else {
        Err(SassoError::validation(
            "database_url",
            "expected a sqlite: or postgres:// URL",
        ))
    }
}
