//! SQLite-backed store implementation.

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use crate::error::{Result, SassoError};
use crate::migrations;

use super::{
    BackupRequestKind, BackupRequestRecord, BackupRequestStatus, DeleteNetworkRecord,
    GatewayInterfaceRecord, NetRecord, NewBackupRequest, NewGatewayInterface, NewNet,
    NewNetworkRecord, NewNotification, NewPortForward, NewTelegramBot, NewUser, NewVm,
    NewVmInterface, NotificationCountRecord, NotificationRecord, ObjectCounts, PortForwardRecord,
    PrimaryAddressRecord, RequestRecord, ResourceStatus, Store, TelegramBotRecord, TicketRecord,
    UserRecord, VmInterfaceRecord, VmRecord,
};

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations must already be applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    ///
    /// In-memory databases get a single connection, since every connection
    /// to `sqlite::memory:` opens a separate database.
    pub async fn connect(url: &str) -> Result<Self> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let url = if url.contains(":memory:") || url.contains("mode=") {
            url.to_string()
        } else if url.contains('?') {
            format!("{url}&mode=rwc")
        } else {
            format!("{url}?mode=rwc")
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;
        migrations::run_sqlite(&pool).await?;
        debug!(max_connections, "SQLite store ready");

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn not_updated(entity: &'static str, id: i64, rows: u64) -> Result<()> {
    if rows == 0 {
        Err(SassoError::not_found(entity, id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    // ------------------------------------------------------------------
    // Tickets
    // ------------------------------------------------------------------

    async fn save_ticket(&self, ticket: &TicketRecord, request: &RequestRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tickets (id, request_type, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE
            SET status = excluded.status, updated_at = excluded.updated_at
            "#,
        )
        .bind(&ticket.id)
        .bind(&ticket.request_type)
        .bind(ticket.status.as_str())
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .execute(&mut *tx)
        .await?;

        match request {
            RequestRecord::NewNetwork(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO new_network_requests
                        (ticket_id, vnet, vnet_tag, status, error, subnet, router_ip, broadcast)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (ticket_id) DO UPDATE
                    SET status = excluded.status,
                        error = excluded.error,
                        subnet = excluded.subnet,
                        router_ip = excluded.router_ip,
                        broadcast = excluded.broadcast
                    "#,
                )
                .bind(&r.ticket_id)
                .bind(&r.vnet)
                .bind(i64::from(r.vnet_tag))
                .bind(r.status.as_str())
                .bind(&r.error)
                .bind(&r.subnet)
                .bind(&r.router_ip)
                .bind(&r.broadcast)
                .execute(&mut *tx)
                .await?;
            }
            RequestRecord::DeleteNetwork(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO delete_network_requests (ticket_id, vnet, status, error)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT (ticket_id) DO UPDATE
                    SET status = excluded.status, error = excluded.error
                    "#,
                )
                .bind(&r.ticket_id)
                .bind(&r.vnet)
                .bind(r.status.as_str())
                .bind(&r.error)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_ticket(&self, id: &str) -> Result<Option<TicketRecord>> {
        let record = sqlx::query_as::<_, TicketRecord>(
            r#"
            SELECT id, request_type, status, created_at, updated_at
            FROM tickets
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_new_network_request(&self, ticket_id: &str) -> Result<Option<NewNetworkRecord>> {
        let record = sqlx::query_as::<_, NewNetworkRecord>(
            r#"
            SELECT ticket_id, vnet, vnet_tag, status, error, subnet, router_ip, broadcast
            FROM new_network_requests
            WHERE ticket_id = ?
            "#,
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_delete_network_request(
        &self,
        ticket_id: &str,
    ) -> Result<Option<DeleteNetworkRecord>> {
        let record = sqlx::query_as::<_, DeleteNetworkRecord>(
            r#"
            SELECT ticket_id, vnet, status, error
            FROM delete_network_requests
            WHERE ticket_id = ?
            "#,
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_pending_tickets(&self, limit: i64) -> Result<Vec<TicketRecord>> {
        let records = sqlx::query_as::<_, TicketRecord>(
            r#"
            SELECT id, request_type, status, created_at, updated_at
            FROM tickets
            WHERE status = 'pending'
            ORDER BY updated_at, id
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn touch_ticket(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE tickets SET updated_at = ? WHERE id = ?")
            .bind(chrono::Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SassoError::not_found("ticket", id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Gateway interfaces
    // ------------------------------------------------------------------

    async fn insert_gateway_interface(&self, iface: &NewGatewayInterface) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO gateway_interfaces
                (ticket_id, local_id, vnet, vnet_tag, subnet, router_ip, broadcast, firewall_interface)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&iface.ticket_id)
        .bind(&iface.local_id)
        .bind(&iface.vnet)
        .bind(i64::from(iface.vnet_tag))
        .bind(&iface.subnet)
        .bind(&iface.router_ip)
        .bind(&iface.broadcast)
        .bind(&iface.firewall_interface)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            SassoError::from_insert(e, || {
                format!(
                    "gateway interface for vnet '{}' tag {} subnet {}",
                    iface.vnet, iface.vnet_tag, iface.subnet
                )
            })
        })
    }

    async fn get_gateway_interface_by_vnet(
        &self,
        vnet: &str,
    ) -> Result<Option<GatewayInterfaceRecord>> {
        let record = sqlx::query_as::<_, GatewayInterfaceRecord>(
            r#"
            SELECT id, ticket_id, local_id, vnet, vnet_tag, subnet, router_ip, broadcast,
                   firewall_interface
            FROM gateway_interfaces
            WHERE vnet = ?
            "#,
        )
        .bind(vnet)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_gateway_interface_by_tag(
        &self,
        vnet_tag: u32,
    ) -> Result<Option<GatewayInterfaceRecord>> {
        let record = sqlx::query_as::<_, GatewayInterfaceRecord>(
            r#"
            SELECT id, ticket_id, local_id, vnet, vnet_tag, subnet, router_ip, broadcast,
                   firewall_interface
            FROM gateway_interfaces
            WHERE vnet_tag = ?
            "#,
        )
        .bind(i64::from(vnet_tag))
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_gateway_interfaces(&self) -> Result<Vec<GatewayInterfaceRecord>> {
        let records = sqlx::query_as::<_, GatewayInterfaceRecord>(
            r#"
            SELECT id, ticket_id, local_id, vnet, vnet_tag, subnet, router_ip, broadcast,
                   firewall_interface
            FROM gateway_interfaces
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_gateway_interface(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM gateway_interfaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Nets
    // ------------------------------------------------------------------

    async fn insert_net(&self, net: &NewNet) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO nets
                (owner_id, name, tag, subnet, gateway, broadcast, group_name, vlan_aware, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(net.owner_id)
        .bind(&net.name)
        .bind(i64::from(net.tag))
        .bind(&net.subnet)
        .bind(&net.gateway)
        .bind(&net.broadcast)
        .bind(&net.group_name)
        .bind(net.vlan_aware)
        .bind(net.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            SassoError::from_insert(e, || format!("net '{}' or tag {}", net.name, net.tag))
        })
    }

    async fn get_net(&self, id: i64) -> Result<Option<NetRecord>> {
        let record = sqlx::query_as::<_, NetRecord>(
            r#"
            SELECT id, owner_id, name, tag, subnet, gateway, broadcast, group_name, vlan_aware, status
            FROM nets
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_nets(&self) -> Result<Vec<NetRecord>> {
        let records = sqlx::query_as::<_, NetRecord>(
            r#"
            SELECT id, owner_id, name, tag, subnet, gateway, broadcast, group_name, vlan_aware, status
            FROM nets
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_nets_by_status(&self, status: ResourceStatus) -> Result<Vec<NetRecord>> {
        let records = sqlx::query_as::<_, NetRecord>(
            r#"
            SELECT id, owner_id, name, tag, subnet, gateway, broadcast, group_name, vlan_aware, status
            FROM nets
            WHERE status = ?
            ORDER BY id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_net_status(&self, id: i64, status: ResourceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE nets SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        not_updated("net", id, result.rows_affected())
    }

    async fn mark_net_for_deletion(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE nets SET status = 'pre-deleting' WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        not_updated("net", id, result.rows_affected())?;

        sqlx::query("UPDATE port_forwards SET status = 'pre-deleting' WHERE net_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reconfigure_net(&self, id: i64, vlan_aware: bool) -> Result<()> {
        let result =
            sqlx::query("UPDATE nets SET vlan_aware = ?, status = 'pre-configuring' WHERE id = ?")
                .bind(vlan_aware)
                .bind(id)
                .execute(&self.pool)
                .await?;
        not_updated("net", id, result.rows_affected())
    }

    async fn delete_net(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM nets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                SassoError::from_delete(e, || format!("net {id} still has VM interfaces"))
            })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // VMs
    // ------------------------------------------------------------------

    async fn insert_vm(&self, vm: &NewVm) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO vms (owner_id, name, cores, ram_mb, disk_gb, status)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(vm.owner_id)
        .bind(&vm.name)
        .bind(i64::from(vm.cores))
        .bind(i64::from(vm.ram_mb))
        .bind(i64::from(vm.disk_gb))
        .bind(vm.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SassoError::from_insert(e, || format!("vm '{}'", vm.name)))
    }

    async fn get_vm(&self, id: i64) -> Result<Option<VmRecord>> {
        let record = sqlx::query_as::<_, VmRecord>(
            r#"
            SELECT id, owner_id, name, cores, ram_mb, disk_gb, status
            FROM vms
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_vms(&self) -> Result<Vec<VmRecord>> {
        let records = sqlx::query_as::<_, VmRecord>(
            r#"
            SELECT id, owner_id, name, cores, ram_mb, disk_gb, status
            FROM vms
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_vms_by_status(&self, status: ResourceStatus) -> Result<Vec<VmRecord>> {
        let records = sqlx::query_as::<_, VmRecord>(
            r#"
            SELECT id, owner_id, name, cores, ram_mb, disk_gb, status
            FROM vms
            WHERE status = ?
            ORDER BY id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_vm_status(&self, id: i64, status: ResourceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE vms SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        not_updated("vm", id, result.rows_affected())
    }

    async fn delete_vm(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM vms WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // VM interfaces
    // ------------------------------------------------------------------

    async fn insert_vm_interface(&self, iface: &NewVmInterface) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO vm_interfaces (vm_id, net_id, address, gateway, status)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(iface.vm_id)
        .bind(iface.net_id)
        .bind(&iface.address)
        .bind(&iface.gateway)
        .bind(iface.status.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_vm_interface(&self, id: i64) -> Result<Option<VmInterfaceRecord>> {
        let record = sqlx::query_as::<_, VmInterfaceRecord>(
            r#"
            SELECT id, vm_id, net_id, address, gateway, status
            FROM vm_interfaces
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_vm_interfaces(&self, vm_id: i64) -> Result<Vec<VmInterfaceRecord>> {
        let records = sqlx::query_as::<_, VmInterfaceRecord>(
            r#"
            SELECT id, vm_id, net_id, address, gateway, status
            FROM vm_interfaces
            WHERE vm_id = ?
            ORDER BY id
            "#,
        )
        .bind(vm_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_vm_interfaces_for_net(&self, net_id: i64) -> Result<Vec<VmInterfaceRecord>> {
        let records = sqlx::query_as::<_, VmInterfaceRecord>(
            r#"
            SELECT id, vm_id, net_id, address, gateway, status
            FROM vm_interfaces
            WHERE net_id = ?
            ORDER BY id
            "#,
        )
        .bind(net_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_vm_interfaces_by_status(
        &self,
        status: ResourceStatus,
    ) -> Result<Vec<VmInterfaceRecord>> {
        let records = sqlx::query_as::<_, VmInterfaceRecord>(
            r#"
            SELECT id, vm_id, net_id, address, gateway, status
            FROM vm_interfaces
            WHERE status = ?
            ORDER BY id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_vm_interface_status(&self, id: i64, status: ResourceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE vm_interfaces SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        not_updated("vm interface", id, result.rows_affected())
    }

    async fn delete_vm_interface(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM vm_interfaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_vm_interfaces_for_vm(&self, vm_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM vm_interfaces WHERE vm_id = ?")
            .bind(vm_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_primary_addresses(&self) -> Result<Vec<PrimaryAddressRecord>> {
        let records = sqlx::query_as::<_, PrimaryAddressRecord>(
            r#"
            SELECT v.id AS vm_id, v.name AS vm_name, v.owner_id AS owner_id,
                   n.id AS net_id, n.group_name AS group_name, i.address AS address
            FROM vm_interfaces i
            JOIN vms v ON v.id = i.vm_id
            JOIN nets n ON n.id = i.net_id
            WHERE i.gateway IS NOT NULL
              AND i.status = 'ready'
              AND v.status = 'ready'
              AND n.status = 'ready'
            ORDER BY v.id, i.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // ------------------------------------------------------------------
    // Port forwards
    // ------------------------------------------------------------------

    async fn insert_port_forward(&self, pf: &NewPortForward) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO port_forwards (net_id, owner_id, out_port, dest_port, dest_ip, status)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(pf.net_id)
        .bind(pf.owner_id)
        .bind(i64::from(pf.out_port))
        .bind(i64::from(pf.dest_port))
        .bind(&pf.dest_ip)
        .bind(pf.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SassoError::from_insert(e, || format!("port {} already forwarded", pf.out_port)))
    }

    async fn get_port_forward(&self, id: i64) -> Result<Option<PortForwardRecord>> {
        let record = sqlx::query_as::<_, PortForwardRecord>(
            r#"
            SELECT id, net_id, owner_id, out_port, dest_port, dest_ip, status
            FROM port_forwards
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_port_forward_by_out_port(
        &self,
        out_port: u16,
    ) -> Result<Option<PortForwardRecord>> {
        let record = sqlx::query_as::<_, PortForwardRecord>(
            r#"
            SELECT id, net_id, owner_id, out_port, dest_port, dest_ip, status
            FROM port_forwards
            WHERE out_port = ?
            "#,
        )
        .bind(i64::from(out_port))
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_port_forwards_by_status(
        &self,
        status: ResourceStatus,
    ) -> Result<Vec<PortForwardRecord>> {
        let records = sqlx::query_as::<_, PortForwardRecord>(
            r#"
            SELECT id, net_id, owner_id, out_port, dest_port, dest_ip, status
            FROM port_forwards
            WHERE status = ?
            ORDER BY id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_port_forward_status(&self, id: i64, status: ResourceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE port_forwards SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        not_updated("port forward", id, result.rows_affected())
    }

    async fn delete_port_forward(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM port_forwards WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    async fn insert_backup_request(&self, request: &NewBackupRequest) -> Result<i64> {
        let now = chrono::Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO backup_requests
                (kind, status, vm_id, owner_id, name, notes, volid, created_at, updated_at)
            VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(request.kind.as_str())
        .bind(request.vm_id)
        .bind(request.owner_id)
        .bind(&request.name)
        .bind(&request.notes)
        .bind(&request.volid)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_backup_request(&self, id: i64) -> Result<Option<BackupRequestRecord>> {
        let record = sqlx::query_as::<_, BackupRequestRecord>(
            r#"
            SELECT id, kind, status, vm_id, owner_id, name, notes, volid, error
            FROM backup_requests
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_pending_backup_requests(
        &self,
        kind: BackupRequestKind,
    ) -> Result<Vec<BackupRequestRecord>> {
        let records = sqlx::query_as::<_, BackupRequestRecord>(
            r#"
            SELECT id, kind, status, vm_id, owner_id, name, notes, volid, error
            FROM backup_requests
            WHERE status = 'pending' AND kind = ?
            ORDER BY id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn has_pending_backup_request(&self, vm_id: i64) -> Result<bool> {
        let pending = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM backup_requests WHERE vm_id = ? AND status = 'pending'",
        )
        .bind(vm_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(pending > 0)
    }

    async fn finish_backup_request(
        &self,
        id: i64,
        status: BackupRequestStatus,
        volid: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE backup_requests
            SET status = ?, volid = COALESCE(?, volid), error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(volid)
        .bind(error)
        .bind(chrono::Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        not_updated("backup request", id, result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    async fn insert_user(&self, user: &NewUser) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO users (username, email, vpn_address)
            VALUES (?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.vpn_address)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SassoError::from_insert(e, || format!("user '{}'", user.username)))
    }

    async fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT id, username, email, vpn_address FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        let records = sqlx::query_as::<_, UserRecord>(
            "SELECT id, username, email, vpn_address FROM users ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn add_group_member(&self, group_name: &str, user_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_members (group_name, user_id)
            VALUES (?, ?)
            ON CONFLICT (group_name, user_id) DO NOTHING
            "#,
        )
        .bind(group_name)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_user_groups(&self, user_id: i64) -> Result<Vec<String>> {
        let groups = sqlx::query_scalar::<_, String>(
            "SELECT group_name FROM group_members WHERE user_id = ? ORDER BY group_name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(groups)
    }

    async fn insert_telegram_bot(&self, bot: &NewTelegramBot) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO telegram_bots (user_id, token, chat_id, enabled)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(bot.user_id)
        .bind(&bot.token)
        .bind(&bot.chat_id)
        .bind(bot.enabled)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn list_enabled_telegram_bots(
        &self,
        user_id: Option<i64>,
    ) -> Result<Vec<TelegramBotRecord>> {
        let records = sqlx::query_as::<_, TelegramBotRecord>(
            r#"
            SELECT id, user_id, token, chat_id, enabled
            FROM telegram_bots
            WHERE enabled = TRUE AND (?1 IS NULL OR user_id = ?1)
            ORDER BY id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    async fn insert_notification(&self, notification: &NewNotification) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO notifications (user_id, subject, body, email, telegram, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            RETURNING id
            "#,
        )
        .bind(notification.user_id)
        .bind(&notification.subject)
        .bind(&notification.body)
        .bind(notification.email)
        .bind(notification.telegram)
        .bind(chrono::Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_notification(&self, id: i64) -> Result<Option<NotificationRecord>> {
        let record = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT id, user_id, subject, body, email, telegram, status, created_at
            FROM notifications
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_pending_notifications(&self) -> Result<Vec<NotificationRecord>> {
        let records = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT id, user_id, subject, body, email, telegram, status, created_at
            FROM notifications
            WHERE status = 'pending'
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn mark_notification_sent(&self, id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE notifications SET status = 'sent' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        not_updated("notification", id, result.rows_affected())
    }

    async fn count_notifications(&self) -> Result<Vec<NotificationCountRecord>> {
        let records = sqlx::query_as::<_, NotificationCountRecord>(
            r#"
            SELECT status, email, telegram, COUNT(*) AS count
            FROM notifications
            GROUP BY status, email, telegram
            ORDER BY status, email, telegram
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // ------------------------------------------------------------------
    // Counts
    // ------------------------------------------------------------------

    async fn count_objects(&self) -> Result<ObjectCounts> {
        let counts = sqlx::query_as::<_, ObjectCounts>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM vms) AS vms,
                (SELECT COUNT(*) FROM vm_interfaces) AS vm_interfaces,
                (SELECT COUNT(*) FROM nets) AS nets,
                (SELECT COUNT(*) FROM port_forwards) AS port_forwards
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestStatus;
    use crate::store::NotificationStatus;
    use chrono::Utc;
    use uuid::Uuid;

    /// Create an in-memory SQLite store for testing.
    async fn test_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite store")
    }

    fn ticket(id: &str, request_type: &str) -> TicketRecord {
        let now = Utc::now();
        TicketRecord {
            id: id.to_string(),
            request_type: request_type.to_string(),
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn new_network(ticket_id: &str, vnet: &str, tag: u32) -> NewNetworkRecord {
        NewNetworkRecord {
            ticket_id: ticket_id.to_string(),
            vnet: vnet.to_string(),
            vnet_tag: tag,
            status: RequestStatus::Pending,
            error: None,
            subnet: None,
            router_ip: None,
            broadcast: None,
        }
    }

    fn net(name: &str, tag: u32, status: ResourceStatus) -> NewNet {
        NewNet {
            owner_id: 1,
            name: name.to_string(),
            tag,
            subnet: "10.0.0.0/24".to_string(),
            gateway: "10.0.0.254".to_string(),
            broadcast: "10.0.0.255".to_string(),
            group_name: None,
            vlan_aware: false,
            status,
        }
    }

    #[tokio::test]
    async fn test_save_and_get_ticket() {
        let store = test_store().await;
        let id = Uuid::now_v7().to_string();

        store
            .save_ticket(
                &ticket(&id, "new-network"),
                &RequestRecord::NewNetwork(new_network(&id, "alpha", 100)),
            )
            .await
            .expect("Failed to save ticket");

        let saved = store.get_ticket(&id).await.unwrap().expect("ticket exists");
        assert_eq!(saved.request_type, "new-network");
        assert_eq!(saved.status, RequestStatus::Pending);

        let request = store
            .get_new_network_request(&id)
            .await
            .unwrap()
            .expect("request exists");
        assert_eq!(request.vnet, "alpha");
        assert_eq!(request.vnet_tag, 100);
    }

    #[tokio::test]
    async fn test_save_ticket_updates_existing_rows() {
        let store = test_store().await;
        let id = Uuid::now_v7().to_string();
        let mut t = ticket(&id, "new-network");
        let mut r = new_network(&id, "alpha", 100);
        store
            .save_ticket(&t, &RequestRecord::NewNetwork(r.clone()))
            .await
            .unwrap();

        t.status = RequestStatus::Success;
        r.status = RequestStatus::Success;
        r.subnet = Some("10.0.0.0/24".into());
        store
            .save_ticket(&t, &RequestRecord::NewNetwork(r))
            .await
            .unwrap();

        assert_eq!(
            store.get_ticket(&id).await.unwrap().unwrap().status,
            RequestStatus::Success
        );
        let request = store.get_new_network_request(&id).await.unwrap().unwrap();
        assert_eq!(request.subnet.as_deref(), Some("10.0.0.0/24"));
        assert!(store.list_pending_tickets(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_ticket_not_found() {
        let store = test_store().await;
        assert!(store.get_ticket("nonexistent").await.unwrap().is_none());
        assert!(store
            .get_delete_network_request("nonexistent")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_pending_tickets_in_creation_order() {
        let store = test_store().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let id = Uuid::now_v7().to_string();
            store
                .save_ticket(
                    &ticket(&id, "delete-network"),
                    &RequestRecord::DeleteNetwork(DeleteNetworkRecord {
                        ticket_id: id.clone(),
                        vnet: format!("net{i}"),
                        status: RequestStatus::Pending,
                        error: None,
                    }),
                )
                .await
                .unwrap();
            ids.push(id);
        }

        let pending: Vec<String> = store
            .list_pending_tickets(10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(pending, ids);
        assert_eq!(store.list_pending_tickets(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_gateway_interface_uniqueness() {
        let store = test_store().await;
        let iface = NewGatewayInterface {
            ticket_id: None,
            local_id: "vxlan100".into(),
            vnet: "alpha".into(),
            vnet_tag: 100,
            subnet: "10.0.0.0/24".into(),
            router_ip: "10.0.0.254".into(),
            broadcast: "10.0.0.255".into(),
            firewall_interface: "vxlan100".into(),
        };
        store.insert_gateway_interface(&iface).await.unwrap();

        let mut same_tag = iface.clone();
        same_tag.vnet = "beta".into();
        same_tag.subnet = "10.0.1.0/24".into();
        same_tag.router_ip = "10.0.1.254".into();
        let err = store.insert_gateway_interface(&same_tag).await.unwrap_err();
        assert!(matches!(err, SassoError::Conflict(_)));

        let found = store.get_gateway_interface_by_tag(100).await.unwrap().unwrap();
        assert_eq!(found.vnet, "alpha");
    }

    #[tokio::test]
    async fn test_net_status_lifecycle() {
        let store = test_store().await;
        let id = store
            .insert_net(&net("alpha", 100, ResourceStatus::PreCreating))
            .await
            .unwrap();

        let pending = store
            .list_nets_by_status(ResourceStatus::PreCreating)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        store
            .update_net_status(id, ResourceStatus::Ready)
            .await
            .unwrap();
        assert_eq!(
            store.get_net(id).await.unwrap().unwrap().status,
            ResourceStatus::Ready
        );

        store.delete_net(id).await.unwrap();
        assert!(store.get_net(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let store = test_store().await;
        let err = store
            .update_vm_status(404, ResourceStatus::Ready)
            .await
            .unwrap_err();
        assert!(matches!(err, SassoError::NotFound { entity: "vm", .. }));
    }

    #[tokio::test]
    async fn test_mark_net_for_deletion_flips_port_forwards() {
        let store = test_store().await;
        let net_id = store
            .insert_net(&net("alpha", 100, ResourceStatus::Ready))
            .await
            .unwrap();
        let pf_id = store
            .insert_port_forward(&NewPortForward {
                net_id,
                owner_id: 1,
                out_port: 2222,
                dest_port: 22,
                dest_ip: "10.0.0.5".into(),
                status: ResourceStatus::Ready,
            })
            .await
            .unwrap();

        store.mark_net_for_deletion(net_id).await.unwrap();

        assert_eq!(
            store.get_net(net_id).await.unwrap().unwrap().status,
            ResourceStatus::PreDeleting
        );
        assert_eq!(
            store.get_port_forward(pf_id).await.unwrap().unwrap().status,
            ResourceStatus::PreDeleting
        );
    }

    #[tokio::test]
    async fn test_port_forward_out_port_is_unique() {
        let store = test_store().await;
        let net_id = store
            .insert_net(&net("alpha", 100, ResourceStatus::Ready))
            .await
            .unwrap();
        let pf = NewPortForward {
            net_id,
            owner_id: 1,
            out_port: 8080,
            dest_port: 80,
            dest_ip: "10.0.0.5".into(),
            status: ResourceStatus::PreCreating,
        };
        store.insert_port_forward(&pf).await.unwrap();
        assert!(matches!(
            store.insert_port_forward(&pf).await,
            Err(SassoError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_primary_addresses_only_ready() {
        let store = test_store().await;
        let net_id = store
            .insert_net(&net("alpha", 100, ResourceStatus::Ready))
            .await
            .unwrap();
        let ready_vm = store
            .insert_vm(&NewVm {
                owner_id: 1,
                name: "web".into(),
                cores: 1,
                ram_mb: 1024,
                disk_gb: 10,
                status: ResourceStatus::Ready,
            })
            .await
            .unwrap();
        let creating_vm = store
            .insert_vm(&NewVm {
                owner_id: 1,
                name: "db".into(),
                cores: 1,
                ram_mb: 1024,
                disk_gb: 10,
                status: ResourceStatus::PreCreating,
            })
            .await
            .unwrap();

        for (vm_id, address, gateway) in [
            (ready_vm, "10.0.0.5/24", Some("10.0.0.254")),
            (ready_vm, "10.0.0.6/24", None),
            (creating_vm, "10.0.0.7/24", Some("10.0.0.254")),
        ] {
            store
                .insert_vm_interface(&NewVmInterface {
                    vm_id,
                    net_id,
                    address: address.into(),
                    gateway: gateway.map(String::from),
                    status: ResourceStatus::Ready,
                })
                .await
                .unwrap();
        }

        let primaries = store.list_primary_addresses().await.unwrap();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].vm_name, "web");
        assert_eq!(primaries[0].address, "10.0.0.5/24");
    }

    #[tokio::test]
    async fn test_notifications_pending_then_sent() {
        let store = test_store().await;
        let id = store
            .insert_notification(&NewNotification::to_user(1, "VM ready", "web is up"))
            .await
            .unwrap();

        let pending = store.list_pending_notifications().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        store.mark_notification_sent(id).await.unwrap();
        assert!(store.list_pending_notifications().await.unwrap().is_empty());
        assert_eq!(
            store.get_notification(id).await.unwrap().unwrap().status,
            NotificationStatus::Sent
        );
    }

    #[tokio::test]
    async fn test_telegram_bots_filtered_by_user_and_enabled() {
        let store = test_store().await;
        let alice = store
            .insert_user(&NewUser {
                username: "alice".into(),
                email: "alice@example.com".into(),
                vpn_address: None,
            })
            .await
            .unwrap();
        let bob = store
            .insert_user(&NewUser {
                username: "bob".into(),
                email: "bob@example.com".into(),
                vpn_address: None,
            })
            .await
            .unwrap();

        for (user_id, chat, enabled) in [(alice, "1", true), (alice, "2", false), (bob, "3", true)] {
            store
                .insert_telegram_bot(&NewTelegramBot {
                    user_id,
                    token: "token".into(),
                    chat_id: chat.into(),
                    enabled,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.list_enabled_telegram_bots(Some(alice)).await.unwrap().len(), 1);
        assert_eq!(store.list_enabled_telegram_bots(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_group_membership() {
        let store = test_store().await;
        let user = store
            .insert_user(&NewUser {
                username: "carol".into(),
                email: "carol@example.com".into(),
                vpn_address: Some("10.250.0.2".into()),
            })
            .await
            .unwrap();
        store.add_group_member("lab", user).await.unwrap();
        store.add_group_member("lab", user).await.unwrap();
        store.add_group_member("ops", user).await.unwrap();

        assert_eq!(
            store.list_user_groups(user).await.unwrap(),
            vec!["lab".to_string(), "ops".to_string()]
        );
    }

    fn vm(name: &str) -> NewVm {
        NewVm {
            owner_id: 1,
            name: name.into(),
            cores: 1,
            ram_mb: 1024,
            disk_gb: 10,
            status: ResourceStatus::Ready,
        }
    }

    #[tokio::test]
    async fn test_touched_ticket_moves_behind_others() {
        let store = test_store().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let id = Uuid::now_v7().to_string();
            store
                .save_ticket(
                    &ticket(&id, "new-network"),
                    &RequestRecord::NewNetwork(new_network(&id, &format!("net{i}"), 100 + i)),
                )
                .await
                .unwrap();
            ids.push(id);
        }

        store.touch_ticket(&ids[0]).await.unwrap();

        let pending: Vec<String> = store
            .list_pending_tickets(10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(pending, vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);

        let err = store.touch_ticket("nonexistent").await.unwrap_err();
        assert!(matches!(err, SassoError::NotFound { entity: "ticket", .. }));
    }

    #[tokio::test]
    async fn test_net_with_interfaces_cannot_be_deleted() {
        let store = test_store().await;
        let net_id = store
            .insert_net(&net("alpha", 100, ResourceStatus::PreDeleting))
            .await
            .unwrap();
        let vm_id = store.insert_vm(&vm("web")).await.unwrap();
        let iface = store
            .insert_vm_interface(&NewVmInterface {
                vm_id,
                net_id,
                address: "10.0.0.5/24".into(),
                gateway: None,
                status: ResourceStatus::Ready,
            })
            .await
            .unwrap();

        let attached = store.list_vm_interfaces_for_net(net_id).await.unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].id, iface);

        let err = store.delete_net(net_id).await.unwrap_err();
        assert!(matches!(err, SassoError::Conflict(_)));
        assert!(store.get_vm_interface(iface).await.unwrap().is_some());

        store.delete_vm_interface(iface).await.unwrap();
        store.delete_net(net_id).await.unwrap();
        assert!(store.get_net(net_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconfigure_net() {
        let store = test_store().await;
        let id = store
            .insert_net(&net("alpha", 100, ResourceStatus::Ready))
            .await
            .unwrap();
        assert!(!store.get_net(id).await.unwrap().unwrap().vlan_aware);

        store.reconfigure_net(id, true).await.unwrap();

        let net = store.get_net(id).await.unwrap().unwrap();
        assert!(net.vlan_aware);
        assert_eq!(net.status, ResourceStatus::PreConfiguring);
        assert!(matches!(
            store.reconfigure_net(404, true).await.unwrap_err(),
            SassoError::NotFound { entity: "net", .. }
        ));
    }

    #[tokio::test]
    async fn test_backup_request_lifecycle() {
        let store = test_store().await;
        let create = store
            .insert_backup_request(&NewBackupRequest {
                kind: BackupRequestKind::Create,
                vm_id: 7,
                owner_id: 1,
                name: "nightly".into(),
                notes: String::new(),
                volid: None,
            })
            .await
            .unwrap();
        let restore = store
            .insert_backup_request(&NewBackupRequest {
                kind: BackupRequestKind::Restore,
                vm_id: 8,
                owner_id: 1,
                name: String::new(),
                notes: String::new(),
                volid: Some("backup:vzdump-qemu-8-1".into()),
            })
            .await
            .unwrap();

        assert!(store.has_pending_backup_request(7).await.unwrap());
        assert!(!store.has_pending_backup_request(9).await.unwrap());
        let creates = store
            .list_pending_backup_requests(BackupRequestKind::Create)
            .await
            .unwrap();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].id, create);

        store
            .finish_backup_request(create, BackupRequestStatus::Completed, Some("backup:vzdump-qemu-7-1"), None)
            .await
            .unwrap();
        store
            .finish_backup_request(restore, BackupRequestStatus::Failed, None, Some("VM is gone"))
            .await
            .unwrap();

        let done = store.get_backup_request(create).await.unwrap().unwrap();
        assert_eq!(done.status, BackupRequestStatus::Completed);
        assert_eq!(done.volid.as_deref(), Some("backup:vzdump-qemu-7-1"));
        let failed = store.get_backup_request(restore).await.unwrap().unwrap();
        assert_eq!(failed.status, BackupRequestStatus::Failed);
        assert_eq!(failed.volid.as_deref(), Some("backup:vzdump-qemu-8-1"));
        assert_eq!(failed.error.as_deref(), Some("VM is gone"));
        assert!(!store.has_pending_backup_request(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_object_and_notification_counts() {
        let store = test_store().await;
        let net_id = store
            .insert_net(&net("alpha", 100, ResourceStatus::Ready))
            .await
            .unwrap();
        let vm_id = store.insert_vm(&vm("web")).await.unwrap();
        store.insert_vm(&vm("db")).await.unwrap();
        store
            .insert_vm_interface(&NewVmInterface {
                vm_id,
                net_id,
                address: "10.0.0.5/24".into(),
                gateway: None,
                status: ResourceStatus::Ready,
            })
            .await
            .unwrap();

        assert_eq!(
            store.count_objects().await.unwrap(),
            ObjectCounts {
                vms: 2,
                vm_interfaces: 1,
                nets: 1,
                port_forwards: 0,
            }
        );

        let sent = store
            .insert_notification(&NewNotification::to_user(1, "a", "b"))
            .await
            .unwrap();
        store
            .insert_notification(&NewNotification::to_user(1, "c", "d"))
            .await
            .unwrap();
        store.mark_notification_sent(sent).await.unwrap();

        let counts = store.count_notifications().await.unwrap();
        assert_eq!(counts.len(), 2);
        assert!(counts.iter().all(|c| c.count == 1 && c.email && c.telegram));
        assert!(counts.iter().any(|c| c.status == NotificationStatus::Pending));
        assert!(counts.iter().any(|c| c.status == NotificationStatus::Sent));
    }
}
