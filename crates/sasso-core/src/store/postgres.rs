//! PostgreSQL-backed store implementation.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
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

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool. Migrations must already be applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        migrations::run_postgres(&pool).await?;
        debug!("PostgreSQL store ready");

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
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
impl Store for PostgresStore {
    // ------------------------------------------------------------------
    // Tickets
    // ------------------------------------------------------------------

    async fn save_ticket(&self, ticket: &TicketRecord, request: &RequestRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tickets (id, request_type, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
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
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
                    VALUES ($1, $2, $3, $4)
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
            WHERE id = $1
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
            WHERE ticket_id = $1
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
            WHERE ticket_id = $1
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
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn touch_ticket(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE tickets SET updated_at = $1 WHERE id = $2")
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
            WHERE vnet = $1
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
            WHERE vnet_tag = $1
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
        sqlx::query("DELETE FROM gateway_interfaces WHERE id = $1")
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
            WHERE id = $1
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
            WHERE status = $1
            ORDER BY id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_net_status(&self, id: i64, status: ResourceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE nets SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        not_updated("net", id, result.rows_affected())
    }

    async fn mark_net_for_deletion(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE nets SET status = 'pre-deleting' WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        not_updated("net", id, result.rows_affected())?;

        sqlx::query("UPDATE port_forwards SET status = 'pre-deleting' WHERE net_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reconfigure_net(&self, id: i64, vlan_aware: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE nets SET vlan_aware = $1, status = 'pre-configuring' WHERE id = $2",
        )
        .bind(vlan_aware)
        .bind(id)
        .execute(&self.pool)
        .await?;
        not_updated("net", id, result.rows_affected())
    }

    async fn delete_net(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM nets WHERE id = $1")
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
            VALUES ($1, $2, $3, $4, $5, $6)
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
            WHERE id = $1
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
            WHERE status = $1
            ORDER BY id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_vm_status(&self, id: i64, status: ResourceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE vms SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        not_updated("vm", id, result.rows_affected())
    }

    async fn delete_vm(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM vms WHERE id = $1")
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
            VALUES ($1, $2, $3, $4, $5)
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
            WHERE id = $1
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
            WHERE vm_id = $1
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
            WHERE net_id = $1
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
            WHERE status = $1
            ORDER BY id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_vm_interface_status(&self, id: i64, status: ResourceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE vm_interfaces SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        not_updated("vm interface", id, result.rows_affected())
    }

    async fn delete_vm_interface(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM vm_interfaces WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_vm_interfaces_for_vm(&self, vm_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM vm_interfaces WHERE vm_id = $1")
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
            VALUES ($1, $2, $3, $4, $5, $6)
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
            WHERE id = $1
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
            WHERE out_port = $1
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
            WHERE status = $1
            ORDER BY id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_port_forward_status(&self, id: i64, status: ResourceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE port_forwards SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        not_updated("port forward", id, result.rows_affected())
    }

    async fn delete_port_forward(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM port_forwards WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    async fn insert_backup_request(&self, request: &NewBackupRequest) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO backup_requests (kind, status, vm_id, owner_id, name, notes, volid)
            VALUES ($1, 'pending', $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(request.kind.as_str())
        .bind(request.vm_id)
        .bind(request.owner_id)
        .bind(&request.name)
        .bind(&request.notes)
        .bind(&request.volid)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_backup_request(&self, id: i64) -> Result<Option<BackupRequestRecord>> {
        let record = sqlx::query_as::<_, BackupRequestRecord>(
            r#"
            SELECT id, kind, status, vm_id, owner_id, name, notes, volid, error
            FROM backup_requests
            WHERE id = $1
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
            WHERE status = 'pending' AND kind = $1
            ORDER BY id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn has_pending_backup_request(&self, vm_id: i64) -> Result<bool> {
        let pending = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM backup_requests WHERE vm_id = $1 AND status = 'pending')",
        )
        .bind(vm_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(pending)
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
            SET status = $1, volid = COALESCE($2, volid), error = $3, updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(status.as_str())
        .bind(volid)
        .bind(error)
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
            VALUES ($1, $2, $3)
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
            "SELECT id, username, email, vpn_address FROM users WHERE id = $1",
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
            VALUES ($1, $2)
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
            "SELECT group_name FROM group_members WHERE user_id = $1 ORDER BY group_name",
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
            VALUES ($1, $2, $3, $4)
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
            WHERE enabled = TRUE AND ($1::BIGINT IS NULL OR user_id = $1)
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
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
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
            WHERE id = $1
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
        let result = sqlx::query("UPDATE notifications SET status = 'sent' WHERE id = $1")
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
