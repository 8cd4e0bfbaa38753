// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router-domain reconciler.
//!
//! Each cycle:
//! 1. verifies every recorded gateway interface and drops the ones that
//!    drifted, so a later ticket can recreate them;
//! 2. executes pending tickets, least recently attempted first, under the
//!    VNet's guard;
//! 3. converges port forwards onto the firewall.
//!
//! Every network resource is guarded by its VNet name, so tickets, port
//! forwards and API handlers touching the same VNet serialize.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use sasso_core::addressing::{AddressPool, Ipv4Subnet};
use sasso_core::backend::{
    Firewall, FirewallRule, Gateway, InterfaceSpec, tolerate_exists, tolerate_missing,
};
use sasso_core::store::{
    GatewayInterfaceRecord, NetRecord, NewNotification, PortForwardRecord, TicketRecord,
};
use sasso_core::{
    GuardKey, GuardTable, Request, RequestContext, RequestStatus, ResourceStatus, SassoError,
    Store, Ticket, TicketId,
};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::{WorkerMetrics, timed};
use crate::worker::{CycleReport, Reconciler};

/// Router reconciler configuration.
#[derive(Debug, Clone)]
pub struct NetworkReconcilerConfig {
    /// Maximum tickets executed per cycle
    pub batch_size: i64,
    /// Firewall zone of the uplink
    pub external_zone: String,
    /// Public address, the original destination of NAT reflection rules
    pub public_ip: Option<Ipv4Addr>,
}

impl Default for NetworkReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            external_zone: "net".to_string(),
            public_ip: None,
        }
    }
}

/// Reconciles gateway interfaces, network tickets and port forwards.
pub struct NetworkReconciler {
    store: Arc<dyn Store>,
    gateway: Arc<dyn Gateway>,
    firewall: Arc<dyn Firewall>,
    pool: Arc<AddressPool>,
    guards: Arc<GuardTable>,
    config: NetworkReconcilerConfig,
    metrics: Option<WorkerMetrics>,
}

impl NetworkReconciler {
    /// Create a router reconciler.
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn Gateway>,
        firewall: Arc<dyn Firewall>,
        pool: Arc<AddressPool>,
        guards: Arc<GuardTable>,
        config: NetworkReconcilerConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            firewall,
            pool,
            guards,
            config,
            metrics: None,
        }
    }

    /// Record step timings and cycle outcomes on `metrics`.
    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn request_context(&self) -> RequestContext<'_> {
        RequestContext {
            store: self.store.as_ref(),
            gateway: self.gateway.as_ref(),
            firewall: self.firewall.as_ref(),
            pool: &self.pool,
            external_zone: &self.config.external_zone,
        }
    }

    // ========================================================================
    // Interface verification
    // ========================================================================

    /// Drop interfaces the gateway no longer has as recorded.
    ///
    /// Healthy interfaces are not counted in the report.
    pub async fn verify_interfaces(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for iface in self.store.list_gateway_interfaces().await? {
            let spec = match interface_spec(&iface) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(vnet = %iface.vnet, error = %e, "Unreadable gateway interface row");
                    report.skip();
                    continue;
                }
            };

            let _guard = self.guards.acquire(&GuardKey::network(&iface.vnet)).await;

            match self.gateway.verify_interface(&iface.local_id, &spec).await {
                Ok(true) => {}
                Ok(false) => match self.drop_interface(&iface).await {
                    Ok(()) => report.succeed(),
                    Err(e) => {
                        error!(vnet = %iface.vnet, error = %e, "Failed to drop drifted interface");
                        report.fail();
                    }
                },
                Err(e) => {
                    warn!(
                        vnet = %iface.vnet,
                        local_id = %iface.local_id,
                        error = %e,
                        "Failed to verify gateway interface"
                    );
                    report.fail();
                }
            }
        }

        Ok(report)
    }

    async fn drop_interface(&self, iface: &GatewayInterfaceRecord) -> Result<()> {
        warn!(
            vnet = %iface.vnet,
            local_id = %iface.local_id,
            gateway = self.gateway.gateway_type(),
            "Gateway interface drifted, removing"
        );
        self.gateway.remove_interface(&iface.local_id).await?;
        self.store.delete_gateway_interface(iface.id).await?;
        Ok(())
    }

    // ========================================================================
    // Tickets
    // ========================================================================

    /// Execute pending tickets.
    ///
    /// A ticket that cannot be loaded or executed is moved to the back of
    /// the queue so it does not hold up the rest of the batch.
    pub async fn process_tickets(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let pending = self
            .store
            .list_pending_tickets(self.config.batch_size)
            .await?;

        if pending.is_empty() {
            debug!("No pending tickets");
            return Ok(report);
        }

        for record in pending {
            match self.process_ticket(&record).await {
                Ok(RequestStatus::Success) => report.succeed(),
                Ok(RequestStatus::Pending) => report.fail(),
                Ok(RequestStatus::Failed) => report.fail(),
                Err(e) => {
                    error!(ticket_id = %record.id, error = %e, "Failed to process ticket");
                    report.fail();
                    if let Err(e) = self.store.touch_ticket(&record.id).await {
                        warn!(ticket_id = %record.id, error = %e, "Failed to requeue ticket");
                    }
                }
            }
        }

        Ok(report)
    }

    async fn process_ticket(&self, record: &TicketRecord) -> Result<RequestStatus> {
        let id: TicketId = record.id.parse()?;
        let request = Request::load(self.store.as_ref(), record).await?;
        let mut ticket = Ticket { id, request };

        let key = GuardKey::network(ticket.request.vnet());
        let guard = self.guards.acquire(&key).await;
        let outcome = ticket.execute(&self.request_context()).await;
        drop(guard);

        ticket.persist(self.store.as_ref()).await?;

        let status = ticket.request.status();
        match outcome {
            Ok(()) => info!(
                ticket_id = %id,
                kind = ticket.request.kind().as_str(),
                vnet = %ticket.request.vnet(),
                "Ticket resolved"
            ),
            Err(e) if status == RequestStatus::Pending => warn!(
                ticket_id = %id,
                error = %e,
                "Ticket execution failed, will retry"
            ),
            Err(e) => error!(
                ticket_id = %id,
                error_code = e.error_code(),
                error = %e,
                "Ticket failed"
            ),
        }

        Ok(status)
    }

    // ========================================================================
    // Port forwards
    // ========================================================================

    /// Converge port forwards onto the firewall.
    pub async fn process_port_forwards(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for pf in self
            .store
            .list_port_forwards_by_status(ResourceStatus::PreCreating)
            .await?
        {
            match self.create_port_forward(&pf).await {
                Ok(true) => report.succeed(),
                Ok(false) => report.skip(),
                Err(e) => {
                    error!(port_forward_id = pf.id, out_port = pf.out_port, error = %e, "Failed to create port forward");
                    report.fail();
                }
            }
        }

        for pf in self
            .store
            .list_port_forwards_by_status(ResourceStatus::PreDeleting)
            .await?
        {
            match self.delete_port_forward(&pf).await {
                Ok(true) => report.succeed(),
                Ok(false) => report.skip(),
                Err(e) => {
                    error!(port_forward_id = pf.id, out_port = pf.out_port, error = %e, "Failed to delete port forward");
                    report.fail();
                }
            }
        }

        let ready = self
            .store
            .list_port_forwards_by_status(ResourceStatus::Ready)
            .await?;
        if !ready.is_empty() {
            report.merge(self.verify_port_forwards(&ready).await?);
        }

        Ok(report)
    }

    fn public_ip(&self) -> Result<Ipv4Addr> {
        self.config.public_ip.ok_or(Error::MissingPublicIp)
    }

    async fn port_forward_net(&self, pf: &PortForwardRecord) -> Result<Option<NetRecord>> {
        let net = self.store.get_net(pf.net_id).await?;
        if net.is_none() {
            warn!(port_forward_id = pf.id, net_id = pf.net_id, "Port forward references a missing net");
        }
        Ok(net)
    }

    /// Returns `false` when the row changed under us and nothing was done.
    async fn create_port_forward(&self, pf: &PortForwardRecord) -> Result<bool> {
        let public_ip = self.public_ip()?;
        let Some(net) = self.port_forward_net(pf).await? else {
            return Ok(false);
        };
        let _guard = self.guards.acquire(&GuardKey::network(&net.name)).await;

        // An API call may have flipped it to pre-deleting while we waited
        match self.store.get_port_forward(pf.id).await? {
            Some(current) if current.status == ResourceStatus::PreCreating => {}
            _ => return Ok(false),
        }

        for rule in port_forward_rules(pf, &net, &self.config.external_zone, public_ip) {
            tolerate_exists(self.firewall.add_rule(&rule).await)?;
        }
        self.firewall.reload().await?;

        self.store
            .update_port_forward_status(pf.id, ResourceStatus::Ready)
            .await?;
        self.store
            .insert_notification(&NewNotification::to_user(
                pf.owner_id,
                "Port forward ready",
                format!(
                    "Port {} now forwards to {}:{}.",
                    pf.out_port, pf.dest_ip, pf.dest_port
                ),
            ))
            .await?;

        info!(port_forward_id = pf.id, out_port = pf.out_port, net = %net.name, "Port forward created");
        Ok(true)
    }

    async fn delete_port_forward(&self, pf: &PortForwardRecord) -> Result<bool> {
        let public_ip = self.public_ip()?;
        let net = self.port_forward_net(pf).await?;
        let _guard = match &net {
            Some(net) => Some(self.guards.acquire(&GuardKey::network(&net.name)).await),
            None => None,
        };

        if let Some(net) = &net {
            for rule in port_forward_rules(pf, net, &self.config.external_zone, public_ip) {
                tolerate_missing(self.firewall.remove_rule(&rule).await)?;
            }
            self.firewall.reload().await?;
        }

        self.store.delete_port_forward(pf.id).await?;
        info!(port_forward_id = pf.id, out_port = pf.out_port, "Port forward deleted");
        Ok(true)
    }

    /// Re-add rules of ready forwards that disappeared from the firewall.
    async fn verify_port_forwards(&self, ready: &[PortForwardRecord]) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let public_ip = self.public_ip()?;
        let present = self.firewall.list_rules().await?;
        let mut changed = false;

        for pf in ready {
            let net = match self.port_forward_net(pf).await {
                Ok(Some(net)) => net,
                Ok(None) => continue,
                Err(e) => {
                    error!(port_forward_id = pf.id, net_id = pf.net_id, error = %e, "Failed to load port forward net");
                    report.fail();
                    continue;
                }
            };
            let _guard = self.guards.acquire(&GuardKey::network(&net.name)).await;

            let missing: Vec<FirewallRule> =
                port_forward_rules(pf, &net, &self.config.external_zone, public_ip)
                    .into_iter()
                    .filter(|rule| !present.contains(rule))
                    .collect();
            if missing.is_empty() {
                continue;
            }

            warn!(
                port_forward_id = pf.id,
                out_port = pf.out_port,
                missing = missing.len(),
                "Port forward rules missing from firewall, re-adding"
            );
            let mut repaired = true;
            for rule in &missing {
                if let Err(e) = tolerate_exists(self.firewall.add_rule(rule).await) {
                    error!(port_forward_id = pf.id, error = %e, "Failed to re-add firewall rule");
                    repaired = false;
                    break;
                }
                changed = true;
            }
            if repaired {
                report.succeed();
            } else {
                report.fail();
            }
        }

        if changed {
            self.firewall.reload().await?;
        }
        Ok(report)
    }
}

/// The DNAT rule from the uplink and the NAT reflection rule for clients
/// inside the VNet that reach the forward through the public address.
pub fn port_forward_rules(
    pf: &PortForwardRecord,
    net: &NetRecord,
    external_zone: &str,
    public_ip: Ipv4Addr,
) -> [FirewallRule; 2] {
    let destination = format!("{}:{}:{}", net.name, pf.dest_ip, pf.dest_port);
    [
        FirewallRule {
            action: "DNAT".to_string(),
            source: external_zone.to_string(),
            destination: destination.clone(),
            protocol: "tcp,udp".to_string(),
            dest_port: pf.out_port,
            orig_dest: None,
        },
        FirewallRule {
            action: "DNAT".to_string(),
            source: net.name.clone(),
            destination,
            protocol: "tcp,udp".to_string(),
            dest_port: pf.out_port,
            orig_dest: Some(public_ip.to_string()),
        },
    ]
}

fn interface_spec(iface: &GatewayInterfaceRecord) -> std::result::Result<InterfaceSpec, SassoError> {
    let subnet: Ipv4Subnet = iface.subnet.parse()?;
    let parse_addr = |field: &str, raw: &str| {
        raw.parse::<Ipv4Addr>()
            .map_err(|_| SassoError::validation(field, format!("'{raw}' is not an IPv4 address")))
    };
    Ok(InterfaceSpec {
        vnet: iface.vnet.clone(),
        vnet_tag: iface.vnet_tag,
        subnet,
        router_ip: parse_addr("router_ip", &iface.router_ip)?,
        broadcast: parse_addr("broadcast", &iface.broadcast)?,
    })
}

#[async_trait]
impl Reconciler for NetworkReconciler {
    fn name(&self) -> &'static str {
        "network"
    }

    fn metrics(&self) -> Option<&WorkerMetrics> {
        self.metrics.as_ref()
    }

    async fn reconcile(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let metrics = self.metrics.as_ref();

        match timed(metrics, "network", "verify_interfaces", self.verify_interfaces()).await {
            Ok(r) => report.merge(r),
            Err(e) => error!(error = %e, "Gateway interface verification failed"),
        }
        match timed(metrics, "network", "process_tickets", self.process_tickets()).await {
            Ok(r) => report.merge(r),
            Err(e) => error!(error = %e, "Ticket processing failed"),
        }
        match timed(metrics, "network", "process_port_forwards", self.process_port_forwards()).await {
            Ok(r) => report.merge(r),
            Err(e) => error!(error = %e, "Port forward processing failed"),
        }

        Ok(report)
    }
}
