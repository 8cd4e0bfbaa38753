// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request variants carried by tickets.
//!
//! A request is a persisted command: it knows its kind tag, how to execute
//! itself against the backend capabilities, and how to write itself back to
//! the store together with its ticket.
//!
//! | Kind | Tag | Table |
//! |------|-----|-------|
//! | [`NewNetworkRequest`] | `new-network` | `new_network_requests` |
//! | [`DeleteNetworkRequest`] | `delete-network` | `delete_network_requests` |
//!
//! Adding a kind means adding a variant to [`RequestKind`] and [`Request`],
//! a loader arm in [`Request::load`] and a table.
//!
//! Execution must be safe to repeat. A retryable failure (unreachable
//! backend, transient database error) leaves the request pending so the
//! worker runs it again; any other failure resolves it as failed.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::addressing::{AddressPool, Ipv4Subnet};
use crate::backend::{
    Firewall, Gateway, InterfaceSpec, Policy, tolerate_exists, tolerate_missing,
};
use crate::error::{Result, SassoError};
use crate::store::{
    DeleteNetworkRecord, GatewayInterfaceRecord, NewGatewayInterface, NewNetworkRecord,
    ParseStatusError, RequestRecord, Store, TicketRecord,
};
use crate::ticket::TicketId;

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Waiting for (another) execution.
    Pending,
    /// Executed successfully. Terminal.
    Success,
    /// Failed permanently. Terminal.
    Failed,
}

impl RequestStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Whether the request is resolved.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for RequestStatus {
    type Error = ParseStatusError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseStatusError(s)),
        }
    }
}

/// Discriminant of a [`Request`], persisted as its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    /// Create the gateway interface for a VNet.
    NewNetwork,
    /// Remove the gateway interface of a VNet.
    DeleteNetwork,
}

impl RequestKind {
    /// Every registered kind.
    pub const ALL: [RequestKind; 2] = [Self::NewNetwork, Self::DeleteNetwork];

    /// Persisted tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewNetwork => "new-network",
            Self::DeleteNetwork => "delete-network",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = SassoError;

    fn from_str(tag: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == tag)
            .ok_or_else(|| SassoError::UnknownRequestKind(tag.to_string()))
    }
}

/// Backend capabilities and shared state a request executes against.
pub struct RequestContext<'a> {
    /// Resource store.
    pub store: &'a dyn Store,
    /// Router host.
    pub gateway: &'a dyn Gateway,
    /// Router firewall.
    pub firewall: &'a dyn Firewall,
    /// Subnet allocator.
    pub pool: &'a AddressPool,
    /// Firewall zone of the uplink; VNets get an ACCEPT policy towards it.
    pub external_zone: &'a str,
}

/// Create a gateway interface for a VNet and allocate its subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNetworkRequest {
    /// VNet name.
    pub vnet: String,
    /// VNet tag.
    pub vnet_tag: u32,
    /// Lifecycle status.
    pub status: RequestStatus,
    /// Last failure.
    pub error: Option<String>,
    /// Allocated subnet, set on success.
    pub subnet: Option<Ipv4Subnet>,
    /// Router address, set on success.
    pub router_ip: Option<Ipv4Addr>,
    /// Broadcast address, set on success.
    pub broadcast: Option<Ipv4Addr>,
}

impl NewNetworkRequest {
    /// A pending request.
    pub fn new(vnet: impl Into<String>, vnet_tag: u32) -> Self {
        Self {
            vnet: vnet.into(),
            vnet_tag,
            status: RequestStatus::Pending,
            error: None,
            subnet: None,
            router_ip: None,
            broadcast: None,
        }
    }

    async fn execute(&mut self, ticket_id: &TicketId, ctx: &RequestContext<'_>) -> Result<()> {
        let iface = match ctx.store.get_gateway_interface_by_vnet(&self.vnet).await? {
            // A previous run of this ticket got as far as recording the interface
            Some(existing) if existing.ticket_id == Some(ticket_id.to_string()) => {
                info!(
                    ticket_id = %ticket_id,
                    vnet = %self.vnet,
                    "Resuming network creation from recorded interface"
                );
                existing
            }
            Some(existing) => {
                return Err(SassoError::Conflict(format!(
                    "vnet '{}' already has gateway interface '{}'",
                    existing.vnet, existing.local_id
                )));
            }
            None => self.create_interface(ticket_id, ctx).await?,
        };

        let zone = iface.vnet.as_str();
        tolerate_exists(ctx.firewall.add_zone(zone).await)?;
        tolerate_exists(
            ctx.firewall
                .add_interface(&iface.firewall_interface, zone)
                .await,
        )?;
        tolerate_exists(ctx.firewall.add_policy(&vnet_policy(zone, ctx.external_zone)).await)?;
        ctx.firewall.reload().await?;

        self.subnet = Some(iface.subnet.parse()?);
        self.router_ip = Some(parse_addr("router_ip", &iface.router_ip)?);
        self.broadcast = Some(parse_addr("broadcast", &iface.broadcast)?);
        Ok(())
    }

    async fn create_interface(
        &self,
        ticket_id: &TicketId,
        ctx: &RequestContext<'_>,
    ) -> Result<GatewayInterfaceRecord> {
        if let Some(existing) = ctx.store.get_gateway_interface_by_tag(self.vnet_tag).await? {
            return Err(SassoError::Conflict(format!(
                "tag {} is already used by vnet '{}'",
                self.vnet_tag, existing.vnet
            )));
        }

        let interfaces = ctx.store.list_gateway_interfaces().await?;
        let used: Vec<Ipv4Subnet> = interfaces
            .iter()
            .filter_map(|i| match i.subnet.parse() {
                Ok(subnet) => Some(subnet),
                Err(e) => {
                    warn!(vnet = %i.vnet, subnet = %i.subnet, error = %e, "Ignoring unparsable subnet");
                    None
                }
            })
            .collect();

        let subnet = ctx.pool.next_available(&used)?;
        let spec = InterfaceSpec {
            vnet: self.vnet.clone(),
            vnet_tag: self.vnet_tag,
            subnet,
            router_ip: subnet.router_address(),
            broadcast: subnet.broadcast(),
        };

        let provisioned = match ctx.gateway.new_interface(&spec).await {
            Ok(p) => p,
            Err(e) => {
                ctx.pool.release(&subnet);
                return Err(e.into());
            }
        };

        let new = NewGatewayInterface {
            ticket_id: Some(ticket_id.to_string()),
            local_id: provisioned.local_id.clone(),
            vnet: spec.vnet.clone(),
            vnet_tag: spec.vnet_tag,
            subnet: subnet.to_string(),
            router_ip: spec.router_ip.to_string(),
            broadcast: spec.broadcast.to_string(),
            firewall_interface: provisioned.firewall_interface.clone(),
        };

        let id = match ctx.store.insert_gateway_interface(&new).await {
            Ok(id) => id,
            Err(e) => {
                // Undo the backend side so the next run starts clean
                if let Err(undo) = ctx.gateway.remove_interface(&provisioned.local_id).await {
                    warn!(
                        local_id = %provisioned.local_id,
                        error = %undo,
                        "Failed to remove unrecorded gateway interface"
                    );
                }
                ctx.pool.release(&subnet);
                return Err(e);
            }
        };

        info!(
            ticket_id = %ticket_id,
            vnet = %self.vnet,
            tag = self.vnet_tag,
            subnet = %subnet,
            gateway = ctx.gateway.gateway_type(),
            "Gateway interface created"
        );

        Ok(GatewayInterfaceRecord {
            id,
            ticket_id: new.ticket_id,
            local_id: new.local_id,
            vnet: new.vnet,
            vnet_tag: new.vnet_tag,
            subnet: new.subnet,
            router_ip: new.router_ip,
            broadcast: new.broadcast,
            firewall_interface: new.firewall_interface,
        })
    }

    fn to_record(&self, ticket_id: &TicketId) -> NewNetworkRecord {
        NewNetworkRecord {
            ticket_id: ticket_id.to_string(),
            vnet: self.vnet.clone(),
            vnet_tag: self.vnet_tag,
            status: self.status,
            error: self.error.clone(),
            subnet: self.subnet.map(|s| s.to_string()),
            router_ip: self.router_ip.map(|a| a.to_string()),
            broadcast: self.broadcast.map(|a| a.to_string()),
        }
    }

    fn from_record(record: NewNetworkRecord) -> Result<Self> {
        Ok(Self {
            vnet: record.vnet,
            vnet_tag: record.vnet_tag,
            status: record.status,
            error: record.error,
            subnet: record.subnet.as_deref().map(str::parse).transpose()?,
            router_ip: record
                .router_ip
                .as_deref()
                .map(|a| parse_addr("router_ip", a))
                .transpose()?,
            broadcast: record
                .broadcast
                .as_deref()
                .map(|a| parse_addr("broadcast", a))
                .transpose()?,
        })
    }
}

/// Remove the gateway interface of a VNet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteNetworkRequest {
    /// VNet name.
    pub vnet: String,
    /// Lifecycle status.
    pub status: RequestStatus,
    /// Last failure.
    pub error: Option<String>,
}

impl DeleteNetworkRequest {
    /// A pending request.
    pub fn new(vnet: impl Into<String>) -> Self {
        Self {
            vnet: vnet.into(),
            status: RequestStatus::Pending,
            error: None,
        }
    }

    async fn execute(&mut self, ticket_id: &TicketId, ctx: &RequestContext<'_>) -> Result<()> {
        let Some(iface) = ctx.store.get_gateway_interface_by_vnet(&self.vnet).await? else {
            info!(ticket_id = %ticket_id, vnet = %self.vnet, "Gateway interface already gone");
            return Ok(());
        };

        let zone = iface.vnet.as_str();
        tolerate_missing(
            ctx.firewall
                .remove_policy(&vnet_policy(zone, ctx.external_zone))
                .await,
        )?;
        tolerate_missing(ctx.firewall.remove_interface(&iface.firewall_interface).await)?;
        tolerate_missing(ctx.firewall.remove_zone(zone).await)?;
        ctx.firewall.reload().await?;

        ctx.gateway.remove_interface(&iface.local_id).await?;
        ctx.store.delete_gateway_interface(iface.id).await?;

        info!(
            ticket_id = %ticket_id,
            vnet = %self.vnet,
            local_id = %iface.local_id,
            "Gateway interface removed"
        );
        Ok(())
    }

    fn to_record(&self, ticket_id: &TicketId) -> DeleteNetworkRecord {
        DeleteNetworkRecord {
            ticket_id: ticket_id.to_string(),
            vnet: self.vnet.clone(),
            status: self.status,
            error: self.error.clone(),
        }
    }
}

fn vnet_policy(zone: &str, external_zone: &str) -> Policy {
    Policy {
        source: zone.to_string(),
        destination: external_zone.to_string(),
        action: "ACCEPT".to_string(),
    }
}

fn parse_addr(field: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| SassoError::validation(field, format!("'{value}' is not an IPv4 address")))
}

/// A persisted command of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `new-network`.
    NewNetwork(NewNetworkRequest),
    /// `delete-network`.
    DeleteNetwork(DeleteNetworkRequest),
}

impl Request {
    /// Kind tag.
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::NewNetwork(_) => RequestKind::NewNetwork,
            Self::DeleteNetwork(_) => RequestKind::DeleteNetwork,
        }
    }

    /// Lifecycle status.
    pub fn status(&self) -> RequestStatus {
        match self {
            Self::NewNetwork(r) => r.status,
            Self::DeleteNetwork(r) => r.status,
        }
    }

    /// Last failure message.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::NewNetwork(r) => r.error.as_deref(),
            Self::DeleteNetwork(r) => r.error.as_deref(),
        }
    }

    /// VNet the request is about, used as its guard key.
    pub fn vnet(&self) -> &str {
        match self {
            Self::NewNetwork(r) => &r.vnet,
            Self::DeleteNetwork(r) => &r.vnet,
        }
    }

    /// Result payload for a resolved request.
    pub fn result(&self) -> Option<serde_json::Value> {
        match self {
            Self::NewNetwork(r) if r.status == RequestStatus::Success => Some(serde_json::json!({
                "vnet": r.vnet,
                "vnet_tag": r.vnet_tag,
                "subnet": r.subnet.map(|s| s.to_string()),
                "router_ip": r.router_ip.map(|a| a.to_string()),
                "broadcast": r.broadcast.map(|a| a.to_string()),
            })),
            Self::DeleteNetwork(r) if r.status == RequestStatus::Success => {
                Some(serde_json::json!({ "vnet": r.vnet }))
            }
            _ => None,
        }
    }

    /// Perform the side effect.
    ///
    /// On success the status becomes `success` and derived fields are
    /// filled. On failure the error message is recorded; the status becomes
    /// `failed` unless the error is retryable.
    pub async fn execute(&mut self, ticket_id: &TicketId, ctx: &RequestContext<'_>) -> Result<()> {
        let result = match self {
            Self::NewNetwork(r) => r.execute(ticket_id, ctx).await,
            Self::DeleteNetwork(r) => r.execute(ticket_id, ctx).await,
        };

        let (status, error) = match &result {
            Ok(()) => (RequestStatus::Success, None),
            Err(e) if e.is_retryable() => (RequestStatus::Pending, Some(e.to_string())),
            Err(e) => (RequestStatus::Failed, Some(e.to_string())),
        };
        self.set_outcome(status, error);
        result
    }

    fn set_outcome(&mut self, status: RequestStatus, error: Option<String>) {
        match self {
            Self::NewNetwork(r) => {
                r.status = status;
                r.error = error;
            }
            Self::DeleteNetwork(r) => {
                r.status = status;
                r.error = error;
            }
        }
    }

    /// Store row for this request.
    pub fn to_record(&self, ticket_id: &TicketId) -> RequestRecord {
        match self {
            Self::NewNetwork(r) => RequestRecord::NewNetwork(r.to_record(ticket_id)),
            Self::DeleteNetwork(r) => RequestRecord::DeleteNetwork(r.to_record(ticket_id)),
        }
    }

    /// Write the request and its ticket in one transaction.
    pub async fn persist(&self, ticket_id: &TicketId, store: &dyn Store) -> Result<()> {
        let now = Utc::now();
        let ticket = TicketRecord {
            id: ticket_id.to_string(),
            request_type: self.kind().as_str().to_string(),
            status: self.status(),
            // Only used on first insert
            created_at: now,
            updated_at: now,
        };
        store.save_ticket(&ticket, &self.to_record(ticket_id)).await
    }

    /// Rehydrate the request a ticket refers to.
    ///
    /// Fails with [`SassoError::UnknownRequestKind`] for unregistered tags
    /// and [`SassoError::NotFound`] if the request row is missing.
    pub async fn load(store: &dyn Store, ticket: &TicketRecord) -> Result<Self> {
        let kind: RequestKind = ticket.request_type.parse()?;
        let missing = || SassoError::not_found("request", &ticket.id);

        match kind {
            RequestKind::NewNetwork => {
                let record = store
                    .get_new_network_request(&ticket.id)
                    .await?
                    .ok_or_else(missing)?;
                Ok(Self::NewNetwork(NewNetworkRequest::from_record(record)?))
            }
            RequestKind::DeleteNetwork => {
                let record = store
                    .get_delete_network_request(&ticket.id)
                    .await?
                    .ok_or_else(missing)?;
                Ok(Self::DeleteNetwork(DeleteNetworkRequest {
                    vnet: record.vnet,
                    status: record.status,
                    error: record.error,
                }))
            }
        }
    }
}

impl From<NewNetworkRequest> for Request {
    fn from(r: NewNetworkRequest) -> Self {
        Self::NewNetwork(r)
    }
}

impl From<DeleteNetworkRequest> for Request {
    fn from(r: DeleteNetworkRequest) -> Self {
        Self::DeleteNetwork(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(RequestKind::NewNetwork.as_str(), "new-network");
        assert_eq!(RequestKind::DeleteNetwork.as_str(), "delete-network");
        for kind in RequestKind::ALL {
            assert_eq!(kind.as_str().parse::<RequestKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_tag_is_distinct_error() {
        let err = "resize-network".parse::<RequestKind>().unwrap_err();
        assert!(matches!(err, SassoError::UnknownRequestKind(tag) if tag == "resize-network"));
    }

    #[test]
    fn test_request_kind_matches_variant() {
        let r: Request = NewNetworkRequest::new("alpha", 100).into();
        assert_eq!(r.kind(), RequestKind::NewNetwork);
        assert_eq!(r.vnet(), "alpha");
        assert_eq!(r.status(), RequestStatus::Pending);
        assert!(r.result().is_none());

        let r: Request = DeleteNetworkRequest::new("alpha").into();
        assert_eq!(r.kind(), RequestKind::DeleteNetwork);
    }

    #[test]
    fn test_new_network_record_conversion() {
        let ticket_id = TicketId::new();
        let mut req = NewNetworkRequest::new("alpha", 100);
        req.status = RequestStatus::Success;
        req.subnet = Some("10.0.0.0/24".parse().unwrap());
        req.router_ip = Some(Ipv4Addr::new(10, 0, 0, 254));
        req.broadcast = Some(Ipv4Addr::new(10, 0, 0, 255));

        let record = req.to_record(&ticket_id);
        assert_eq!(record.subnet.as_deref(), Some("10.0.0.0/24"));
        assert_eq!(record.router_ip.as_deref(), Some("10.0.0.254"));

        let back = NewNetworkRequest::from_record(record).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(RequestStatus::Success.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
    }
}
