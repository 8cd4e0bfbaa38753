// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tickets: the client-facing handle on an asynchronous request.
//!
//! An API handler wraps a request in a ticket, persists both in one
//! transaction and returns the ticket id. A worker picks the ticket up,
//! executes the request and persists the outcome. Clients poll
//! [`ticket_status`] until the request resolves.
//!
//! Ticket ids are UUIDv7, so ordering by id is ordering by creation time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SassoError};
use crate::request::{Request, RequestContext, RequestKind, RequestStatus};
use crate::store::Store;

/// Time-ordered ticket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(Uuid);

impl TicketId {
    /// A fresh UUIDv7 id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for TicketId {
    type Err = SassoError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| SassoError::InvalidTicketId(s.to_string()))
    }
}

/// A request together with its ticket identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Ticket id.
    pub id: TicketId,
    /// The request the ticket carries.
    pub request: Request,
}

impl Ticket {
    /// Wrap a request in a new ticket. Nothing is persisted yet.
    pub fn new(request: impl Into<Request>) -> Self {
        Self {
            id: TicketId::new(),
            request: request.into(),
        }
    }

    /// Persist the ticket and its request atomically.
    pub async fn persist(&self, store: &dyn Store) -> Result<()> {
        self.request.persist(&self.id, store).await
    }

    /// Execute the carried request.
    pub async fn execute(&mut self, ctx: &RequestContext<'_>) -> Result<()> {
        self.request.execute(&self.id, ctx).await
    }
}

/// Load a ticket and rehydrate its request.
pub async fn get_ticket_by_id(store: &dyn Store, id: &str) -> Result<Ticket> {
    let ticket_id: TicketId = id.parse()?;
    let record = store
        .get_ticket(&ticket_id.to_string())
        .await?
        .ok_or_else(|| SassoError::not_found("ticket", id))?;
    let request = Request::load(store, &record).await?;

    Ok(Ticket {
        id: ticket_id,
        request,
    })
}

/// Persist a new pending ticket for `request` and return its id.
pub async fn submit_ticket(store: &dyn Store, request: impl Into<Request>) -> Result<TicketId> {
    let ticket = Ticket::new(request);
    ticket.persist(store).await?;
    Ok(ticket.id)
}

/// What a client sees when polling a ticket.
#[derive(Debug, Clone, Serialize)]
pub struct TicketStatusView {
    /// Ticket id.
    pub ticket_id: TicketId,
    /// Request kind.
    pub kind: RequestKind,
    /// Request status.
    pub status: RequestStatus,
    /// Result payload once successful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Current status of a ticket.
pub async fn ticket_status(store: &dyn Store, id: &str) -> Result<TicketStatusView> {
    let ticket_id: TicketId = id.parse()?;
    let record = store
        .get_ticket(&ticket_id.to_string())
        .await?
        .ok_or_else(|| SassoError::not_found("ticket", id))?;
    let request = Request::load(store, &record).await?;

    Ok(TicketStatusView {
        ticket_id,
        kind: request.kind(),
        status: request.status(),
        result: request.result(),
        error: request.error().map(str::to_string),
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}
