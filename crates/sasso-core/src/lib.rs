// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sasso Core - tickets, requests and the resource store
//!
//! Shared building blocks of the sasso control plane. API services use this
//! crate to submit tickets and to run guarded check-then-act operations; the
//! reconciler uses it to find pending work and execute it against backends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   submit_ticket / ticket_status   ┌──────────────────────┐
//! │     API handlers     │──────────────────────────────────►│        Store         │
//! │   (external crate)   │◄──────── GuardTable ─────────────►│  (SQLite/PostgreSQL) │
//! └──────────────────────┘                                    └──────────────────────┘
//!                                                                        ▲
//!                                                                        │ poll / persist
//!                                                             ┌──────────────────────┐
//!                                                             │   sasso-reconciler   │
//!                                                             │       workers        │
//!                                                             └──────────────────────┘
//!                                                                        │ execute
//!                                                                        ▼
//!                        Gateway · Firewall · DnsManager · Hypervisor · Email · Telegram
//! ```
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`ticket`] | Ticket ids (UUIDv7), submission and status polling |
//! | [`request`] | `new-network` / `delete-network` requests and their execution |
//! | [`store`] | [`store::Store`] trait, SQLite and PostgreSQL implementations |
//! | [`guard`] | Per-resource mutual exclusion |
//! | [`limiter`] | Token bucket |
//! | [`addressing`] | Subnet arithmetic and the gateway address pool |
//! | [`backend`] | Capability traits and in-memory drivers |

/// Subnet arithmetic and the gateway address pool.
pub mod addressing;

/// Backend capability traits and in-memory drivers.
pub mod backend;

/// Error types.
pub mod error;

/// Keyed concurrency guard.
pub mod guard;

/// Token bucket rate limiter.
pub mod limiter;

/// Embedded database migrations.
pub mod migrations;

/// Request variants.
pub mod request;

/// Resource store.
pub mod store;

/// Tickets.
pub mod ticket;

pub use error::{Result, SassoError};
pub use guard::{GuardKey, GuardTable};
pub use request::{Request, RequestContext, RequestKind, RequestStatus};
pub use store::{ResourceStatus, Store};
pub use ticket::{Ticket, TicketId, get_ticket_by_id, submit_ticket, ticket_status};
