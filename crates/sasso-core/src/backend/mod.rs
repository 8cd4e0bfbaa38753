// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend capabilities - gateway, firewall, DNS, hypervisor and notification channels.

pub mod memory;
mod traits;

pub use memory::{
    MemoryDns, MemoryEmail, MemoryFirewall, MemoryGateway, MemoryHypervisor, MemoryTelegram,
};
pub use traits::*;
