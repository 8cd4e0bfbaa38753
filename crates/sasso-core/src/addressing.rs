// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! IPv4 subnet arithmetic and the gateway address pool.
//!
//! New networks receive the first free block of `new_subnet_prefix` inside
//! the configured usable range. Blocks handed out recently are remembered
//! for a minute so two allocations racing ahead of their database inserts
//! never receive the same block.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Result, SassoError};

/// How long an allocation stays reserved without being seen in the store.
pub const RESERVATION_TTL: Duration = Duration::from_secs(60);

/// Largest prefix the pool hands out; /31 and /32 leave no room for a router.
pub const MAX_SUBNET_PREFIX: u8 = 30;

/// An IPv4 network in CIDR form with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    /// Build a subnet, clearing any host bits in `addr`.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(SassoError::validation(
                "subnet",
                format!("prefix /{prefix} is out of range"),
            ));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix));
        Ok(Self { network, prefix })
    }

    /// First address of the block.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Last address of the block.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix))
    }

    /// Last usable host address, where the gateway router sits.
    pub fn router_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.broadcast()).saturating_sub(1))
    }

    /// Whether `ip` lies inside the block.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix) == u32::from(self.network)
    }

    /// Whether the two blocks share at least one address.
    pub fn overlaps(&self, other: &Ipv4Subnet) -> bool {
        self.contains(other.network) || other.contains(self.network)
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = SassoError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || SassoError::validation("subnet", format!("'{s}' is not an IPv4 CIDR"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix)
    }
}

/// Parse an address that may carry a `/prefix` suffix (`10.0.0.5/24`).
pub fn parse_host_address(s: &str) -> Result<Ipv4Addr> {
    let host = s.split_once('/').map_or(s, |(host, _)| host);
    host.trim()
        .parse()
        .map_err(|_| SassoError::validation("address", format!("'{s}' is not an IPv4 address")))
}

fn mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

struct Reservations {
    subnets: HashSet<Ipv4Subnet>,
    last_modified: Instant,
}

/// Allocator for per-network subnets inside a usable range.
pub struct AddressPool {
    usable: Ipv4Subnet,
    new_subnet_prefix: u8,
    reservations: Mutex<Reservations>,
}

impl AddressPool {
    /// Create a pool carving `/new_subnet_prefix` blocks out of `usable`.
    pub fn new(usable: Ipv4Subnet, new_subnet_prefix: u8) -> Result<Self> {
        if new_subnet_prefix > MAX_SUBNET_PREFIX {
            return Err(SassoError::validation(
                "new_subnet_prefix",
                format!("must be at most /{MAX_SUBNET_PREFIX}"),
            ));
        }
        if new_subnet_prefix < usable.prefix() {
            return Err(SassoError::validation(
                "new_subnet_prefix",
                format!("/{new_subnet_prefix} is larger than the usable range {usable}"),
            ));
        }
        Ok(Self {
            usable,
            new_subnet_prefix,
            reservations: Mutex::new(Reservations {
                subnets: HashSet::new(),
                last_modified: Instant::now(),
            }),
        })
    }

    /// Usable range the pool allocates from.
    pub fn usable(&self) -> Ipv4Subnet {
        self.usable
    }

    /// Prefix of the allocated blocks.
    pub fn new_subnet_prefix(&self) -> u8 {
        self.new_subnet_prefix
    }

    /// Return the first block that overlaps neither `used` nor a recent
    /// reservation, and reserve it.
    pub fn next_available(&self, used: &[Ipv4Subnet]) -> Result<Ipv4Subnet> {
        let mut reservations = self
            .reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if reservations.last_modified.elapsed() > RESERVATION_TTL {
            reservations.subnets.clear();
        }

        let step = 1u64 << (32 - u32::from(self.new_subnet_prefix));
        let start = u64::from(u32::from(self.usable.network()));
        let end = start + self.usable.size();

        let mut cursor = start;
        while cursor < end {
            // cursor < 2^32 inside the loop
            let candidate = Ipv4Subnet::new(Ipv4Addr::from(cursor as u32), self.new_subnet_prefix)?;
            cursor += step;

            if used.iter().any(|u| u.overlaps(&candidate)) {
                continue;
            }
            if reservations.subnets.iter().any(|r| r.overlaps(&candidate)) {
                continue;
            }

            reservations.subnets.insert(candidate);
            reservations.last_modified = Instant::now();
            return Ok(candidate);
        }

        Err(SassoError::AddressPoolExhausted)
    }

    /// Drop a reservation whose allocation was abandoned.
    pub fn release(&self, subnet: &Ipv4Subnet) {
        let mut reservations = self
            .reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        reservations.subnets.remove(subnet);
    }
}
