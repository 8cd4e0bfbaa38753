// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keyed mutual exclusion for check-then-act sequences.
//!
//! API handlers and workers that read a resource, decide, and then write it
//! back hold the guard for that resource across the whole sequence. Each key
//! maps to exactly one lock handle, created on first use and kept for the
//! life of the process. The table only grows; one entry per network, VM or
//! user ever touched is a small, bounded cost.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Class of resource a guard protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// A virtual network (VNet / gateway interface and its port forwards).
    Network,
    /// A virtual machine and its interfaces.
    Vm,
    /// A user account.
    User,
}

impl ResourceClass {
    /// Short name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Vm => "vm",
            Self::User => "user",
        }
    }
}

/// Identity of a guarded resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuardKey {
    class: ResourceClass,
    id: String,
}

impl GuardKey {
    /// Build a key from a class and an identifier.
    pub fn new(class: ResourceClass, id: impl ToString) -> Self {
        Self {
            class,
            id: id.to_string(),
        }
    }

    /// Key for a network.
    ///
    /// Networks are keyed by VNet name only. Callers holding a net or port
    /// forward id resolve the name first.
    pub fn network(vnet: &str) -> Self {
        Self::new(ResourceClass::Network, vnet)
    }

    /// Key for a virtual machine.
    pub fn vm(id: impl ToString) -> Self {
        Self::new(ResourceClass::Vm, id)
    }

    /// Key for a user.
    pub fn user(id: impl ToString) -> Self {
        Self::new(ResourceClass::User, id)
    }

    /// Resource class.
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    /// Resource identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for GuardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class.as_str(), self.id)
    }
}

/// Process-wide table of per-resource locks.
///
/// Share it as `Arc<GuardTable>` between API handlers and workers.
#[derive(Default)]
pub struct GuardTable {
    locks: DashMap<GuardKey, Arc<Mutex<()>>>,
}

impl GuardTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock handle for `key`, created on first request.
    ///
    /// Concurrent first requests for the same key observe the same handle.
    pub fn handle(&self, key: &GuardKey) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(key) {
            return existing.clone();
        }
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn acquire(&self, key: &GuardKey) -> OwnedMutexGuard<()> {
        self.handle(key).lock_owned().await
    }

    /// Take the guard for `key` only if nobody holds it.
    pub fn try_acquire(&self, key: &GuardKey) -> Option<OwnedMutexGuard<()>> {
        self.handle(key).try_lock_owned().ok()
    }

    /// Number of keys ever guarded.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key has been guarded yet.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_same_key_same_handle() {
        let table = GuardTable::new();
        let a = table.handle(&GuardKey::network("alpha"));
        let b = table.handle(&GuardKey::network(&String::from("alpha")));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);

        let other = table.handle(&GuardKey::network("beta"));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_classes_are_separate_keys() {
        let table = GuardTable::new();
        let net = table.handle(&GuardKey::network("1"));
        let vm = table.handle(&GuardKey::vm(1));
        assert!(!Arc::ptr_eq(&net, &vm));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(GuardKey::vm(7).to_string(), "vm:7");
        assert_eq!(GuardKey::network("alpha").to_string(), "network:alpha");
    }

    #[tokio::test]
    async fn test_concurrent_first_use_yields_one_handle() {
        let table = Arc::new(GuardTable::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let table = table.clone();
            tasks.push(tokio::spawn(
                async move { table.handle(&GuardKey::user(9)) },
            ));
        }

        let handles: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.expect("task panicked"))
            .collect();

        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let table = Arc::new(GuardTable::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = table.acquire(&GuardKey::network("alpha")).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let table = GuardTable::new();
        let _a = table.acquire(&GuardKey::network("alpha")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            table.acquire(&GuardKey::network("beta")),
        )
        .await;
        assert!(b.is_ok(), "unrelated key must not block");
    }

    #[tokio::test]
    async fn test_try_acquire_reports_contention() {
        let table = GuardTable::new();
        let held = table.acquire(&GuardKey::vm(3)).await;
        assert!(table.try_acquire(&GuardKey::vm(3)).is_none());
        drop(held);
        assert!(table.try_acquire(&GuardKey::vm(3)).is_some());
    }

    #[tokio::test]
    async fn test_table_never_shrinks() {
        let table = GuardTable::new();
        for id in 0..10 {
            let _g = table.acquire(&GuardKey::vm(id)).await;
        }
        assert_eq!(table.len(), 10);
    }
}
