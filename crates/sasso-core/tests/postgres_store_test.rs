// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store tests.
//!
//! These tests need a running PostgreSQL database. Set
//! TEST_SASSO_DATABASE_URL to run them; otherwise they are skipped. Rows use
//! random names so the tests can share a database.

use sasso_core::request::NewNetworkRequest;
use sasso_core::store::postgres::PostgresStore;
use sasso_core::store::{
    BackupRequestKind, BackupRequestStatus, NewBackupRequest, NewGatewayInterface, NewNet,
    NewNotification, NewPortForward, NewUser, NewVm, NewVmInterface, NotificationStatus,
};
use sasso_core::{RequestStatus, ResourceStatus, SassoError, Store, submit_ticket, ticket_status};
use uuid::Uuid;

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_SASSO_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_SASSO_DATABASE_URL not set");
            return;
        }
    };
}

async fn test_store() -> PostgresStore {
    let url = std::env::var("TEST_SASSO_DATABASE_URL").expect("TEST_SASSO_DATABASE_URL");
    PostgresStore::connect(&url)
        .await
        .expect("Failed to connect to test database")
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

fn random_u16() -> u16 {
    let bytes = Uuid::new_v4().into_bytes();
    u16::from_be_bytes([bytes[0], bytes[1]]).max(1024)
}

async fn seed_user(store: &PostgresStore) -> i64 {
    let username = unique("user");
    store
        .insert_user(&NewUser {
            email: format!("{username}@example.com"),
            username,
            vpn_address: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_ticket_round_trip() {
    skip_if_no_db!();
    let store = test_store().await;

    let id = submit_ticket(&store, NewNetworkRequest::new(unique("vnet"), 4000))
        .await
        .unwrap();

    let status = ticket_status(&store, &id.to_string()).await.unwrap();
    assert_eq!(status.status, RequestStatus::Pending);
    assert!(status.result.is_none());

    let pending = store.list_pending_tickets(10_000).await.unwrap();
    assert!(pending.iter().any(|t| t.id == id.to_string()));
}

#[tokio::test]
async fn test_gateway_interface_tag_is_unique() {
    skip_if_no_db!();
    let store = test_store().await;

    let tag = u32::from(random_u16()) + 100_000;
    let octet = |n: u16| (n % 250) as u8;
    let (a, b) = (random_u16(), random_u16());
    let iface = |vnet: String, subnet: String, router: String| NewGatewayInterface {
        ticket_id: None,
        local_id: format!("vxlan{tag}"),
        vnet,
        vnet_tag: tag,
        subnet,
        router_ip: router,
        broadcast: String::new(),
        firewall_interface: format!("vxlan{tag}"),
    };

    store
        .insert_gateway_interface(&iface(
            unique("vnet"),
            format!("172.{}.{}.0/24", octet(a), octet(b)),
            format!("172.{}.{}.254", octet(a), octet(b)),
        ))
        .await
        .unwrap();

    let err = store
        .insert_gateway_interface(&iface(
            unique("vnet"),
            format!("172.{}.{}.0/24", octet(b), octet(a)),
            format!("172.{}.{}.254", octet(b), octet(a)),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SassoError::Conflict(_)));
}

#[tokio::test]
async fn test_net_deletion_marks_port_forwards() {
    skip_if_no_db!();
    let store = test_store().await;
    let owner = seed_user(&store).await;

    let net = store
        .insert_net(&NewNet {
            owner_id: owner,
            name: unique("net"),
            tag: u32::from(random_u16()) + 200_000,
            subnet: "10.200.0.0/24".to_string(),
            gateway: "10.200.0.254".to_string(),
            broadcast: "10.200.0.255".to_string(),
            group_name: None,
            vlan_aware: false,
            status: ResourceStatus::Ready,
        })
        .await
        .unwrap();
    let pf = store
        .insert_port_forward(&NewPortForward {
            net_id: net,
            owner_id: owner,
            out_port: random_u16(),
            dest_port: 22,
            dest_ip: "10.200.0.5".to_string(),
            status: ResourceStatus::Ready,
        })
        .await
        .unwrap();

    store.mark_net_for_deletion(net).await.unwrap();

    assert_eq!(
        store.get_net(net).await.unwrap().unwrap().status,
        ResourceStatus::PreDeleting
    );
    assert_eq!(
        store.get_port_forward(pf).await.unwrap().unwrap().status,
        ResourceStatus::PreDeleting
    );
}

#[tokio::test]
async fn test_notification_marked_sent_leaves_pending_list() {
    skip_if_no_db!();
    let store = test_store().await;
    let owner = seed_user(&store).await;

    let id = store
        .insert_notification(&NewNotification::to_user(owner, "VM ready", "web is up"))
        .await
        .unwrap();
    assert!(
        store
            .list_pending_notifications()
            .await
            .unwrap()
            .iter()
            .any(|n| n.id == id)
    );

    store.mark_notification_sent(id).await.unwrap();

    let stored = store.get_notification(id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Sent);
    assert!(
        !store
            .list_pending_notifications()
            .await
            .unwrap()
            .iter()
            .any(|n| n.id == id)
    );
}

#[tokio::test]
async fn test_net_with_interfaces_is_restricted() {
    skip_if_no_db!();
    let store = test_store().await;
    let owner = seed_user(&store).await;

    let net = store
        .insert_net(&NewNet {
            owner_id: owner,
            name: unique("net"),
            tag: u32::from(random_u16()) + 300_000,
            subnet: "10.201.0.0/24".to_string(),
            gateway: "10.201.0.254".to_string(),
            broadcast: "10.201.0.255".to_string(),
            group_name: None,
            vlan_aware: false,
            status: ResourceStatus::PreDeleting,
        })
        .await
        .unwrap();
    let vm = store
        .insert_vm(&NewVm {
            owner_id: owner,
            name: unique("vm"),
            cores: 1,
            ram_mb: 512,
            disk_gb: 8,
            status: ResourceStatus::Ready,
        })
        .await
        .unwrap();
    let iface = store
        .insert_vm_interface(&NewVmInterface {
            vm_id: vm,
            net_id: net,
            address: "10.201.0.5/24".to_string(),
            gateway: None,
            status: ResourceStatus::Ready,
        })
        .await
        .unwrap();

    let err = store.delete_net(net).await.unwrap_err();
    assert!(matches!(err, SassoError::Conflict(_)));
    assert_eq!(store.list_vm_interfaces_for_net(net).await.unwrap().len(), 1);

    store.delete_vm_interface(iface).await.unwrap();
    store.delete_net(net).await.unwrap();
}

#[tokio::test]
async fn test_backup_request_completes() {
    skip_if_no_db!();
    let store = test_store().await;
    let vm_id = i64::from(random_u16()) + 1_000_000;

    let id = store
        .insert_backup_request(&NewBackupRequest {
            kind: BackupRequestKind::Create,
            vm_id,
            owner_id: 1,
            name: "nightly".to_string(),
            notes: String::new(),
            volid: None,
        })
        .await
        .unwrap();
    assert!(store.has_pending_backup_request(vm_id).await.unwrap());

    store
        .finish_backup_request(id, BackupRequestStatus::Completed, Some("backup:vzdump-1"), None)
        .await
        .unwrap();

    let stored = store.get_backup_request(id).await.unwrap().unwrap();
    assert_eq!(stored.status, BackupRequestStatus::Completed);
    assert_eq!(stored.volid.as_deref(), Some("backup:vzdump-1"));
    assert!(!store.has_pending_backup_request(vm_id).await.unwrap());
}
