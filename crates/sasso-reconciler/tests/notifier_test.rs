// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for notification dispatch.

mod common;

use common::TestContext;
use sasso_core::limiter::TokenBucket;
use sasso_core::store::{NewNotification, NotificationStatus};
use sasso_reconciler::notifier::NotifierConfig;

fn unlimited() -> NotifierConfig {
    NotifierConfig {
        rate_limits: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_user_notification_goes_to_both_channels() {
    let ctx = TestContext::new().await;
    let mut notifier = ctx.notifier(&unlimited());
    let alice = ctx.create_user("alice", None).await;
    ctx.create_telegram_bot(alice, "1001").await;

    let id = ctx
        .store
        .insert_notification(&NewNotification::to_user(alice, "VM ready", "web is up"))
        .await
        .unwrap();

    let report = notifier.dispatch().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let emails = ctx.email.sent();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].to, "alice@example.com");
    assert_eq!(emails[0].subject, "VM ready");
    assert_eq!(emails[0].body, "web is up");

    assert_eq!(
        ctx.telegram.sent(),
        vec![("1001".to_string(), "VM ready\n\nweb is up".to_string())]
    );

    let stored = ctx.store.get_notification(id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Sent);
}

#[tokio::test]
async fn test_broadcast_reaches_every_user() {
    let ctx = TestContext::new().await;
    let mut notifier = ctx.notifier(&unlimited());
    let alice = ctx.create_user("alice", None).await;
    let bob = ctx.create_user("bob", None).await;
    ctx.create_telegram_bot(alice, "1001").await;
    ctx.create_telegram_bot(bob, "1002").await;

    ctx.store
        .insert_notification(&NewNotification {
            user_id: None,
            subject: "Maintenance".to_string(),
            body: "Tonight at 22:00".to_string(),
            email: true,
            telegram: true,
        })
        .await
        .unwrap();

    notifier.dispatch().await.unwrap();

    let mut recipients: Vec<String> = ctx.email.sent().into_iter().map(|m| m.to).collect();
    recipients.sort();
    assert_eq!(recipients, vec!["alice@example.com", "bob@example.com"]);
    assert_eq!(ctx.telegram.sent().len(), 2);
}

#[tokio::test]
async fn test_only_requested_channels_are_used() {
    let ctx = TestContext::new().await;
    let mut notifier = ctx.notifier(&unlimited());
    let alice = ctx.create_user("alice", None).await;
    ctx.create_telegram_bot(alice, "1001").await;

    ctx.store
        .insert_notification(&NewNotification {
            email: false,
            ..NewNotification::to_user(alice, "Port forward ready", "8080 -> 10.0.0.5:80")
        })
        .await
        .unwrap();

    notifier.dispatch().await.unwrap();
    assert!(ctx.email.sent().is_empty());
    assert_eq!(ctx.telegram.sent().len(), 1);
}

#[tokio::test]
async fn test_failed_delivery_is_not_retried() {
    let ctx = TestContext::new().await;
    let mut notifier = ctx.notifier(&unlimited());
    let alice = ctx.create_user("alice", None).await;

    let id = ctx
        .store
        .insert_notification(&NewNotification::to_user(alice, "VM ready", "web is up"))
        .await
        .unwrap();

    ctx.email.faults.fail_always("send");
    let report = notifier.dispatch().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(ctx.email.sent().is_empty());

    let stored = ctx.store.get_notification(id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Sent);

    // The next cycle has nothing left to send
    ctx.email.faults.clear();
    assert!(notifier.dispatch().await.unwrap().is_empty());
    assert_eq!(ctx.email.faults.call_count("send"), 1);
}

#[tokio::test]
async fn test_rate_limit_defers_the_rest() {
    let ctx = TestContext::new().await;
    let alice = ctx.create_user("alice", None).await;
    // Two tokens, never refilled
    let mut notifier = ctx
        .notifier(&NotifierConfig::default())
        .with_limiters(Some(TokenBucket::new(0.0, 2)), None);

    for i in 0..5 {
        ctx.store
            .insert_notification(&NewNotification::to_user(alice, format!("n{i}"), "body"))
            .await
            .unwrap();
    }

    let report = notifier.dispatch().await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.skipped, 3);

    let pending = ctx.store.list_pending_notifications().await.unwrap();
    assert_eq!(pending.len(), 3);
    // Oldest first
    assert_eq!(pending[0].subject, "n2");

    let subjects: Vec<String> = ctx.email.sent().into_iter().map(|m| m.subject).collect();
    assert_eq!(subjects, vec!["n0", "n1"]);
}

#[tokio::test]
async fn test_day_bucket_also_gates() {
    let ctx = TestContext::new().await;
    let alice = ctx.create_user("alice", None).await;
    let mut notifier = ctx
        .notifier(&unlimited())
        .with_limiters(Some(TokenBucket::new(0.0, 10)), Some(TokenBucket::new(0.0, 1)));

    for i in 0..3 {
        ctx.store
            .insert_notification(&NewNotification::to_user(alice, format!("n{i}"), "body"))
            .await
            .unwrap();
    }

    let report = notifier.dispatch().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped, 2);
}

#[tokio::test]
async fn test_day_limit_does_not_spend_minute_tokens() {
    let ctx = TestContext::new().await;
    let alice = ctx.create_user("alice", None).await;
    let mut notifier = ctx
        .notifier(&unlimited())
        .with_limiters(Some(TokenBucket::new(0.0, 3)), Some(TokenBucket::new(0.0, 1)));

    for i in 0..3 {
        ctx.store
            .insert_notification(&NewNotification::to_user(alice, format!("n{i}"), "body"))
            .await
            .unwrap();
    }

    assert_eq!(notifier.dispatch().await.unwrap().succeeded, 1);
    assert_eq!(notifier.dispatch().await.unwrap().succeeded, 0);

    // Only the delivered notification took a minute token
    let (per_minute, per_day) = notifier.limiters();
    assert_eq!(per_minute.unwrap().available(), 2);
    assert_eq!(per_day.unwrap().available(), 0);
}
