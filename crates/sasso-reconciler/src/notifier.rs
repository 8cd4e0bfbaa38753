// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notification dispatch.
//!
//! Pending notifications are delivered oldest first through email and
//! Telegram, gated by a per-minute and a per-day token bucket. Delivery is
//! at most once: a notification is marked sent after the attempt whether or
//! not any channel accepted it. When a bucket runs dry the cycle stops and
//! the remaining notifications wait for the next one.

use std::sync::Arc;

use async_trait::async_trait;
use sasso_core::backend::{EmailSender, TelegramSender, TelegramTarget};
use sasso_core::limiter::TokenBucket;
use sasso_core::store::{NotificationRecord, UserRecord};
use sasso_core::Store;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::{WorkerMetrics, timed};
use crate::worker::{CycleReport, Reconciler};

/// Burst size of the per-minute bucket.
pub const MINUTE_BURST: u64 = 10;

/// Burst size of the per-day bucket.
pub const DAY_BURST: u64 = 1000;

/// Notifier configuration.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Gate delivery through the token buckets
    pub rate_limits: bool,
    /// Per-minute refill rate
    pub max_per_minute: u64,
    /// Per-day refill rate
    pub max_per_day: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            rate_limits: true,
            max_per_minute: 20,
            max_per_day: 1000,
        }
    }
}

/// Delivers queued notifications.
pub struct Notifier {
    store: Arc<dyn Store>,
    email: Arc<dyn EmailSender>,
    telegram: Arc<dyn TelegramSender>,
    per_minute: Option<TokenBucket>,
    per_day: Option<TokenBucket>,
    metrics: Option<WorkerMetrics>,
}

impl Notifier {
    /// Create a notifier with buckets built from `config`.
    pub fn new(
        store: Arc<dyn Store>,
        email: Arc<dyn EmailSender>,
        telegram: Arc<dyn TelegramSender>,
        config: &NotifierConfig,
    ) -> Self {
        let (per_minute, per_day) = if config.rate_limits {
            (
                Some(TokenBucket::per_minute(config.max_per_minute, MINUTE_BURST)),
                Some(TokenBucket::per_day(config.max_per_day, DAY_BURST)),
            )
        } else {
            (None, None)
        };

        Self {
            store,
            email,
            telegram,
            per_minute,
            per_day,
            metrics: None,
        }
    }

    /// Record dispatch timing, notification counts and cycle outcomes on
    /// `metrics`.
    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the buckets.
    pub fn with_limiters(mut self, per_minute: Option<TokenBucket>, per_day: Option<TokenBucket>) -> Self {
        self.per_minute = per_minute;
        self.per_day = per_day;
        self
    }

    /// The per-minute and per-day buckets.
    pub fn limiters(&self) -> (Option<&TokenBucket>, Option<&TokenBucket>) {
        (self.per_minute.as_ref(), self.per_day.as_ref())
    }

    /// Take one token from each bucket, or none when either is empty.
    fn allow(&mut self) -> bool {
        let ready = self.per_minute.as_mut().is_none_or(TokenBucket::ready)
            && self.per_day.as_mut().is_none_or(TokenBucket::ready);
        if !ready {
            return false;
        }
        for bucket in [&mut self.per_minute, &mut self.per_day].into_iter().flatten() {
            bucket.allow();
        }
        true
    }

    /// Deliver pending notifications until done or rate limited.
    pub async fn dispatch(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let pending = self.store.list_pending_notifications().await?;

        if pending.is_empty() {
            debug!("No pending notifications");
            return Ok(report);
        }

        let total = pending.len();
        for (index, notification) in pending.iter().enumerate() {
            if !self.allow() {
                let remaining = total - index;
                info!(remaining, "Notification rate limit reached");
                for _ in 0..remaining {
                    report.skip();
                }
                break;
            }

            self.deliver(notification).await;

            match self.store.mark_notification_sent(notification.id).await {
                Ok(()) => report.succeed(),
                Err(e) => {
                    warn!(notification_id = notification.id, error = %e, "Failed to mark notification sent");
                    report.fail();
                }
            }
        }

        Ok(report)
    }

    /// Attempt every requested channel. Failures are logged only.
    async fn deliver(&self, notification: &NotificationRecord) {
        if notification.email {
            match self.recipients(notification.user_id).await {
                Ok(users) => {
                    for user in users {
                        if let Err(e) = self
                            .email
                            .send(&user.email, &notification.subject, &notification.body)
                            .await
                        {
                            warn!(
                                notification_id = notification.id,
                                user_id = user.id,
                                error = %e,
                                "Email delivery failed"
                            );
                        }
                    }
                }
                Err(e) => warn!(notification_id = notification.id, error = %e, "Failed to resolve email recipients"),
            }
        }

        if notification.telegram {
            let text = format!("{}\n\n{}", notification.subject, notification.body);
            match self.store.list_enabled_telegram_bots(notification.user_id).await {
                Ok(bots) => {
                    for bot in bots {
                        let target = TelegramTarget {
                            token: bot.token,
                            chat_id: bot.chat_id,
                        };
                        if let Err(e) = self.telegram.send(&target, &text).await {
                            warn!(
                                notification_id = notification.id,
                                bot_id = bot.id,
                                error = %e,
                                "Telegram delivery failed"
                            );
                        }
                    }
                }
                Err(e) => warn!(notification_id = notification.id, error = %e, "Failed to list Telegram bots"),
            }
        }

        debug!(notification_id = notification.id, subject = %notification.subject, "Notification dispatched");
    }

    /// The addressed user, or every user for broadcasts.
    async fn recipients(&self, user_id: Option<i64>) -> Result<Vec<UserRecord>> {
        match user_id {
            Some(id) => {
                let user = self.store.get_user(id).await?;
                if user.is_none() {
                    warn!(user_id = id, "Notification addressed to a missing user");
                }
                Ok(user.into_iter().collect())
            }
            None => Ok(self.store.list_users().await?),
        }
    }
}

#[async_trait]
impl Reconciler for Notifier {
    fn name(&self) -> &'static str {
        "notifier"
    }

    fn metrics(&self) -> Option<&WorkerMetrics> {
        self.metrics.as_ref()
    }

    async fn reconcile(&mut self) -> Result<CycleReport> {
        let metrics = self.metrics.clone();
        let report = timed(metrics.as_ref(), "notifier", "dispatch", self.dispatch()).await;

        if let Some(metrics) = &metrics {
            match self.store.count_notifications().await {
                Ok(counts) => metrics.record_notifications(&counts),
                Err(e) => warn!(error = %e, "Failed to count notifications"),
            }
        }

        report
    }
}
