// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Token bucket rate limiter.
//!
//! Refill is lazy: whole tokens accrued since the last refill are added on
//! each [`TokenBucket::allow`] or [`TokenBucket::ready`] call, capped at
//! capacity. Fractional progress
//! is kept by only moving the refill mark when at least one token was added.
//!
//! The bucket takes `&mut self` and does no locking; it belongs to a single
//! owner (the notifier loop).

use std::time::Instant;

/// Token bucket with `capacity` burst and `rate` tokens per second.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(rate_per_sec: f64, capacity: u64) -> Self {
        Self::new_at(rate_per_sec, capacity, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn new_at(rate_per_sec: f64, capacity: u64, now: Instant) -> Self {
        Self {
            rate: rate_per_sec.max(0.0),
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Bucket refilling `per_minute` tokens every minute.
    pub fn per_minute(per_minute: u64, capacity: u64) -> Self {
        Self::new(per_minute as f64 / 60.0, capacity)
    }

    /// Bucket refilling `per_day` tokens every day.
    pub fn per_day(per_day: u64, capacity: u64) -> Self {
        Self::new(per_day as f64 / 86_400.0, capacity)
    }

    /// Consume one token if available.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Consume one token if available, using `now` as the current time.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        if self.ready_at(now) {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Whether a token is available. Refills but consumes nothing.
    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    /// Whether a token is available at `now`. Refills but consumes nothing.
    pub fn ready_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens > 0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let new_tokens = (elapsed * self.rate).floor() as u64;
        if new_tokens > 0 {
            self.tokens = self.tokens.saturating_add(new_tokens).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Tokens currently available, without refilling.
    pub fn available(&self) -> u64 {
        self.tokens
    }

    /// Maximum burst.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
