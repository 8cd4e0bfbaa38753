// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for sasso-reconciler.

use sasso_core::SassoError;
use sasso_core::backend::BackendError;
use thiserror::Error;

/// Reconciler errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Store, request or guard-level failure from sasso-core.
    #[error(transparent)]
    Core(#[from] SassoError),

    /// Worker task failed to run to completion.
    #[error("Worker error: {0}")]
    Worker(#[from] crate::worker::WorkerError),

    /// Port forwards need the public address for NAT reflection.
    #[error("SASSO_FIREWALL_PUBLIC_IP is not configured")]
    MissingPublicIp,
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        Self::Core(SassoError::Backend(err))
    }
}

impl Error {
    /// Whether the failed operation is worth retrying next cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Core(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Result type using the reconciler [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
