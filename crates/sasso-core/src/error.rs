// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for sasso-core.
//!
//! Every error maps to a stable code string that API layers can hand back to
//! clients alongside the human-readable message.

use thiserror::Error;

use crate::backend::BackendError;

/// Result type using [`SassoError`].
pub type Result<T> = std::result::Result<T, SassoError>;

/// Errors raised by ticket handling, request execution and the resource store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SassoError {
    /// The addressed entity does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Kind of entity (ticket, net, vm, ...).
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A persisted request carries a type tag no loader is registered for.
    #[error("unknown request kind '{0}'")]
    UnknownRequestKind(String),

    /// The ticket identifier is not a valid UUID.
    #[error("invalid ticket id '{0}'")]
    InvalidTicketId(String),

    /// A backend capability call failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Caller supplied an invalid value.
    #[error("invalid {field}: {message}")]
    Validation {
        /// Offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The entity is in a status that forbids the operation.
    #[error("{entity} '{id}' is {status}")]
    InvalidState {
        /// Kind of entity.
        entity: &'static str,
        /// Identifier of the entity.
        id: String,
        /// Status that blocked the operation.
        status: String,
    },

    /// A uniqueness rule would be violated (tag, port, name...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// No free subnet is left in the configured address pool.
    #[error("address pool exhausted")]
    AddressPoolExhausted,

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl SassoError {
    /// Shorthand for [`SassoError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`SassoError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::UnknownRequestKind(_) => "UNKNOWN_REQUEST_KIND",
            Self::InvalidTicketId(_) => "INVALID_TICKET_ID",
            Self::Backend(_) => "BACKEND_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Conflict(_) => "CONFLICT",
            Self::AddressPoolExhausted => "ADDRESS_POOL_EXHAUSTED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
        }
    }

    /// Whether a later attempt can succeed without anything else changing.
    ///
    /// Unreachable backends and transient database failures are retryable;
    /// a ticket failing with one of these stays pending.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_retryable(),
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Map a unique-constraint violation to [`SassoError::Conflict`].
    pub(crate) fn from_insert(err: sqlx::Error, what: impl FnOnce() -> String) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict(what()),
            _ => Self::Database(err),
        }
    }

    /// Map a delete error, turning a foreign key violation into
    /// [`SassoError::Conflict`].
    pub(crate) fn from_delete(err: sqlx::Error, what: impl FnOnce() -> String) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => Self::Conflict(what()),
            _ => Self::Database(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (SassoError::not_found("ticket", "abc"), "NOT_FOUND"),
            (
                SassoError::UnknownRequestKind("resize-network".into()),
                "UNKNOWN_REQUEST_KIND",
            ),
            (SassoError::InvalidTicketId("xyz".into()), "INVALID_TICKET_ID"),
            (
                SassoError::Backend(BackendError::Unreachable("gw".into())),
                "BACKEND_ERROR",
            ),
            (SassoError::validation("dest_ip", "outside subnet"), "VALIDATION_ERROR"),
            (
                SassoError::InvalidState {
                    entity: "vm",
                    id: "7".into(),
                    status: "pre-deleting".into(),
                },
                "INVALID_STATE",
            ),
            (SassoError::Conflict("tag 100".into()), "CONFLICT"),
            (SassoError::AddressPoolExhausted, "ADDRESS_POOL_EXHAUSTED"),
            (SassoError::Database(sqlx::Error::RowNotFound), "DATABASE_ERROR"),
        ];

        for (err, code) in cases {
            assert_eq!(err.error_code(), code, "wrong code for {err}");
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SassoError::Backend(BackendError::Unreachable("fw".into())).is_retryable());
        assert!(SassoError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!SassoError::Backend(BackendError::Rejected("bad tag".into())).is_retryable());
        assert!(!SassoError::Conflict("vnet alpha".into()).is_retryable());
        assert!(!SassoError::AddressPoolExhausted.is_retryable());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            SassoError::not_found("ticket", "0190").to_string(),
            "ticket '0190' not found"
        );
        assert_eq!(
            SassoError::UnknownRequestKind("resize".into()).to_string(),
            "unknown request kind 'resize'"
        );
    }
}
