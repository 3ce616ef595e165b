// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tidemark.
//!
//! Every failure surfaces through a single [`Error`] enum. [`Error::kind`] groups
//! the variants into the four classes callers act on differently:
//!
//! | Kind | Examples | Caller action |
//! |------|----------|---------------|
//! | `Coordination` | lease held, wait timeout | do not serve traffic, restart later |
//! | `Application` | a migration step failed | fix the step, then retry failed migrations |
//! | `Integrity` | unknown version, no rollback step | fix the registry |
//! | `Infrastructure` | database, I/O, configuration | propagate |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type using tidemark's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lease coordination between instances failed.
    Coordination,
    /// A forward or backward migration step failed.
    Application,
    /// The registry or ledger is not in the shape the operation needs.
    Integrity,
    /// Database, filesystem or configuration failure.
    Infrastructure,
}

/// Migration runner errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Another instance currently holds the migration lease.
    #[error("Migration lock held by instance: {holder}")]
    LeaseHeld {
        /// Identifier of the instance holding the lease.
        holder: String,
    },

    /// The lease was not released within the wait deadline.
    #[error("Timeout after {waited:?} waiting for migration lock to be released")]
    LeaseWaitTimeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// Releasing found no lease row owned by this instance.
    #[error("No migration lock found for instance: {holder}")]
    LeaseNotHeld {
        /// Identifier of the instance that tried to release.
        holder: String,
    },

    /// A forward migration step failed; the run was aborted.
    #[error("Migration {version} failed: {reason}")]
    MigrationFailed {
        /// Version of the failing migration.
        version: String,
        /// Error text recorded in the ledger.
        reason: String,
    },

    /// A backward migration step failed; the ledger is unchanged.
    #[error("Rollback {version} failed: {reason}")]
    RollbackFailed {
        /// Version being rolled back.
        version: String,
        /// Error text from the backward step.
        reason: String,
    },

    /// `down()` found no completed migration.
    #[error("No migrations to rollback")]
    NothingToRollBack,

    /// The ledger names a version the registry does not know.
    #[error("Migration {version} not found in registered migrations")]
    UnknownVersion {
        /// The unknown version.
        version: String,
    },

    /// The migration has no backward step.
    #[error("Migration {version} has no rollback function")]
    Irreversible {
        /// Version without a backward step.
        version: String,
    },

    /// Two registered migrations share a version.
    #[error("Duplicate migration version: {version}")]
    DuplicateVersion {
        /// The duplicated version.
        version: String,
    },

    /// A ledger row carries a status string tidemark does not recognize.
    #[error("Migration {version} has unrecognized status '{status}'")]
    InvalidStatus {
        /// Version of the offending row.
        version: String,
        /// The raw status value.
        status: String,
    },

    /// A migration script directory could not be loaded.
    #[error("Invalid migration source {}: {reason}", path.display())]
    Source {
        /// Offending file or directory.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LeaseHeld { .. } | Self::LeaseWaitTimeout { .. } | Self::LeaseNotHeld { .. } => {
                ErrorKind::Coordination
            }
            Self::MigrationFailed { .. } | Self::RollbackFailed { .. } => ErrorKind::Application,
            Self::NothingToRollBack
            | Self::UnknownVersion { .. }
            | Self::Irreversible { .. }
            | Self::DuplicateVersion { .. }
            | Self::InvalidStatus { .. }
            | Self::Source { .. } => ErrorKind::Integrity,
            Self::Config(_) | Self::Database(_) | Self::Io(_) => ErrorKind::Infrastructure,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::LeaseHeld { .. } => "LEASE_HELD",
            Self::LeaseWaitTimeout { .. } => "LEASE_WAIT_TIMEOUT",
            Self::LeaseNotHeld { .. } => "LEASE_NOT_HELD",
            Self::MigrationFailed { .. } => "MIGRATION_FAILED",
            Self::RollbackFailed { .. } => "ROLLBACK_FAILED",
            Self::NothingToRollBack => "NOTHING_TO_ROLLBACK",
            Self::UnknownVersion { .. } => "UNKNOWN_VERSION",
            Self::Irreversible { .. } => "IRREVERSIBLE",
            Self::DuplicateVersion { .. } => "DUPLICATE_VERSION",
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::Source { .. } => "INVALID_SOURCE",
        }
    }
}
