// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tidemark - Schema Migrations for Replicated Services
//!
//! Tidemark evolves a shared relational schema safely when several instances of a
//! service start at the same time against one database (rolling deploys, scaled
//! replicas). Each instance calls [`Migrator::up`] once at boot, before serving
//! traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  instance A  │   │  instance B  │   │  instance C  │
//! │ Migrator::up │   │ Migrator::up │   │ Migrator::up │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │ wins lease       │ waits            │ waits
//!        ▼                  ▼                  ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                  shared database                    │
//! │  migration_locks (lease)   migrations (ledger)      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Registry | [`migration`] | Ordered catalog of forward/backward steps |
//! | Ledger | [`ledger`], [`store`] | Per-version status, attempts, checksum |
//! | Lease | [`lease`] | One runner at a time, with expiry for crashed holders |
//! | Runner | [`migrator`] | `up`, `down` |
//! | Recovery | [`recovery`] | Stuck-row cleanup, retry, reset |
//! | Status | [`status`] | Read-only report |
//!
//! # Guarantees
//!
//! - Units apply in ascending version order; the first failure stops the run.
//! - No version is applied twice: the lease serializes runners and each unit's
//!   transaction re-checks the ledger before applying.
//! - A failed unit's changes are rolled back and its failure is recorded in a
//!   separate transaction.
//! - The lease is released on every exit path of [`Migrator::up`].
//!
//! # Example
//!
//! ```ignore
//! use tidemark::{MigratorConfig, SqliteMigration, SqliteMigrator};
//!
//! let mut migrator = SqliteMigrator::new(pool, MigratorConfig::from_env()?)?;
//! migrator.register_all(vec![
//!     SqliteMigration::sql("001_create_users", "create users", "CREATE TABLE users (id INTEGER PRIMARY KEY);")
//!         .with_down_sql("DROP TABLE users;"),
//! ])?;
//! migrator.up().await?;
//! ```

pub mod config;
pub mod error;
pub mod lease;
pub mod ledger;
pub mod migration;
pub mod migrator;
pub mod recovery;
pub mod source;
pub mod status;
pub mod store;

pub use config::{ConfigError, MigratorConfig, TableNames};
pub use error::{Error, ErrorKind, Result};
pub use lease::{Lease, LeaseGuard};
pub use ledger::{LedgerEntry, LockRecord, MigrationStatus};
pub use migration::{Migration, MigrationFn, MigrationRegistry, checksum};
pub use migrator::{Migrator, PostgresMigrator, SqliteMigrator};
pub use recovery::STUCK_MESSAGE;
pub use source::{ScriptMigration, load_dir};
pub use status::{StatusReport, StatusRow, StatusSummary};
pub use store::postgres::PostgresMigration;
pub use store::sqlite::SqliteMigration;
pub use store::{MigrationStore, PostgresStore, SqliteStore};
