//! Storage interfaces and backends for the ledger and lease tables.
//!
//! The runner is written once against [`MigrationStore`]; each backend owns its
//! dialect's SQL. Operations that must share the caller's transaction take the
//! transaction's connection, the rest run on the pool.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool, Transaction};

use crate::config::TableNames;
use crate::error::Result;
use crate::ledger::{EntryStart, LedgerEntry, LockRecord};

/// Connection type of a store's database.
pub type Conn<S> = <<S as MigrationStore>::Database as Database>::Connection;

/// Persistence for the ledger and lease tables.
#[async_trait]
pub trait MigrationStore: Send + Sync + 'static {
    /// The sqlx database driver.
    type Database: Database;

    /// Wrap a pool and table names.
    fn new(pool: Pool<Self::Database>, tables: TableNames) -> Self
    where
        Self: Sized;

    fn pool(&self) -> &Pool<Self::Database>;

    fn tables(&self) -> &TableNames;

    // ========================================================================
    // Schema
    // ========================================================================

    /// Create the ledger and lease tables if they do not exist.
    async fn ensure_tables(&self) -> Result<()>;

    /// Open a transaction for a migration step or a ledger or lease write.
    ///
    /// On SQLite the transaction takes the write lock up front (`BEGIN
    /// IMMEDIATE`), so a read followed by a write cannot fail when another
    /// connection writes in between. On PostgreSQL it runs at serializable
    /// isolation.
    async fn begin_unit(&self) -> Result<Transaction<'static, Self::Database>>;

    // ========================================================================
    // Ledger
    // ========================================================================

    /// All ledger rows, ordered by version.
    async fn list_entries(&self) -> Result<Vec<LedgerEntry>>;

    /// The completed row with the latest `applied_at`.
    async fn last_completed(&self) -> Result<Option<LedgerEntry>>;

    /// Whether `version` has a completed row, read inside the caller's transaction.
    async fn is_completed(
        &self,
        conn: &mut <Self::Database as Database>::Connection,
        version: &str,
    ) -> Result<bool>;

    /// Insert or replace the row for an attempt with status `running`.
    async fn record_running(
        &self,
        conn: &mut <Self::Database as Database>::Connection,
        entry: &EntryStart<'_>,
    ) -> Result<()>;

    /// Flip the row to `completed`.
    async fn mark_completed(
        &self,
        conn: &mut <Self::Database as Database>::Connection,
        version: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Insert or replace the row for an attempt with status `failed`.
    async fn record_failure(
        &self,
        conn: &mut <Self::Database as Database>::Connection,
        entry: &EntryStart<'_>,
        error: &str,
    ) -> Result<()>;

    /// Delete the row for `version`. Returns rows affected.
    async fn delete_entry(
        &self,
        conn: &mut <Self::Database as Database>::Connection,
        version: &str,
    ) -> Result<u64>;

    /// Mark `running` rows started before `cutoff` as failed with `message`.
    async fn fail_stuck(&self, cutoff: DateTime<Utc>, message: &str) -> Result<u64>;

    /// Delete every `failed` or `running` row.
    async fn delete_unfinished(&self) -> Result<u64>;

    /// Delete every ledger row.
    async fn delete_all(&self) -> Result<u64>;

    // ========================================================================
    // Lease
    // ========================================================================

    /// Delete lease rows that expired at or before `now`.
    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Insert the lease row unless one exists. Returns whether it was inserted.
    async fn insert_lock(
        &self,
        conn: &mut <Self::Database as Database>::Connection,
        lock: &LockRecord,
    ) -> Result<bool>;

    /// The current lease row, if any.
    async fn current_lock(
        &self,
        conn: &mut <Self::Database as Database>::Connection,
    ) -> Result<Option<LockRecord>>;

    /// Number of lease rows not yet expired at `now`.
    async fn count_active_locks(&self, now: DateTime<Utc>) -> Result<i64>;

    /// Delete the lease row owned by `holder`. Returns rows affected.
    async fn release_lock(&self, holder: &str) -> Result<u64>;
}
