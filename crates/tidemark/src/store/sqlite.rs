//! SQLite-backed ledger and lease storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::config::TableNames;
use crate::error::Result;
use crate::ledger::{EntryStart, LEASE_ROW_ID, LedgerEntry, LockRecord};
use crate::migration::Migration;
use crate::source::ScriptMigration;

use super::MigrationStore;

/// A migration unit for SQLite.
pub type SqliteMigration = Migration<Sqlite>;

/// SQLite-backed migration store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    tables: TableNames,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

const ENTRY_COLUMNS: &str =
    "id, version, description, applied_at, started_at, checksum, status, attempts, error_msg";

#[async_trait]
impl MigrationStore for SqliteStore {
    type Database = Sqlite;

    fn new(pool: SqlitePool, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn tables(&self) -> &TableNames {
        &self.tables
    }

    async fn ensure_tables(&self) -> Result<()> {
        let ledger = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version TEXT NOT NULL UNIQUE,
                description TEXT,
                applied_at DATETIME,
                started_at DATETIME,
                checksum TEXT,
                status TEXT NOT NULL DEFAULT 'completed',
                attempts INTEGER NOT NULL DEFAULT 0,
                error_msg TEXT
            )
            "#,
            self.tables.ledger
        );
        sqlx::query(&ledger).execute(&self.pool).await?;

        let lock = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY,
                locked_at DATETIME NOT NULL,
                locked_by TEXT NOT NULL,
                expires_at DATETIME NOT NULL
            )
            "#,
            self.tables.lock
        );
        sqlx::query(&lock).execute(&self.pool).await?;

        Ok(())
    }

    async fn begin_unit(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn list_entries(&self) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY version",
            ENTRY_COLUMNS, self.tables.ledger
        );
        let rows = sqlx::query_as::<_, LedgerEntry>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn last_completed(&self) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            r#"
            SELECT {} FROM {}
            WHERE status = 'completed'
            ORDER BY applied_at DESC, version DESC
            LIMIT 1
            "#,
            ENTRY_COLUMNS, self.tables.ledger
        );
        let row = sqlx::query_as::<_, LedgerEntry>(&sql)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn is_completed(&self, conn: &mut SqliteConnection, version: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE version = ? AND status = 'completed'",
            self.tables.ledger
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(version)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count > 0)
    }

    async fn record_running(&self, conn: &mut SqliteConnection, entry: &EntryStart<'_>) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {0} (version, description, started_at, applied_at, checksum, status, attempts, error_msg)
            VALUES (?, ?, ?, NULL, ?, 'running', 1, NULL)
            ON CONFLICT (version) DO UPDATE SET
                description = excluded.description,
                started_at = excluded.started_at,
                applied_at = NULL,
                checksum = excluded.checksum,
                status = 'running',
                attempts = 1,
                error_msg = NULL
            "#,
            self.tables.ledger
        );
        sqlx::query(&sql)
            .bind(entry.version)
            .bind(entry.description)
            .bind(entry.started_at)
            .bind(entry.checksum)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        conn: &mut SqliteConnection,
        version: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = 'completed', applied_at = ?, error_msg = NULL WHERE version = ?",
            self.tables.ledger
        );
        sqlx::query(&sql)
            .bind(applied_at)
            .bind(version)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        conn: &mut SqliteConnection,
        entry: &EntryStart<'_>,
        error: &str,
    ) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {0} (version, description, started_at, applied_at, checksum, status, attempts, error_msg)
            VALUES (?, ?, ?, NULL, ?, 'failed', 1, ?)
            ON CONFLICT (version) DO UPDATE SET
                description = excluded.description,
                started_at = excluded.started_at,
                applied_at = NULL,
                checksum = excluded.checksum,
                status = 'failed',
                attempts = 1,
                error_msg = excluded.error_msg
            "#,
            self.tables.ledger
        );
        sqlx::query(&sql)
            .bind(entry.version)
            .bind(entry.description)
            .bind(entry.started_at)
            .bind(entry.checksum)
            .bind(error)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn delete_entry(&self, conn: &mut SqliteConnection, version: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE version = ?", self.tables.ledger);
        let result = sqlx::query(&sql)
            .bind(version)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fail_stuck(&self, cutoff: DateTime<Utc>, message: &str) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'failed', error_msg = ?
            WHERE status = 'running' AND started_at < ?
            "#,
            self.tables.ledger
        );
        let result = sqlx::query(&sql)
            .bind(message)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_unfinished(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE status IN ('failed', 'running')",
            self.tables.ledger
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&self) -> Result<u64> {
        let sql = format!("DELETE FROM {}", self.tables.ledger);
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE expires_at <= ?", self.tables.lock);
        let result = sqlx::query(&sql).bind(now).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_lock(&self, conn: &mut SqliteConnection, lock: &LockRecord) -> Result<bool> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, locked_at, locked_by, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
            self.tables.lock
        );
        let result = sqlx::query(&sql)
            .bind(lock.id)
            .bind(lock.locked_at)
            .bind(&lock.locked_by)
            .bind(lock.expires_at)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn current_lock(&self, conn: &mut SqliteConnection) -> Result<Option<LockRecord>> {
        let sql = format!(
            "SELECT id, locked_at, locked_by, expires_at FROM {} WHERE id = ?",
            self.tables.lock
        );
        let row = sqlx::query_as::<_, LockRecord>(&sql)
            .bind(LEASE_ROW_ID)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    async fn count_active_locks(&self, now: DateTime<Utc>) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE expires_at > ?", self.tables.lock);
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn release_lock(&self, holder: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE locked_by = ?", self.tables.lock);
        let result = sqlx::query(&sql)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl Migration<Sqlite> {
    /// Build a migration that runs `up_sql` as a raw multi-statement script.
    ///
    /// The script text is folded into the checksum.
    pub fn sql(
        version: impl Into<String>,
        description: impl Into<String>,
        up_sql: impl Into<String>,
    ) -> Self {
        let up_sql: Arc<str> = Arc::from(up_sql.into());
        let source = Arc::clone(&up_sql);
        Self::new(version, description, move |conn| {
            let script = Arc::clone(&up_sql);
            Box::pin(async move {
                sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&script)).await?;
                Ok::<(), anyhow::Error>(())
            })
        })
        .with_checksum_source(&source)
    }

    /// Attach a raw SQL script as the backward step.
    pub fn with_down_sql(self, down_sql: impl Into<String>) -> Self {
        let down_sql: Arc<str> = Arc::from(down_sql.into());
        self.with_down(move |conn| {
            let script = Arc::clone(&down_sql);
            Box::pin(async move {
                sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&script)).await?;
                Ok::<(), anyhow::Error>(())
            })
        })
    }

    /// Build a migration from a script loaded off disk.
    pub fn from_script(script: ScriptMigration) -> Self {
        let ScriptMigration {
            version,
            description,
            up_sql,
            down_sql,
            ..
        } = script;
        let migration = Self::sql(version, description, up_sql);
        match down_sql {
            Some(down) => migration.with_down_sql(down),
            None => migration,
        }
    }
}
