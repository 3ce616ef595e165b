//! PostgreSQL-backed ledger and lease storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::config::TableNames;
use crate::error::Result;
use crate::ledger::{EntryStart, LEASE_ROW_ID, LedgerEntry, LockRecord};
use crate::migration::Migration;
use crate::source::ScriptMigration;

use super::MigrationStore;

/// A migration unit for PostgreSQL.
pub type PostgresMigration = Migration<Postgres>;

/// PostgreSQL-backed migration store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    tables: TableNames,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

const ENTRY_COLUMNS: &str =
    "id, version, description, applied_at, started_at, checksum, status, attempts, error_msg";

#[async_trait]
impl MigrationStore for PostgresStore {
    type Database = Postgres;

    fn new(pool: PgPool, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn tables(&self) -> &TableNames {
        &self.tables
    }

    async fn ensure_tables(&self) -> Result<()> {
        let ledger = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                version TEXT NOT NULL UNIQUE,
                description TEXT,
                applied_at TIMESTAMPTZ,
                started_at TIMESTAMPTZ,
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
                id BIGINT PRIMARY KEY,
                locked_at TIMESTAMPTZ NOT NULL,
                locked_by TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
            self.tables.lock
        );
        sqlx::query(&lock).execute(&self.pool).await?;

        Ok(())
    }

    async fn begin_unit(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self
            .pool
            .begin_with("BEGIN ISOLATION LEVEL SERIALIZABLE")
            .await?)
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
            ORDER BY applied_at DESC NULLS LAST, version DESC
            LIMIT 1
            "#,
            ENTRY_COLUMNS, self.tables.ledger
        );
        let row = sqlx::query_as::<_, LedgerEntry>(&sql)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn is_completed(&self, conn: &mut PgConnection, version: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE version = $1 AND status = 'completed')",
            self.tables.ledger
        );
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(version)
            .fetch_one(&mut *conn)
            .await?;
        Ok(exists)
    }

    async fn record_running(&self, conn: &mut PgConnection, entry: &EntryStart<'_>) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {0} (version, description, started_at, applied_at, checksum, status, attempts, error_msg)
            VALUES ($1, $2, $3, NULL, $4, 'running', 1, NULL)
            ON CONFLICT (version) DO UPDATE SET
                description = EXCLUDED.description,
                started_at = EXCLUDED.started_at,
                applied_at = NULL,
                checksum = EXCLUDED.checksum,
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
        conn: &mut PgConnection,
        version: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = 'completed', applied_at = $1, error_msg = NULL WHERE version = $2",
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
        conn: &mut PgConnection,
        entry: &EntryStart<'_>,
        error: &str,
    ) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {0} (version, description, started_at, applied_at, checksum, status, attempts, error_msg)
            VALUES ($1, $2, $3, NULL, $4, 'failed', 1, $5)
            ON CONFLICT (version) DO UPDATE SET
                description = EXCLUDED.description,
                started_at = EXCLUDED.started_at,
                applied_at = NULL,
                checksum = EXCLUDED.checksum,
                status = 'failed',
                attempts = 1,
                error_msg = EXCLUDED.error_msg
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

    async fn delete_entry(&self, conn: &mut PgConnection, version: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE version = $1", self.tables.ledger);
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
            SET status = 'failed', error_msg = $1
            WHERE status = 'running' AND started_at < $2
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
        let sql = format!("DELETE FROM {} WHERE expires_at <= $1", self.tables.lock);
        let result = sqlx::query(&sql).bind(now).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_lock(&self, conn: &mut PgConnection, lock: &LockRecord) -> Result<bool> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, locked_at, locked_by, expires_at)
            VALUES ($1, $2, $3, $4)
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

    async fn current_lock(&self, conn: &mut PgConnection) -> Result<Option<LockRecord>> {
        let sql = format!(
            "SELECT id, locked_at, locked_by, expires_at FROM {} WHERE id = $1",
            self.tables.lock
        );
        let row = sqlx::query_as::<_, LockRecord>(&sql)
            .bind(LEASE_ROW_ID)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    async fn count_active_locks(&self, now: DateTime<Utc>) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE expires_at > $1",
            self.tables.lock
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn release_lock(&self, holder: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE locked_by = $1", self.tables.lock);
        let result = sqlx::query(&sql)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl Migration<Postgres> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    // Helper to get a test store on fresh, uniquely named tables
    async fn test_store() -> Option<PostgresStore> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        let suffix = Uuid::new_v4().simple().to_string();
        let store = PostgresStore::new(
            pool,
            TableNames {
                ledger: format!("tm_ledger_{}", suffix),
                lock: format!("tm_lock_{}", suffix),
            },
        );
        store.ensure_tables().await.ok()?;
        Some(store)
    }

    // Helper to drop the per-test tables
    async fn cleanup(store: &PostgresStore) {
        for table in [&store.tables().ledger, &store.tables().lock] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(store.pool())
                .await
                .ok();
        }
    }

    fn start(version: &str) -> EntryStart<'_> {
        EntryStart {
            version,
            description: "test step",
            checksum: "abc123",
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_serializable_running_then_completed() {
        let Some(store) = test_store().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let mut tx = store.begin_unit().await.unwrap();
        store.record_running(&mut *tx, &start("001_a")).await.unwrap();
        assert!(!store.is_completed(&mut *tx, "001_a").await.unwrap());
        store
            .mark_completed(&mut *tx, "001_a", Utc::now())
            .await
            .unwrap();
        assert!(store.is_completed(&mut *tx, "001_a").await.unwrap());
        tx.commit().await.unwrap();

        let last = store.last_completed().await.unwrap().unwrap();
        assert_eq!(last.version, "001_a");
        assert_eq!(last.attempts, 1);

        cleanup(&store).await;
    }

    #[tokio::test]
    async fn test_running_replaces_failed_row() {
        let Some(store) = test_store().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let mut tx = store.pool().begin().await.unwrap();
        store
            .record_failure(&mut *tx, &start("002_b"), "boom")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.pool().begin().await.unwrap();
        store.record_running(&mut *tx, &start("002_b")).await.unwrap();
        tx.commit().await.unwrap();

        let entries = store.list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, "running");
        assert_eq!(entries[0].attempts, 1);
        assert!(entries[0].error_msg.is_none());

        assert_eq!(store.delete_unfinished().await.unwrap(), 1);

        cleanup(&store).await;
    }

    #[tokio::test]
    async fn test_lock_insert_and_release() {
        let Some(store) = test_store().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };

        let now = Utc::now();
        let lease = chrono::Duration::minutes(30);

        let mut tx = store.pool().begin().await.unwrap();
        assert!(
            store
                .insert_lock(&mut *tx, &LockRecord::new("a", now, lease))
                .await
                .unwrap()
        );
        assert!(
            !store
                .insert_lock(&mut *tx, &LockRecord::new("b", now, lease))
                .await
                .unwrap()
        );
        tx.commit().await.unwrap();

        assert_eq!(store.count_active_locks(now).await.unwrap(), 1);
        assert_eq!(store.release_lock("a").await.unwrap(), 1);
        assert_eq!(store.count_active_locks(now).await.unwrap(), 0);

        cleanup(&store).await;
    }
}
