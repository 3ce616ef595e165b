// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery from crashed and failed runs.
//!
//! A process that dies mid-migration can leave a `running` row behind. Once it
//! is older than the stuck timeout it is marked failed. Failed rows are deleted
//! on retry so their versions become pending again; a retried unit starts over at
//! one attempt.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::error::Result;
use crate::migrator::Migrator;
use crate::store::MigrationStore;

/// Error text written into rows failed by [`Migrator::cleanup_stuck_migrations`].
pub const STUCK_MESSAGE: &str = "Migration stuck - cleaned up by timeout";

impl<S: MigrationStore> Migrator<S> {
    /// Mark `running` rows older than `timeout` as failed.
    ///
    /// A zero `timeout` uses the configured stuck timeout. Returns the number of
    /// rows changed.
    pub async fn cleanup_stuck_migrations(&self, timeout: Duration) -> Result<u64> {
        let timeout = if timeout.is_zero() {
            self.config.stuck_timeout
        } else {
            timeout
        };
        let age = chrono::Duration::from_std(timeout)
            .map_err(|_| ConfigError::Invalid("stuck_timeout", "is out of range"))?;

        self.store.ensure_tables().await?;

        let cutoff = Utc::now() - age;
        let cleaned = self.store.fail_stuck(cutoff, STUCK_MESSAGE).await?;
        if cleaned > 0 {
            warn!(cleaned, timeout = ?timeout, "Cleaned up stuck migrations");
        }
        Ok(cleaned)
    }

    /// Clear failed and stuck rows, then run [`Migrator::up`] again.
    pub async fn retry_failed_migrations(&self) -> Result<usize> {
        self.cleanup_stuck_migrations(Duration::ZERO).await?;

        let reset = self.store.delete_unfinished().await?;
        if reset > 0 {
            info!(reset, "Reset failed/stuck migrations for retry");
        }

        self.up().await
    }

    /// Delete every ledger row.
    ///
    /// Every registered migration becomes pending; nothing is rolled back.
    pub async fn reset(&self) -> Result<u64> {
        self.store.ensure_tables().await?;
        let removed = self.store.delete_all().await?;
        warn!(removed, "Reset migration ledger");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigratorConfig;
    use crate::ledger::EntryStart;
    use crate::migrator::SqliteMigrator;
    use crate::store::sqlite::SqliteMigration;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    async fn test_migrator() -> SqliteMigrator {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        let config = MigratorConfig::default()
            .with_instance_id("recovery-test")
            .with_wait(Duration::from_millis(10), Duration::from_millis(200));
        SqliteMigrator::new(pool, config).unwrap()
    }

    async fn insert_running(migrator: &SqliteMigrator, version: &str, age: chrono::Duration) {
        let entry = EntryStart {
            version,
            description: "left behind",
            checksum: "",
            started_at: Utc::now() - age,
        };
        let mut tx = migrator.store().pool().begin().await.unwrap();
        migrator
            .store()
            .record_running(&mut *tx, &entry)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_stuck_respects_timeout() {
        let migrator = test_migrator().await;
        migrator.store().ensure_tables().await.unwrap();

        insert_running(&migrator, "001_old", chrono::Duration::minutes(45)).await;
        insert_running(&migrator, "002_young", chrono::Duration::minutes(5)).await;

        let cleaned = migrator
            .cleanup_stuck_migrations(Duration::from_secs(30 * 60))
            .await
            .unwrap();
        assert_eq!(cleaned, 1);

        let entries = migrator.store().list_entries().await.unwrap();
        assert_eq!(entries[0].version, "001_old");
        assert_eq!(entries[0].status, "failed");
        assert_eq!(entries[0].error_msg.as_deref(), Some(STUCK_MESSAGE));
        assert_eq!(entries[1].version, "002_young");
        assert_eq!(entries[1].status, "running");
    }

    #[tokio::test]
    async fn test_cleanup_zero_uses_configured_timeout() {
        let migrator = test_migrator().await;
        migrator.store().ensure_tables().await.unwrap();

        insert_running(&migrator, "001_old", chrono::Duration::minutes(31)).await;
        insert_running(&migrator, "002_young", chrono::Duration::minutes(29)).await;

        let cleaned = migrator
            .cleanup_stuck_migrations(Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(cleaned, 1);
    }

    #[tokio::test]
    async fn test_retry_reapplies_fixed_migration() {
        let fixed = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut migrator = test_migrator().await;
        let flag = Arc::clone(&fixed);
        let counter = Arc::clone(&calls);
        migrator
            .register(SqliteMigration::new("001_flaky", "flaky", move |_conn| {
                counter.fetch_add(1, Ordering::SeqCst);
                let ok = flag.load(Ordering::SeqCst);
                Box::pin(async move {
                    if ok {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("not yet"))
                    }
                })
            }))
            .unwrap();

        assert!(migrator.up().await.is_err());
        assert!(migrator.retry_failed_migrations().await.is_err());

        fixed.store(true, Ordering::SeqCst);
        assert_eq!(migrator.retry_failed_migrations().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let entries = migrator.store().list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_completed());
        assert_eq!(entries[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_ledger() {
        let mut migrator = test_migrator().await;
        migrator
            .register(SqliteMigration::sql(
                "001_t",
                "create t",
                "CREATE TABLE IF NOT EXISTS t (id INTEGER);",
            ))
            .unwrap();
        migrator.up().await.unwrap();

        assert_eq!(migrator.reset().await.unwrap(), 1);
        assert!(migrator.store().list_entries().await.unwrap().is_empty());

        // Pending again; the script is written to tolerate a re-run
        assert_eq!(migrator.up().await.unwrap(), 1);
    }
}
