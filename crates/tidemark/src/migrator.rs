// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The migration runner.
//!
//! [`Migrator::up`] is meant to run once at process start, before the process
//! serves traffic:
//!
//! 1. Create the ledger and lease tables if needed.
//! 2. Take the lease, waiting for another instance's run to finish if necessary.
//! 3. Read the ledger; every registered version without a completed row is pending.
//! 4. Apply each pending unit in version order, each in its own transaction
//!    from [`MigrationStore::begin_unit`] that re-checks the ledger first.
//! 5. Stop at the first failure, record it, and release the lease.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use sqlx::Pool;
use tracing::{debug, info, warn};

use crate::config::MigratorConfig;
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::ledger::{EntryStart, LedgerEntry};
use crate::migration::{Migration, MigrationFn, MigrationRegistry};
use crate::store::{Conn, MigrationStore, PostgresStore, SqliteStore};

/// Migration runner over SQLite.
pub type SqliteMigrator = Migrator<SqliteStore>;

/// Migration runner over PostgreSQL.
pub type PostgresMigrator = Migrator<PostgresStore>;

/// Applies, rolls back and reports registered migrations.
pub struct Migrator<S: MigrationStore> {
    pub(crate) store: Arc<S>,
    pub(crate) registry: MigrationRegistry<S::Database>,
    pub(crate) config: MigratorConfig,
}

impl<S: MigrationStore> std::fmt::Debug for Migrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: MigrationStore> Migrator<S> {
    /// Create a runner over `pool`.
    pub fn new(pool: Pool<S::Database>, config: MigratorConfig) -> Result<Self> {
        config.validate()?;
        let store = S::new(pool, config.tables.clone());
        Ok(Self {
            store: Arc::new(store),
            registry: MigrationRegistry::new(),
            config,
        })
    }

    /// Register one migration.
    pub fn register(&mut self, migration: Migration<S::Database>) -> Result<()> {
        self.registry.register(migration)
    }

    /// Register several migrations.
    pub fn register_all(
        &mut self,
        migrations: impl IntoIterator<Item = Migration<S::Database>>,
    ) -> Result<()> {
        self.registry.register_all(migrations)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// Identifier this runner writes into the lease row.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn migrations(&self) -> &MigrationRegistry<S::Database> {
        &self.registry
    }

    /// Apply all pending migrations.
    ///
    /// Returns the number of units this call applied. Units completed by another
    /// instance while this one waited are skipped and not counted.
    pub async fn up(&self) -> Result<usize> {
        self.store.ensure_tables().await?;

        let lease = Lease::new(Arc::clone(&self.store), &self.config);
        let guard = lease.acquire_or_wait().await?;

        let result = self.apply_pending().await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release migration lock");
        }

        result
    }

    async fn apply_pending(&self) -> Result<usize> {
        let entries = self.store.list_entries().await?;
        let completed: HashMap<&str, &LedgerEntry> = entries
            .iter()
            .filter(|entry| entry.is_completed())
            .map(|entry| (entry.version.as_str(), entry))
            .collect();

        for entry in completed.values() {
            match self.registry.get(&entry.version) {
                Some(migration) => {
                    if let Some(recorded) = entry.checksum.as_deref()
                        && recorded != migration.checksum()
                    {
                        warn!(
                            version = %entry.version,
                            recorded = %recorded,
                            registered = %migration.checksum(),
                            "Checksum of applied migration does not match the registered migration"
                        );
                    }
                }
                None => {
                    warn!(version = %entry.version, "Applied migration is not registered");
                }
            }
        }

        let pending: Vec<&Migration<S::Database>> = self
            .registry
            .iter()
            .filter(|m| !completed.contains_key(m.version()))
            .collect();

        if pending.is_empty() {
            info!("No pending migrations");
            return Ok(0);
        }

        info!(count = pending.len(), "Applying pending migrations");

        let mut applied = 0;
        for migration in pending {
            if self.apply_one(migration).await? {
                applied += 1;
            }
        }

        info!(applied, "All migrations completed successfully");
        Ok(applied)
    }

    /// Apply one unit. Returns `false` when another instance already completed it.
    async fn apply_one(&self, migration: &Migration<S::Database>) -> Result<bool> {
        let version = migration.version();

        let mut tx = self.store.begin_unit().await?;

        if self.store.is_completed(&mut *tx, version).await? {
            tx.rollback().await?;
            info!(version = %version, "Migration already applied by another instance, skipping");
            return Ok(false);
        }

        let entry = EntryStart {
            version,
            description: migration.description(),
            checksum: migration.checksum(),
            started_at: Utc::now(),
        };
        self.store.record_running(&mut *tx, &entry).await?;

        info!(
            version = %version,
            description = %migration.description(),
            "Applying migration"
        );
        let started = Instant::now();

        match self.run_step(migration.up_fn(), &mut *tx).await {
            Ok(()) => {
                self.store
                    .mark_completed(&mut *tx, version, Utc::now())
                    .await?;
                tx.commit().await?;
                info!(
                    version = %version,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Migration applied"
                );
                Ok(true)
            }
            Err(reason) => {
                if let Err(e) = tx.rollback().await {
                    warn!(version = %version, error = %e, "Failed to roll back migration transaction");
                }
                self.record_failure(&entry, &reason).await;
                Err(Error::MigrationFailed {
                    version: version.to_string(),
                    reason,
                })
            }
        }
    }

    /// Persist a failed attempt in its own transaction.
    ///
    /// The unit's transaction is already rolled back at this point. A failure to
    /// write the record is logged and does not mask the migration error.
    async fn record_failure(&self, entry: &EntryStart<'_>, reason: &str) {
        let write = async {
            let mut tx = self.store.begin_unit().await?;
            self.store.record_failure(&mut *tx, entry, reason).await?;
            tx.commit().await?;
            Ok::<(), Error>(())
        };

        match write.await {
            Ok(()) => warn!(version = %entry.version, error = %reason, "Migration failed"),
            Err(e) => warn!(
                version = %entry.version,
                error = %reason,
                record_error = %e,
                "Migration failed and the failure could not be recorded"
            ),
        }
    }

    /// Run a forward or backward step, bounded by the configured step timeout.
    pub(crate) async fn run_step(
        &self,
        step: &MigrationFn<S::Database>,
        conn: &mut Conn<S>,
    ) -> std::result::Result<(), String> {
        let fut = step(conn);
        match self.config.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(|e| format!("{:#}", e)),
                Err(_) => Err(format!("step timed out after {:?}", limit)),
            },
            None => fut.await.map_err(|e| format!("{:#}", e)),
        }
    }

    /// Roll back the most recently applied migration.
    ///
    /// Returns the version that was rolled back. Only one unit is rolled back per
    /// call. The ledger is left unchanged when the backward step fails.
    pub async fn down(&self) -> Result<String> {
        self.store.ensure_tables().await?;

        let last = self
            .store
            .last_completed()
            .await?
            .ok_or(Error::NothingToRollBack)?;
        let version = last.version;

        let migration = self
            .registry
            .get(&version)
            .ok_or_else(|| Error::UnknownVersion {
                version: version.clone(),
            })?;
        let down = migration.down_fn().ok_or_else(|| Error::Irreversible {
            version: version.clone(),
        })?;

        info!(version = %version, "Rolling back migration");

        let mut tx = self.store.begin_unit().await?;

        if let Err(reason) = self.run_step(down, &mut *tx).await {
            if let Err(e) = tx.rollback().await {
                warn!(version = %version, error = %e, "Failed to roll back rollback transaction");
            }
            return Err(Error::RollbackFailed { version, reason });
        }

        let deleted = self.store.delete_entry(&mut *tx, &version).await?;
        debug!(version = %version, deleted, "Removed ledger entry");
        tx.commit().await?;

        info!(version = %version, "Migration rolled back");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MigrationStatus;
    use crate::store::sqlite::SqliteMigration;
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    fn test_config() -> MigratorConfig {
        MigratorConfig::default()
            .with_instance_id("test-migrator")
            .with_wait(Duration::from_millis(10), Duration::from_millis(200))
    }

    fn counting(version: &str, calls: Arc<AtomicUsize>) -> SqliteMigration {
        SqliteMigration::new(version, format!("counting {}", version), move |_conn| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok::<(), anyhow::Error>(()) })
        })
    }

    #[tokio::test]
    async fn test_up_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut migrator = SqliteMigrator::new(test_pool().await, test_config()).unwrap();
        migrator
            .register_all(vec![
                counting("002_b", Arc::clone(&calls)),
                counting("001_a", Arc::clone(&calls)),
            ])
            .unwrap();

        assert_eq!(migrator.up().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(migrator.up().await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let entries = migrator.store().list_entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(
            entries
                .iter()
                .all(|e| e.parsed_status() == Some(MigrationStatus::Completed))
        );
        assert_eq!(migrator.store().count_active_locks(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_up_with_nothing_registered() {
        let migrator = SqliteMigrator::new(test_pool().await, test_config()).unwrap();
        assert_eq!(migrator.up().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_up_fails_fast_and_records_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut migrator = SqliteMigrator::new(test_pool().await, test_config()).unwrap();
        migrator
            .register_all(vec![
                counting("001_a", Arc::clone(&calls)),
                SqliteMigration::new("002_broken", "always fails", |_conn| {
                    Box::pin(async { Err::<(), _>(anyhow::anyhow!("boom")) })
                }),
                counting("003_c", Arc::clone(&calls)),
            ])
            .unwrap();

        let err = migrator.up().await.unwrap_err();
        assert!(matches!(
            err,
            Error::MigrationFailed { ref version, ref reason } if version == "002_broken" && reason == "boom"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entries = migrator.store().list_entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].version, "002_broken");
        assert_eq!(entries[1].status, "failed");
        assert_eq!(entries[1].attempts, 1);
        assert_eq!(entries[1].error_msg.as_deref(), Some("boom"));

        // The lease is released on the failure path too
        assert_eq!(migrator.store().count_active_locks(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_up_rejects_duplicate_registration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut migrator = SqliteMigrator::new(test_pool().await, test_config()).unwrap();
        migrator.register(counting("001_a", Arc::clone(&calls))).unwrap();

        let err = migrator
            .register(counting("001_a", Arc::clone(&calls)))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateVersion { .. }));
    }

    #[tokio::test]
    async fn test_up_times_out_when_lease_held() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut migrator = SqliteMigrator::new(test_pool().await, test_config()).unwrap();
        migrator.register(counting("001_a", Arc::clone(&calls))).unwrap();
        migrator.store().ensure_tables().await.unwrap();

        let other = MigratorConfig::default().with_instance_id("other-instance");
        let held = Lease::new(Arc::clone(&migrator.store), &other)
            .acquire()
            .await
            .unwrap();

        let err = migrator.up().await.unwrap_err();
        assert!(matches!(err, Error::LeaseWaitTimeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_step_timeout_fails_migration() {
        let config = test_config().with_step_timeout(Duration::from_millis(20));
        let mut migrator = SqliteMigrator::new(test_pool().await, config).unwrap();
        migrator
            .register(SqliteMigration::new("001_slow", "sleeps", |_conn| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), anyhow::Error>(())
                })
            }))
            .unwrap();

        let err = migrator.up().await.unwrap_err();
        match err {
            Error::MigrationFailed { version, reason } => {
                assert_eq!(version, "001_slow");
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_down_without_migrations() {
        let migrator = SqliteMigrator::new(test_pool().await, test_config()).unwrap();
        let err = migrator.down().await.unwrap_err();
        assert!(matches!(err, Error::NothingToRollBack));
    }

    #[tokio::test]
    async fn test_down_irreversible() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut migrator = SqliteMigrator::new(test_pool().await, test_config()).unwrap();
        migrator.register(counting("001_a", Arc::clone(&calls))).unwrap();
        migrator.up().await.unwrap();

        let err = migrator.down().await.unwrap_err();
        assert!(matches!(err, Error::Irreversible { ref version } if version == "001_a"));
        assert_eq!(migrator.store().list_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_down_unknown_version() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut first = SqliteMigrator::new(test_pool().await, test_config()).unwrap();
        first.register(counting("001_a", Arc::clone(&calls))).unwrap();
        first.up().await.unwrap();

        let second = SqliteMigrator::new(first.store().pool().clone(), test_config()).unwrap();
        let err = second.down().await.unwrap_err();
        assert!(matches!(err, Error::UnknownVersion { ref version } if version == "001_a"));
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_ledger() {
        let mut migrator = SqliteMigrator::new(test_pool().await, test_config()).unwrap();
        migrator
            .register(
                SqliteMigration::sql("001_t", "create t", "CREATE TABLE t (id INTEGER);")
                    .with_down_sql("DROP TABLE does_not_exist;"),
            )
            .unwrap();
        migrator.up().await.unwrap();

        let err = migrator.down().await.unwrap_err();
        assert!(matches!(err, Error::RollbackFailed { ref version, .. } if version == "001_t"));

        let entries = migrator.store().list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_completed());
    }
}
