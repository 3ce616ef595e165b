// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tidemark integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use tidemark::{MigratorConfig, SqliteMigration};

/// Single-connection in-memory database that lives as long as the pool.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}

/// Pool over a database file, so several pools can share one database.
pub async fn file_pool(path: &Path) -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(10));
    SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .expect("Failed to open SQLite database file")
}

/// Config with short lease timings for tests.
pub fn fast_config(instance_id: &str) -> MigratorConfig {
    MigratorConfig::default()
        .with_instance_id(instance_id)
        .with_wait(Duration::from_millis(10), Duration::from_secs(5))
}

/// Shared per-version invocation counter.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Migration that creates `table` on the way up and drops it on the way down.
pub fn create_table(version: &str, table: &str, calls: Calls) -> SqliteMigration {
    let up_sql = format!("CREATE TABLE {} (id INTEGER PRIMARY KEY)", table);
    let down_sql = format!("DROP TABLE {}", table);

    SqliteMigration::new(version, format!("create {}", table), move |conn| {
        calls.hit();
        let sql = up_sql.clone();
        Box::pin(async move {
            sqlx::query(&sql).execute(&mut *conn).await?;
            Ok::<(), anyhow::Error>(())
        })
    })
    .with_down(move |conn| {
        let sql = down_sql.clone();
        Box::pin(async move {
            sqlx::query(&sql).execute(&mut *conn).await?;
            Ok::<(), anyhow::Error>(())
        })
    })
}

/// Migration that creates `table`, then sleeps inside its transaction.
pub fn slow_create_table(version: &str, table: &str, delay: Duration, calls: Calls) -> SqliteMigration {
    let up_sql = format!("CREATE TABLE {} (id INTEGER PRIMARY KEY)", table);

    SqliteMigration::new(version, format!("create {} slowly", table), move |conn| {
        calls.hit();
        let sql = up_sql.clone();
        Box::pin(async move {
            sqlx::query(&sql).execute(&mut *conn).await?;
            tokio::time::sleep(delay).await;
            Ok::<(), anyhow::Error>(())
        })
    })
}

pub async fn table_exists(pool: &SqlitePool, table: &str) -> bool {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(pool)
            .await
            .expect("Failed to query sqlite_master");
    count > 0
}
