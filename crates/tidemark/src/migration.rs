// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Migration units and the ordered registry.
//!
//! A [`Migration`] is an opaque forward step plus an optional backward step. Both
//! receive the connection of the transaction the runner opened for them, so
//! whatever they execute commits or rolls back together with the ledger update.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A forward or backward migration step.
///
/// The step borrows the transaction's connection for the duration of the
/// returned future.
pub type MigrationFn<DB> = Arc<
    dyn for<'c> Fn(&'c mut <DB as sqlx::Database>::Connection) -> BoxFuture<'c, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// One named migration unit.
pub struct Migration<DB: sqlx::Database> {
    version: String,
    description: String,
    checksum: String,
    up: MigrationFn<DB>,
    down: Option<MigrationFn<DB>>,
}

impl<DB: sqlx::Database> Clone for Migration<DB> {
    fn clone(&self) -> Self {
        Self {
            version: self.version.clone(),
            description: self.description.clone(),
            checksum: self.checksum.clone(),
            up: Arc::clone(&self.up),
            down: self.down.clone(),
        }
    }
}

impl<DB: sqlx::Database> fmt::Debug for Migration<DB> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("checksum", &self.checksum)
            .field("reversible", &self.is_reversible())
            .finish()
    }
}

impl<DB: sqlx::Database> Migration<DB> {
    /// Create a migration with a forward step.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let m = SqliteMigration::new("001_create_users", "create users table", |conn| {
    ///     Box::pin(async move {
    ///         sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY)")
    ///             .execute(&mut *conn)
    ///             .await?;
    ///         Ok::<(), anyhow::Error>(())
    ///     })
    /// });
    /// ```
    pub fn new<F>(version: impl Into<String>, description: impl Into<String>, up: F) -> Self
    where
        F: for<'c> Fn(&'c mut DB::Connection) -> BoxFuture<'c, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let version = version.into();
        let description = description.into();
        let checksum = checksum(&version, &description, "");
        Self {
            version,
            description,
            checksum,
            up: Arc::new(up),
            down: None,
        }
    }

    /// Attach a backward step, making the migration reversible.
    pub fn with_down<F>(mut self, down: F) -> Self
    where
        F: for<'c> Fn(&'c mut DB::Connection) -> BoxFuture<'c, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.down = Some(Arc::new(down));
        self
    }

    /// Fold extra text, typically the forward SQL, into the integrity token.
    pub fn with_checksum_source(mut self, source: &str) -> Self {
        self.checksum = checksum(&self.version, &self.description, source);
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Integrity token recorded in the ledger.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    pub(crate) fn up_fn(&self) -> &MigrationFn<DB> {
        &self.up
    }

    pub(crate) fn down_fn(&self) -> Option<&MigrationFn<DB>> {
        self.down.as_ref()
    }
}

/// Compute the integrity token for a migration.
///
/// Lowercase hex SHA-256 over `version`, `description` and `source`. With an empty
/// source the token only fingerprints the name of the unit; it cannot tell that a
/// closure's body changed.
pub fn checksum(version: &str, description: &str, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.as_bytes());
    hasher.update(description.as_bytes());
    hasher.update(source.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Ordered catalog of migrations, sorted ascending by version.
pub struct MigrationRegistry<DB: sqlx::Database> {
    migrations: Vec<Migration<DB>>,
}

impl<DB: sqlx::Database> Default for MigrationRegistry<DB> {
    fn default() -> Self {
        Self {
            migrations: Vec::new(),
        }
    }
}

impl<DB: sqlx::Database> fmt::Debug for MigrationRegistry<DB> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.migrations.iter()).finish()
    }
}

impl<DB: sqlx::Database> MigrationRegistry<DB> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a migration, keeping the registry sorted.
    ///
    /// Fails with [`Error::DuplicateVersion`] if the version is already present.
    pub fn register(&mut self, migration: Migration<DB>) -> Result<()> {
        match self
            .migrations
            .binary_search_by(|m| m.version.as_str().cmp(migration.version()))
        {
            Ok(_) => Err(Error::DuplicateVersion {
                version: migration.version,
            }),
            Err(pos) => {
                self.migrations.insert(pos, migration);
                Ok(())
            }
        }
    }

    /// Add several migrations. Stops at the first duplicate.
    pub fn register_all(&mut self, migrations: impl IntoIterator<Item = Migration<DB>>) -> Result<()> {
        for migration in migrations {
            self.register(migration)?;
        }
        Ok(())
    }

    pub fn get(&self, version: &str) -> Option<&Migration<DB>> {
        self.migrations
            .binary_search_by(|m| m.version.as_str().cmp(version))
            .ok()
            .map(|idx| &self.migrations[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration<DB>> {
        self.migrations.iter()
    }

    pub fn as_slice(&self) -> &[Migration<DB>] {
        &self.migrations
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
