// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cooperative lease lock serializing migration runs across instances.
//!
//! The lease table holds at most one row. An instance takes the lease by
//! inserting that row and gives it back by deleting it. A crashed holder never
//! deletes its row, so every acquisition first purges rows whose `expires_at`
//! has passed.
//!
//! The lease keeps concurrent runners from doing duplicate work. It is not the
//! only guard: the runner re-checks the ledger inside each unit's transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, MigratorConfig};
use crate::error::{Error, Result};
use crate::ledger::LockRecord;
use crate::store::MigrationStore;

/// Lease operations for one instance.
pub struct Lease<S: MigrationStore> {
    store: Arc<S>,
    holder: String,
    duration: Duration,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl<S: MigrationStore> Lease<S> {
    /// Create lease operations for the instance named in `config`.
    pub fn new(store: Arc<S>, config: &MigratorConfig) -> Self {
        Self {
            store,
            holder: config.instance_id.clone(),
            duration: config.lease_duration,
            poll_interval: config.poll_interval,
            wait_timeout: config.wait_timeout,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try to take the lease once.
    ///
    /// Returns [`Error::LeaseHeld`] with the holder's identifier when another
    /// live row exists.
    pub async fn acquire(&self) -> Result<LeaseGuard<S>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.duration)
            .map_err(|_| ConfigError::Invalid("lease_duration", "is out of range"))?;

        let purged = self.store.purge_expired_locks(now).await?;
        if purged > 0 {
            warn!(purged, "Reclaimed expired migration lock");
        }

        let record = LockRecord::new(&self.holder, now, lease);
        let mut tx = self.store.begin_unit().await?;

        if self.store.insert_lock(&mut *tx, &record).await? {
            tx.commit().await?;
            info!(
                holder = %self.holder,
                expires_at = %record.expires_at,
                "Acquired migration lock"
            );
            return Ok(LeaseGuard {
                store: Arc::clone(&self.store),
                holder: self.holder.clone(),
                released: false,
            });
        }

        let holder = self
            .store
            .current_lock(&mut *tx)
            .await?
            .map(|lock| lock.locked_by)
            .unwrap_or_else(|| "unknown".to_string());
        tx.rollback().await?;

        Err(Error::LeaseHeld { holder })
    }

    /// Poll until no live lease row remains, or `timeout` passes.
    pub async fn wait_for_release(&self, timeout: Duration) -> Result<()> {
        let poll = async {
            let mut ticker = tokio::time::interval(self.poll_interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let active = self.store.count_active_locks(Utc::now()).await?;
                if active == 0 {
                    return Ok::<(), Error>(());
                }
                debug!(active, "Migration lock still held");
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::LeaseWaitTimeout { waited: timeout }),
        }
    }

    /// Take the lease, waiting for other holders within the configured deadline.
    ///
    /// After a release is observed the lease is acquired again rather than
    /// assumed; another waiter may have won it first.
    pub async fn acquire_or_wait(&self) -> Result<LeaseGuard<S>> {
        let deadline = Instant::now() + self.wait_timeout;

        loop {
            let holder = match self.acquire().await {
                Ok(guard) => return Ok(guard),
                Err(Error::LeaseHeld { holder }) => holder,
                Err(e) => return Err(e),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::LeaseWaitTimeout {
                    waited: self.wait_timeout,
                });
            }

            info!(
                holder = %holder,
                timeout = ?remaining,
                "Migration lock held by another instance, waiting for release"
            );
            match self.wait_for_release(remaining).await {
                Ok(()) => info!("Migration lock released, retrying acquisition"),
                Err(Error::LeaseWaitTimeout { .. }) => {
                    return Err(Error::LeaseWaitTimeout {
                        waited: self.wait_timeout,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Scoped ownership of the lease.
///
/// Call [`LeaseGuard::release`] to give the lease back and learn whether it was
/// still held. A guard dropped without that call (error path, panic, cancelled
/// future) releases in a task on the current tokio runtime; without a runtime the
/// row is left to expire.
#[must_use = "the lease is released as soon as the guard is dropped"]
pub struct LeaseGuard<S: MigrationStore> {
    store: Arc<S>,
    holder: String,
    released: bool,
}

impl<S: MigrationStore> std::fmt::Debug for LeaseGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("holder", &self.holder)
            .field("released", &self.released)
            .finish()
    }
}

impl<S: MigrationStore> LeaseGuard<S> {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Delete this instance's lease row.
    ///
    /// Fails with [`Error::LeaseNotHeld`] when the row is gone, which means the
    /// lease expired and may have been reclaimed by another instance mid-run.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let deleted = self.store.release_lock(&self.holder).await?;
        if deleted == 0 {
            return Err(Error::LeaseNotHeld {
                holder: self.holder.clone(),
            });
        }
        info!(holder = %self.holder, "Released migration lock");
        Ok(())
    }
}

impl<S: MigrationStore> Drop for LeaseGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = Arc::clone(&self.store);
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match store.release_lock(&holder).await {
                        Ok(deleted) => {
                            debug!(holder = %holder, deleted, "Released migration lock on drop")
                        }
                        Err(e) => {
                            warn!(holder = %holder, error = %e, "Failed to release migration lock on drop")
                        }
                    }
                });
            }
            Err(_) => {
                warn!(holder = %holder, "No async runtime; migration lock will expire on its own");
            }
        }
    }
}
