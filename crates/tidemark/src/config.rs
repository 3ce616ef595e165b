// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Migrator configuration.
//!
//! Everything the runner needs is passed explicitly at construction time; there is
//! no process-wide state. [`MigratorConfig::from_env`] is a convenience for hosts
//! that configure through environment variables.

use std::time::Duration;

use uuid::Uuid;

/// Default name of the ledger table.
pub const DEFAULT_LEDGER_TABLE: &str = "migrations";

/// Default name of the lease table.
pub const DEFAULT_LOCK_TABLE: &str = "migration_locks";

const MAX_IDENTIFIER_LEN: usize = 63;

/// Names of the two orchestration tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// Ledger table, one row per attempted migration.
    pub ledger: String,
    /// Lease table, at most one live row.
    pub lock: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            ledger: DEFAULT_LEDGER_TABLE.to_string(),
            lock: DEFAULT_LOCK_TABLE.to_string(),
        }
    }
}

impl TableNames {
    /// Check that both names are plain SQL identifiers.
    ///
    /// The names are spliced into SQL text, so anything beyond
    /// `[A-Za-z_][A-Za-z0-9_]*` is rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_identifier(&self.ledger) {
            return Err(ConfigError::Invalid(
                "ledger_table",
                "must be a plain SQL identifier",
            ));
        }
        if !is_identifier(&self.lock) {
            return Err(ConfigError::Invalid(
                "lock_table",
                "must be a plain SQL identifier",
            ));
        }
        if self.ledger.eq_ignore_ascii_case(&self.lock) {
            return Err(ConfigError::Invalid(
                "lock_table",
                "must differ from the ledger table",
            ));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Migration runner configuration.
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Orchestration table names.
    pub tables: TableNames,
    /// Identifier written into the lease row; unique per process instance.
    pub instance_id: String,
    /// How long an acquired lease stays valid before others may reclaim it.
    pub lease_duration: Duration,
    /// Interval between lease-release checks while waiting.
    pub poll_interval: Duration,
    /// Overall deadline for waiting on another instance's lease.
    pub wait_timeout: Duration,
    /// Age after which a `running` ledger row is considered stuck.
    pub stuck_timeout: Duration,
    /// Optional deadline for a single forward or backward step.
    pub step_timeout: Option<Duration>,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            tables: TableNames::default(),
            instance_id: generate_instance_id(),
            lease_duration: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(10 * 60),
            stuck_timeout: Duration::from_secs(30 * 60),
            step_timeout: None,
        }
    }
}

/// Generate a fresh instance identifier (`migrator-<uuid>`).
pub fn generate_instance_id() -> String {
    format!("migrator-{}", Uuid::new_v4())
}

impl MigratorConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TIDEMARK_LEDGER_TABLE`: ledger table name (default: `migrations`)
    /// - `TIDEMARK_LOCK_TABLE`: lease table name (default: `migration_locks`)
    /// - `TIDEMARK_INSTANCE_ID`: lease holder identifier (default: `migrator-<uuid>`)
    /// - `TIDEMARK_LEASE_MINUTES`: lease duration (default: 30)
    /// - `TIDEMARK_POLL_INTERVAL_SECS`: lease poll interval (default: 5)
    /// - `TIDEMARK_WAIT_TIMEOUT_SECS`: lease wait deadline (default: 600)
    /// - `TIDEMARK_STUCK_TIMEOUT_MINUTES`: stuck migration threshold (default: 30)
    /// - `TIDEMARK_STEP_TIMEOUT_SECS`: per-step deadline (default: none)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let tables = TableNames {
            ledger: std::env::var("TIDEMARK_LEDGER_TABLE").unwrap_or(defaults.tables.ledger),
            lock: std::env::var("TIDEMARK_LOCK_TABLE").unwrap_or(defaults.tables.lock),
        };

        let instance_id = std::env::var("TIDEMARK_INSTANCE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.instance_id);

        let lease_minutes = positive_u64("TIDEMARK_LEASE_MINUTES", 30)?;
        let poll_secs = positive_u64("TIDEMARK_POLL_INTERVAL_SECS", 5)?;
        let wait_secs = positive_u64("TIDEMARK_WAIT_TIMEOUT_SECS", 600)?;
        let stuck_minutes = positive_u64("TIDEMARK_STUCK_TIMEOUT_MINUTES", 30)?;

        let step_timeout = match std::env::var("TIDEMARK_STEP_TIMEOUT_SECS") {
            Ok(v) => Some(Duration::from_secs(parse_positive(
                "TIDEMARK_STEP_TIMEOUT_SECS",
                &v,
            )?)),
            Err(_) => None,
        };

        let config = Self {
            tables,
            instance_id,
            lease_duration: duration_from_minutes("TIDEMARK_LEASE_MINUTES", lease_minutes)?,
            poll_interval: Duration::from_secs(poll_secs),
            wait_timeout: Duration::from_secs(wait_secs),
            stuck_timeout: duration_from_minutes("TIDEMARK_STUCK_TIMEOUT_MINUTES", stuck_minutes)?,
            step_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the runner relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tables.validate()?;
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Invalid("instance_id", "must not be empty"));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Invalid("lease_duration", "must be positive"));
        }
        if chrono::Duration::from_std(self.lease_duration).is_err() {
            return Err(ConfigError::Invalid("lease_duration", "is out of range"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval", "must be positive"));
        }
        if chrono::Duration::from_std(self.stuck_timeout).is_err() {
            return Err(ConfigError::Invalid("stuck_timeout", "is out of range"));
        }
        Ok(())
    }

    /// Use custom table names.
    pub fn with_tables(mut self, ledger: impl Into<String>, lock: impl Into<String>) -> Self {
        self.tables = TableNames {
            ledger: ledger.into(),
            lock: lock.into(),
        };
        self
    }

    /// Use a specific instance identifier.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Set the lease poll interval and the overall wait deadline.
    pub fn with_wait(mut self, poll_interval: Duration, wait_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.wait_timeout = wait_timeout;
        self
    }

    /// Set the stuck-migration threshold.
    pub fn with_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    /// Bound every forward and backward step by `timeout`.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }
}

/// Convert a minute count into a [`Duration`], rejecting counts whose seconds
/// overflow `u64`.
pub fn duration_from_minutes(var: &'static str, minutes: u64) -> Result<Duration, ConfigError> {
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or(ConfigError::Invalid(var, "is out of range"))
}

fn positive_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(v) => parse_positive(var, &v),
        Err(_) => Ok(default),
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid(var, "must be a positive integer")),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
