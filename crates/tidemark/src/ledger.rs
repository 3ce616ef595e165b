// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted record types for the ledger and lease tables.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key of the single lease row.
pub const LEASE_ROW_ID: i64 = 1;

/// Lifecycle status of a migration.
///
/// `Pending` is never stored; a version without a ledger row is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a stored status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the ledger table.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct LedgerEntry {
    /// Surrogate key.
    pub id: i64,
    /// Migration version, unique.
    pub version: String,
    /// Description at the time of the attempt.
    pub description: Option<String>,
    /// When the migration completed. NULL until then.
    pub applied_at: Option<DateTime<Utc>>,
    /// When the latest attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// Integrity token of the unit that was applied.
    pub checksum: Option<String>,
    /// Raw status string (running, completed, failed).
    pub status: String,
    /// Number of attempts since the row was created.
    pub attempts: i32,
    /// Error text of the latest failure.
    pub error_msg: Option<String>,
}

impl LedgerEntry {
    /// Parsed status, `None` for values tidemark does not write.
    pub fn parsed_status(&self) -> Option<MigrationStatus> {
        MigrationStatus::parse(&self.status)
    }

    pub fn is_completed(&self) -> bool {
        self.status == MigrationStatus::Completed.as_str()
    }
}

/// The lease row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LockRecord {
    pub id: i64,
    pub locked_at: DateTime<Utc>,
    /// Instance identifier of the holder.
    pub locked_by: String,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// Build the row an instance inserts when it takes the lease.
    pub fn new(holder: &str, now: DateTime<Utc>, lease: chrono::Duration) -> Self {
        Self {
            id: LEASE_ROW_ID,
            locked_at: now,
            locked_by: holder.to_string(),
            expires_at: now + lease,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Identity of one attempt at applying a migration.
#[derive(Debug, Clone, Copy)]
pub struct EntryStart<'a> {
    pub version: &'a str,
    pub description: &'a str,
    pub checksum: &'a str,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            MigrationStatus::Pending,
            MigrationStatus::Running,
            MigrationStatus::Completed,
            MigrationStatus::Failed,
        ] {
            assert_eq!(MigrationStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.to_string(), status.as_str());
        }
        assert_eq!(MigrationStatus::parse("COMPLETED"), None);
        assert_eq!(MigrationStatus::parse(""), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&MigrationStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
    }

    #[test]
    fn test_lock_record_expiry() {
        let now = Utc::now();
        let lock = LockRecord::new("migrator-a", now, chrono::Duration::minutes(30));

        assert_eq!(lock.id, LEASE_ROW_ID);
        assert_eq!(lock.locked_by, "migrator-a");
        assert!(!lock.is_expired(now));
        assert!(lock.is_expired(now + chrono::Duration::minutes(30)));
    }
}
