// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-only status report joining the registry against the ledger.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::ledger::{LedgerEntry, MigrationStatus};
use crate::migrator::Migrator;
use crate::store::MigrationStore;

const MAX_ERROR_LEN: usize = 50;

/// Status of one registered migration.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub version: String,
    pub description: String,
    pub status: MigrationStatus,
    /// `None` for pending migrations.
    pub attempts: Option<i32>,
    pub applied_at: Option<DateTime<Utc>>,
    /// Latest error, truncated for display.
    pub error: Option<String>,
}

/// Counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
}

/// Status of every registered migration, in version order.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub rows: Vec<StatusRow>,
    pub summary: StatusSummary,
}

impl StatusReport {
    fn build<'a>(
        registered: impl Iterator<Item = (&'a str, &'a str)>,
        entries: &[LedgerEntry],
    ) -> Result<Self> {
        let by_version: HashMap<&str, &LedgerEntry> = entries
            .iter()
            .map(|entry| (entry.version.as_str(), entry))
            .collect();

        let mut rows = Vec::new();
        let mut summary = StatusSummary::default();

        for (version, description) in registered {
            let row = match by_version.get(version) {
                Some(entry) => {
                    let status =
                        entry
                            .parsed_status()
                            .ok_or_else(|| Error::InvalidStatus {
                                version: entry.version.clone(),
                                status: entry.status.clone(),
                            })?;
                    StatusRow {
                        version: version.to_string(),
                        description: description.to_string(),
                        status,
                        attempts: Some(entry.attempts),
                        applied_at: entry.applied_at,
                        error: entry
                            .error_msg
                            .as_deref()
                            .filter(|msg| !msg.is_empty())
                            .map(truncate_error),
                    }
                }
                None => StatusRow {
                    version: version.to_string(),
                    description: description.to_string(),
                    status: MigrationStatus::Pending,
                    attempts: None,
                    applied_at: None,
                    error: None,
                },
            };

            match row.status {
                MigrationStatus::Completed => summary.completed += 1,
                MigrationStatus::Failed => summary.failed += 1,
                MigrationStatus::Running => summary.running += 1,
                MigrationStatus::Pending => summary.pending += 1,
            }
            rows.push(row);
        }

        Ok(Self { rows, summary })
    }
}

fn truncate_error(msg: &str) -> String {
    if msg.chars().count() <= MAX_ERROR_LEN {
        return msg.to_string();
    }
    let head: String = msg.chars().take(MAX_ERROR_LEN - 3).collect();
    format!("{}...", head)
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Migration Status:")?;
        writeln!(f, "=================")?;
        writeln!(
            f,
            "{:<30} {:<15} {:<10} {:<20} {}",
            "VERSION", "STATUS", "ATTEMPTS", "APPLIED_AT", "ERROR"
        )?;
        writeln!(f, "{}", "-".repeat(100))?;

        for row in &self.rows {
            let attempts = row
                .attempts
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string());
            let applied_at = row
                .applied_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:<30} {:<15} {:<10} {:<20} {}",
                row.version,
                row.status.as_str().to_uppercase(),
                attempts,
                applied_at,
                row.error.as_deref().unwrap_or("")
            )?;
        }

        writeln!(f, "{}", "-".repeat(100))?;
        write!(
            f,
            "Summary: {} completed, {} failed, {} running, {} pending",
            self.summary.completed, self.summary.failed, self.summary.running, self.summary.pending
        )
    }
}

impl<S: MigrationStore> Migrator<S> {
    /// Report the status of every registered migration. Read-only apart from
    /// creating the orchestration tables when absent.
    pub async fn status(&self) -> Result<StatusReport> {
        self.store.ensure_tables().await?;
        let entries = self.store.list_entries().await?;
        StatusReport::build(
            self.registry.iter().map(|m| (m.version(), m.description())),
            &entries,
        )
    }
}
