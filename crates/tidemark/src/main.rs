// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tidemark CLI
//!
//! Runs a directory of `<version>.up.sql` / `<version>.down.sql` scripts against
//! PostgreSQL or SQLite. The backend is chosen from the database URL scheme.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{error, info};

use tidemark::config::duration_from_minutes;
use tidemark::{
    MigrationStore, Migrator, MigratorConfig, PostgresMigration, PostgresMigrator,
    ScriptMigration, SqliteMigration, SqliteMigrator,
};

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(about = "Apply, roll back and inspect schema migrations", version)]
struct Cli {
    /// Database URL (postgres://... or sqlite:...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Directory holding the migration scripts
    #[arg(long, env = "TIDEMARK_MIGRATIONS_DIR", default_value = "migrations")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply all pending migrations
    Up,
    /// Roll back the most recently applied migration
    Down,
    /// Show the status of every migration
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Mark migrations stuck in `running` as failed
    Cleanup {
        /// Age in minutes after which a running migration counts as stuck
        #[arg(long, default_value_t = 30)]
        timeout_minutes: u64,
    },
    /// Clear failed migrations and apply pending ones again
    Retry,
    /// Delete every ledger row
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

impl Command {
    fn needs_scripts(&self) -> bool {
        matches!(
            self,
            Command::Up | Command::Down | Command::Status { .. } | Command::Retry
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("tidemark=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = MigratorConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(instance_id = %config.instance_id, "Configuration loaded");

    if let Command::Reset { yes: false } = cli.command {
        bail!("refusing to reset the migration ledger without --yes");
    }

    let scripts = if cli.command.needs_scripts() {
        load_scripts(&cli.dir)?
    } else {
        Vec::new()
    };

    if is_postgres(&cli.database_url) {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&cli.database_url)
            .await?;
        let mut migrator = PostgresMigrator::new(pool, config)?;
        migrator.register_all(scripts.into_iter().map(PostgresMigration::from_script))?;
        execute(&migrator, cli.command).await
    } else {
        let options = SqliteConnectOptions::from_str(&cli.database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let mut migrator = SqliteMigrator::new(pool, config)?;
        migrator.register_all(scripts.into_iter().map(SqliteMigration::from_script))?;
        execute(&migrator, cli.command).await
    }
}

fn is_postgres(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}

fn load_scripts(dir: &Path) -> Result<Vec<ScriptMigration>> {
    let scripts = tidemark::load_dir(dir)?;
    info!(dir = %dir.display(), count = scripts.len(), "Loaded migration scripts");
    Ok(scripts)
}

async fn execute<S>(migrator: &Migrator<S>, command: Command) -> Result<()>
where
    S: MigrationStore,
{
    let outcome = match command {
        Command::Up => migrator
            .up()
            .await
            .map(|applied| println!("Applied {} migration(s)", applied)),
        Command::Down => migrator
            .down()
            .await
            .map(|version| println!("Rolled back {}", version)),
        Command::Status { json } => migrator.status().await.and_then(|report| {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).map_err(std::io::Error::other)?
                );
            } else {
                println!("{}", report);
            }
            Ok(())
        }),
        Command::Cleanup { timeout_minutes } => {
            match duration_from_minutes("timeout_minutes", timeout_minutes) {
                Ok(timeout) => migrator
                    .cleanup_stuck_migrations(timeout)
                    .await
                    .map(|cleaned| println!("Cleaned up {} stuck migration(s)", cleaned)),
                Err(e) => Err(e.into()),
            }
        }
        Command::Retry => migrator
            .retry_failed_migrations()
            .await
            .map(|applied| println!("Applied {} migration(s)", applied)),
        Command::Reset { .. } => migrator
            .reset()
            .await
            .map(|removed| println!("Reset completed. Removed {} migration records", removed)),
    };

    outcome.map_err(|e| {
        error!(code = e.code(), kind = ?e.kind(), "{}", e);
        e.into()
    })
}
