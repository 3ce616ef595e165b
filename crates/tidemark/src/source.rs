// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Migrations loaded from a directory of SQL scripts.
//!
//! Layout:
//!
//! ```text
//! migrations/
//!   001_create_users.up.sql
//!   001_create_users.down.sql     (optional)
//!   002_add_sessions.up.sql
//! ```
//!
//! The version is the file name without the `.up.sql` / `.down.sql` suffix. A
//! leading `-- description: ...` comment in the up script sets the description;
//! otherwise it is derived from the version.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";
const DESCRIPTION_PREFIX: &str = "-- description:";

/// A migration read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptMigration {
    pub version: String,
    pub description: String,
    pub up_sql: String,
    pub down_sql: Option<String>,
    /// Path of the up script.
    pub path: PathBuf,
}

#[derive(Default)]
struct Pair {
    up: Option<PathBuf>,
    down: Option<PathBuf>,
}

/// Load every migration script in `dir`, sorted by version.
///
/// Files without a `.up.sql` or `.down.sql` suffix are ignored.
pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<ScriptMigration>> {
    let dir = dir.as_ref();
    let mut pairs: BTreeMap<String, Pair> = BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if let Some(version) = name.strip_suffix(UP_SUFFIX) {
            check_version(version, &path)?;
            pairs.entry(version.to_string()).or_default().up = Some(path.clone());
        } else if let Some(version) = name.strip_suffix(DOWN_SUFFIX) {
            check_version(version, &path)?;
            pairs.entry(version.to_string()).or_default().down = Some(path.clone());
        }
    }

    let mut scripts = Vec::with_capacity(pairs.len());
    for (version, pair) in pairs {
        let Some(up_path) = pair.up else {
            let path = pair.down.unwrap_or_else(|| dir.to_path_buf());
            return Err(Error::Source {
                path,
                reason: format!("no matching {}{}", version, UP_SUFFIX),
            });
        };

        let up_sql = std::fs::read_to_string(&up_path)?;
        let down_sql = match pair.down {
            Some(down_path) => Some(std::fs::read_to_string(down_path)?),
            None => None,
        };
        let description =
            description_comment(&up_sql).unwrap_or_else(|| description_from_version(&version));

        scripts.push(ScriptMigration {
            version,
            description,
            up_sql,
            down_sql,
            path: up_path,
        });
    }

    Ok(scripts)
}

fn check_version(version: &str, path: &Path) -> Result<()> {
    if version.is_empty() || version.chars().any(char::is_whitespace) {
        return Err(Error::Source {
            path: path.to_path_buf(),
            reason: "file name must start with a version without whitespace".to_string(),
        });
    }
    Ok(())
}

/// Text of a `-- description:` comment among the script's leading comment lines.
fn description_comment(sql: &str) -> Option<String> {
    sql.lines()
        .map(str::trim)
        .take_while(|line| line.is_empty() || line.starts_with("--"))
        .find_map(|line| line.strip_prefix(DESCRIPTION_PREFIX))
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// `001_create_users` becomes `create users`.
fn description_from_version(version: &str) -> String {
    let rest = version
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .trim_start_matches(['_', '-']);
    if rest.is_empty() {
        version.to_string()
    } else {
        rest.replace(['_', '-'], " ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_dir_pairs_scripts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("002_add_sessions.up.sql"),
            "CREATE TABLE sessions (id INTEGER);",
        )
        .unwrap();
        fs::write(
            dir.path().join("001_create_users.up.sql"),
            "-- description: Create the users table\nCREATE TABLE users (id INTEGER);",
        )
        .unwrap();
        fs::write(
            dir.path().join("001_create_users.down.sql"),
            "DROP TABLE users;",
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let scripts = load_dir(dir.path()).unwrap();
        assert_eq!(scripts.len(), 2);

        assert_eq!(scripts[0].version, "001_create_users");
        assert_eq!(scripts[0].description, "Create the users table");
        assert_eq!(scripts[0].down_sql.as_deref(), Some("DROP TABLE users;"));

        assert_eq!(scripts[1].version, "002_add_sessions");
        assert_eq!(scripts[1].description, "add sessions");
        assert!(scripts[1].down_sql.is_none());
    }

    #[test]
    fn test_down_without_up_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("003_orphan.down.sql"), "DROP TABLE x;").unwrap();

        let err = load_dir(dir.path()).unwrap_err();
        match err {
            Error::Source { path, reason } => {
                assert!(path.ends_with("003_orphan.down.sql"));
                assert!(reason.contains("003_orphan.up.sql"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_dir(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_description_from_version() {
        assert_eq!(description_from_version("001_create_users"), "create users");
        assert_eq!(description_from_version("20240101-add-index"), "add index");
        assert_eq!(description_from_version("007"), "007");
    }

    #[test]
    fn test_description_comment_only_in_header() {
        assert_eq!(
            description_comment("\n-- author: ops\n-- description:  add index \nCREATE INDEX i ON t (c);"),
            Some("add index".to_string())
        );
        assert_eq!(
            description_comment("CREATE TABLE t (c INTEGER);\n-- description: too late"),
            None
        );
    }
}
