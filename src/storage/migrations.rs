//! Ordered schema steps.
//!
//! Each [`Migration`] runs once, inside its own transaction, and bumps the
//! `schema_version` row in `metadata`. A fresh database replays the whole
//! list; an existing one only the steps it has not seen.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::schema::{BASE_TABLES, CREATE_METADATA_TABLE, LOOKUP_INDEXES};

const VERSION_KEY: &str = "schema_version";

struct Migration {
    version: u32,
    description: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "accounts, events, collaborators, attendees and check-in log",
        statements: BASE_TABLES,
    },
    Migration {
        version: 2,
        description: "lookup indexes for dashboards, sharing and logs",
        statements: LOOKUP_INDEXES,
    },
];

/// Version a fully migrated database reports.
pub const CURRENT_VERSION: u32 = MIGRATIONS[MIGRATIONS.len() - 1].version;

/// Bring the schema up to [`CURRENT_VERSION`].
///
/// # Errors
///
/// Returns [`Error::DatabaseMigration`] if the file was written by a newer
/// build or holds a garbled version, and a database error if a step fails.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(CREATE_METADATA_TABLE, [])?;

    let version = schema_version(conn)?;
    if version > CURRENT_VERSION {
        return Err(Error::DatabaseMigration {
            message: format!(
                "database schema version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        });
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > version) {
        apply(conn, migration)?;
    }
    Ok(())
}

fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for statement in migration.statements {
        tx.execute(statement, [])?;
    }
    tx.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        (VERSION_KEY, migration.version.to_string()),
    )?;
    tx.commit()?;

    info!(
        version = migration.version,
        description = migration.description,
        "Applied schema migration"
    );
    Ok(())
}

/// 0 for a database that has never been migrated.
fn schema_version(conn: &Connection) -> Result<u32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;
    debug!(?value, "Stored schema version");

    match value {
        None => Ok(0),
        Some(value) => value.parse().map_err(|_| Error::DatabaseMigration {
            message: format!("invalid schema version: {value}"),
        }),
    }
}
