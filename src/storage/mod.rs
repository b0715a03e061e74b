//! Storage layer for events, attendees and the check-in log.
//!
//! All data lives in one `SQLite` database. The HTTP layer shares a single
//! [`Storage`] behind a mutex; status transitions run in a transaction
//! together with the log row they produce.

mod attendees;
mod checkins;
mod events;
pub mod migrations;
pub mod schema;
mod users;

use std::fmt::Display;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use checkins::TransitionOutcome;
pub use users::OidcIdentity;

/// How many times a colliding QR token is regenerated before giving up.
const QR_INSERT_ATTEMPTS: usize = 5;

/// Persistent storage for the attendance service.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::prepare(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        Self::prepare(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    fn prepare(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::migrate(conn)
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Format a timestamp for storage; fixed width so text order is time order.
pub(crate) fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn from_db_time_opt(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| from_db_time(idx, &s)).transpose()
}

pub(crate) fn conversion_error(idx: usize, err: impl Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        err.to_string().into(),
    )
}

/// Name of the column set behind a UNIQUE violation, if that is what failed.
pub(crate) fn unique_violation(err: &rusqlite::Error) -> Option<&str> {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(message))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            Some(
                message
                    .strip_prefix("UNIQUE constraint failed: ")
                    .unwrap_or(message.as_str()),
            )
        }
        _ => None,
    }
}

/// Trim an optional text field, turning blanks into `None`.
pub(crate) fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::NaiveDate;

    use super::Storage;
    use crate::models::{Event, EventInput, NewAttendee, User};

    pub fn storage() -> Storage {
        Storage::open_in_memory().expect("failed to create test storage")
    }

    pub fn user(storage: &Storage, username: &str) -> User {
        storage
            .create_user(
                username,
                Some(&format!("{username}@example.edu.vn")),
                username,
                Some("hash"),
            )
            .expect("failed to create user")
    }

    pub fn event(storage: &Storage, owner: &User) -> Event {
        storage
            .create_event(
                owner.id,
                &EventInput {
                    name: "Hội thảo AI".to_string(),
                    description: None,
                    location: Some("Hội trường A".to_string()),
                    event_date: NaiveDate::from_ymd_opt(2024, 5, 20).unwrap(),
                    start_time: Some("08:00".to_string()),
                    end_time: Some("11:30".to_string()),
                },
            )
            .expect("failed to create event")
    }

    pub fn new_attendee(student_id: &str, name: &str) -> NewAttendee {
        NewAttendee {
            student_id: student_id.to_string(),
            full_name: name.to_string(),
            ..NewAttendee::default()
        }
    }

    /// Deterministic token source for tests.
    pub fn tokens() -> impl FnMut() -> String {
        let mut n = 0;
        move || {
            n += 1;
            format!("TOKEN{n:05}")
        }
    }
}
