//! Attendee enrollment and lookup.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::{
    clean, conversion_error, from_db_time, from_db_time_opt, to_db_time, unique_violation, Storage,
    QR_INSERT_ATTEMPTS,
};
use crate::error::{Error, Result};
use crate::models::{Attendee, AttendeeFilter, AttendeeStatus, AttendeeUpdate, NewAttendee};

pub(super) const ATTENDEE_COLUMNS: &str = "id, event_id, student_id, full_name, email, phone, \
     organization, qr_code, status, checked_in_at, checked_out_at, created_at, updated_at";

impl Storage {
    /// Enroll one attendee, drawing QR tokens from `next_token` until one is free.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad input, [`Error::Conflict`] if the
    /// student id is already enrolled in the event.
    pub fn add_attendee(
        &self,
        event_id: i64,
        input: &NewAttendee,
        mut next_token: impl FnMut() -> String,
    ) -> Result<Attendee> {
        input.validate()?;
        let id = insert_attendee(&self.conn, event_id, input, &mut next_token)?;
        info!(event_id, attendee_id = id, "Enrolled attendee");
        fetch_attendee(&self.conn, event_id, id)?.ok_or(Error::NotFound { entity: "attendee" })
    }

    /// Enroll several attendees at once. Either all of them are stored or none.
    ///
    /// # Errors
    ///
    /// Fails on the first invalid or duplicate row; nothing is written.
    pub fn add_attendees_bulk(
        &mut self,
        event_id: i64,
        inputs: &[NewAttendee],
        mut next_token: impl FnMut() -> String,
    ) -> Result<Vec<Attendee>> {
        for (index, input) in inputs.iter().enumerate() {
            input
                .validate()
                .map_err(|e| Error::validation(format!("row {}: {e}", index + 1)))?;
        }

        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(inputs.len());
        for input in inputs {
            ids.push(insert_attendee(&tx, event_id, input, &mut next_token)?);
        }

        let mut attendees = Vec::with_capacity(ids.len());
        for id in ids {
            attendees.push(
                fetch_attendee(&tx, event_id, id)?.ok_or(Error::NotFound { entity: "attendee" })?,
            );
        }
        tx.commit()?;

        info!(event_id, count = attendees.len(), "Enrolled attendees in bulk");
        Ok(attendees)
    }

    /// Attendees of an event ordered by name, optionally filtered.
    ///
    /// The text filter is a case-insensitive substring match on student id,
    /// name and e-mail. It folds case in Rust because SQLite's `lower` only
    /// handles ASCII, and Vietnamese names are mostly not.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn list_attendees(&self, event_id: i64, filter: &AttendeeFilter) -> Result<Vec<Attendee>> {
        let sql = format!(
            r"
            SELECT {ATTENDEE_COLUMNS} FROM attendees
            WHERE event_id = ?1
              AND (?2 IS NULL OR status = ?2)
            ORDER BY full_name, student_id
            "
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let attendees = stmt
            .query_map(
                params![event_id, filter.status.map(AttendeeStatus::as_str)],
                row_to_attendee,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let Some(query) = clean(filter.q.as_deref()).map(|q| q.to_lowercase()) else {
            return Ok(attendees);
        };
        Ok(attendees
            .into_iter()
            .filter(|a| matches_query(a, &query))
            .collect())
    }

    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_attendee(&self, event_id: i64, id: i64) -> Result<Option<Attendee>> {
        fetch_attendee(&self.conn, event_id, id)
    }

    /// Look up an attendee by QR token, in any event.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn find_attendee_by_qr(&self, token: &str) -> Result<Option<Attendee>> {
        let sql = format!("SELECT {ATTENDEE_COLUMNS} FROM attendees WHERE qr_code = ?1");
        let attendee = self
            .conn
            .query_row(&sql, [token.trim()], row_to_attendee)
            .optional()?;
        Ok(attendee)
    }

    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn find_attendee_by_student_id(
        &self,
        event_id: i64,
        student_id: &str,
    ) -> Result<Option<Attendee>> {
        let sql = format!(
            "SELECT {ATTENDEE_COLUMNS} FROM attendees WHERE event_id = ?1 AND student_id = ?2"
        );
        let attendee = self
            .conn
            .query_row(&sql, params![event_id, student_id.trim()], row_to_attendee)
            .optional()?;
        Ok(attendee)
    }

    /// Apply a partial update. Empty optional fields are cleared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`], a validation error, or
    /// [`Error::Conflict`] when the new student id is taken.
    pub fn update_attendee(
        &self,
        event_id: i64,
        id: i64,
        update: &AttendeeUpdate,
    ) -> Result<Attendee> {
        update.validate()?;
        let current = self
            .get_attendee(event_id, id)?
            .ok_or(Error::NotFound { entity: "attendee" })?;

        let student_id = update
            .student_id
            .as_deref()
            .map_or(current.student_id, |s| s.trim().to_string());
        let full_name = update
            .full_name
            .as_deref()
            .map_or(current.full_name, |s| s.trim().to_string());
        let email = match &update.email {
            Some(v) => clean(Some(v.as_str())),
            None => current.email,
        };
        let phone = match &update.phone {
            Some(v) => clean(Some(v.as_str())),
            None => current.phone,
        };
        let organization = match &update.organization {
            Some(v) => clean(Some(v.as_str())),
            None => current.organization,
        };

        let result = self.conn.execute(
            r"
            UPDATE attendees
            SET student_id = ?1, full_name = ?2, email = ?3, phone = ?4,
                organization = ?5, updated_at = ?6
            WHERE id = ?7 AND event_id = ?8
            ",
            params![
                student_id,
                full_name,
                email,
                phone,
                organization,
                to_db_time(Utc::now()),
                id,
                event_id
            ],
        );
        if let Err(e) = result {
            return Err(match unique_violation(&e) {
                Some(_) => duplicate_student(&student_id),
                None => e.into(),
            });
        }

        self.get_attendee(event_id, id)?
            .ok_or(Error::NotFound { entity: "attendee" })
    }

    /// Remove an attendee, returning the removed record. Log rows are kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown attendee.
    pub fn delete_attendee(&self, event_id: i64, id: i64) -> Result<Attendee> {
        let attendee = self
            .get_attendee(event_id, id)?
            .ok_or(Error::NotFound { entity: "attendee" })?;
        self.conn.execute(
            "DELETE FROM attendees WHERE id = ?1 AND event_id = ?2",
            params![id, event_id],
        )?;
        info!(event_id, attendee_id = id, "Removed attendee");
        Ok(attendee)
    }

    /// Issue a fresh QR token; the old one stops working immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown attendee, or an internal
    /// error if no free token was found.
    pub fn regenerate_qr(
        &self,
        event_id: i64,
        id: i64,
        mut next_token: impl FnMut() -> String,
    ) -> Result<Attendee> {
        if self.get_attendee(event_id, id)?.is_none() {
            return Err(Error::NotFound { entity: "attendee" });
        }

        for attempt in 1..=QR_INSERT_ATTEMPTS {
            let token = next_token();
            let result = self.conn.execute(
                "UPDATE attendees SET qr_code = ?1, updated_at = ?2 WHERE id = ?3 AND event_id = ?4",
                params![token, to_db_time(Utc::now()), id, event_id],
            );
            match result {
                Ok(_) => {
                    info!(event_id, attendee_id = id, "Regenerated QR token");
                    return self
                        .get_attendee(event_id, id)?
                        .ok_or(Error::NotFound { entity: "attendee" });
                }
                Err(e) if unique_violation(&e).is_some_and(|c| c.contains("qr_code")) => {
                    warn!(attempt, "QR token collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::internal("could not allocate a unique QR token"))
    }
}

fn insert_attendee(
    conn: &Connection,
    event_id: i64,
    input: &NewAttendee,
    next_token: &mut impl FnMut() -> String,
) -> Result<i64> {
    let now = to_db_time(Utc::now());
    let student_id = input.student_id.trim();

    for attempt in 1..=QR_INSERT_ATTEMPTS {
        let token = next_token();
        let result = conn.execute(
            r"
            INSERT INTO attendees (event_id, student_id, full_name, email, phone, organization,
                                   qr_code, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)
            ",
            params![
                event_id,
                student_id,
                input.full_name.trim(),
                clean(input.email.as_deref()),
                clean(input.phone.as_deref()),
                clean(input.organization.as_deref()),
                token,
                now,
            ],
        );

        match result {
            Ok(_) => return Ok(conn.last_insert_rowid()),
            Err(e) => match unique_violation(&e) {
                Some(cols) if cols.contains("qr_code") => {
                    warn!(attempt, "QR token collision, retrying");
                }
                Some(_) => return Err(duplicate_student(student_id)),
                None => return Err(e.into()),
            },
        }
    }

    Err(Error::internal("could not allocate a unique QR token"))
}

/// `query` must already be lowercase.
fn matches_query(attendee: &Attendee, query: &str) -> bool {
    [
        Some(attendee.student_id.as_str()),
        Some(attendee.full_name.as_str()),
        attendee.email.as_deref(),
    ]
    .into_iter()
    .flatten()
    .any(|field| field.to_lowercase().contains(query))
}

fn duplicate_student(student_id: &str) -> Error {
    debug!(student_id, "Duplicate enrollment");
    Error::conflict(format!("student id {student_id} is already enrolled in this event"))
}

pub(super) fn fetch_attendee(conn: &Connection, event_id: i64, id: i64) -> Result<Option<Attendee>> {
    let sql = format!("SELECT {ATTENDEE_COLUMNS} FROM attendees WHERE id = ?1 AND event_id = ?2");
    let attendee = conn
        .query_row(&sql, params![id, event_id], row_to_attendee)
        .optional()?;
    Ok(attendee)
}

pub(super) fn row_to_attendee(row: &Row) -> rusqlite::Result<Attendee> {
    let status: String = row.get(8)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    Ok(Attendee {
        id: row.get(0)?,
        event_id: row.get(1)?,
        student_id: row.get(2)?,
        full_name: row.get(3)?,
        email: row.get(4)?,
        phone: row.get(5)?,
        organization: row.get(6)?,
        qr_code: row.get(7)?,
        status: status.parse().map_err(|e| conversion_error(8, e))?,
        checked_in_at: from_db_time_opt(9, row.get(9)?)?,
        checked_out_at: from_db_time_opt(10, row.get(10)?)?,
        created_at: from_db_time(11, &created_at)?,
        updated_at: from_db_time(12, &updated_at)?,
    })
}
