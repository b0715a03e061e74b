//! Events and their collaborators.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

use super::{clean, conversion_error, from_db_time, to_db_time, unique_violation, Storage};
use crate::error::{Error, Result};
use crate::models::{Collaborator, Event, EventAccess, EventInput, Permission};

const EVENT_COLUMNS: &str = "e.id, e.owner_id, e.name, e.description, e.location, e.event_date, \
     e.start_time, e.end_time, e.created_at, e.updated_at";

impl Storage {
    /// # Errors
    ///
    /// Returns a validation error for bad input or a database error.
    pub fn create_event(&self, owner_id: i64, input: &EventInput) -> Result<Event> {
        input.validate()?;
        let now = to_db_time(Utc::now());

        self.conn.execute(
            r"
            INSERT INTO events (owner_id, name, description, location, event_date,
                                start_time, end_time, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ",
            params![
                owner_id,
                input.name.trim(),
                clean(input.description.as_deref()),
                clean(input.location.as_deref()),
                input.event_date.to_string(),
                clean(input.start_time.as_deref()),
                clean(input.end_time.as_deref()),
                now,
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        info!(event_id = id, owner_id, "Created event");
        self.get_event(id)?.ok_or(Error::NotFound { entity: "event" })
    }

    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_event(&self, id: i64) -> Result<Option<Event>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events e WHERE e.id = ?1");
        let event = self.conn.query_row(&sql, [id], row_to_event).optional()?;
        Ok(event)
    }

    /// Every event the user owns or collaborates on, newest date first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn list_events_for_user(&self, user_id: i64) -> Result<Vec<(Event, EventAccess)>> {
        let sql = format!(
            r"
            SELECT {EVENT_COLUMNS}, c.permissions
            FROM events e
            LEFT JOIN event_collaborators c ON c.event_id = e.id AND c.user_id = ?1
            WHERE e.owner_id = ?1 OR c.user_id IS NOT NULL
            ORDER BY e.event_date DESC, e.id DESC
            "
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map([user_id], |row| {
                let event = row_to_event(row)?;
                let permissions: Option<String> = row.get(10)?;
                Ok((event, permissions))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        events
            .into_iter()
            .map(|(event, permissions)| {
                let access = access_for(&event, user_id, permissions.as_deref())?;
                Ok((event, access))
            })
            .collect()
    }

    /// Load an event together with what `user_id` may do on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the event does not exist.
    pub fn event_access(&self, user_id: i64, event_id: i64) -> Result<(Event, EventAccess)> {
        let sql = format!(
            r"
            SELECT {EVENT_COLUMNS}, c.permissions
            FROM events e
            LEFT JOIN event_collaborators c ON c.event_id = e.id AND c.user_id = ?1
            WHERE e.id = ?2
            "
        );
        let row = self
            .conn
            .query_row(&sql, params![user_id, event_id], |row| {
                let event = row_to_event(row)?;
                let permissions: Option<String> = row.get(10)?;
                Ok((event, permissions))
            })
            .optional()?;

        let (event, permissions) = row.ok_or(Error::NotFound { entity: "event" })?;
        let access = access_for(&event, user_id, permissions.as_deref())?;
        Ok((event, access))
    }

    /// # Errors
    ///
    /// Returns a validation error for bad input, [`Error::NotFound`] for an
    /// unknown event, or a database error.
    pub fn update_event(&self, id: i64, input: &EventInput) -> Result<Event> {
        input.validate()?;

        let affected = self.conn.execute(
            r"
            UPDATE events
            SET name = ?1, description = ?2, location = ?3, event_date = ?4,
                start_time = ?5, end_time = ?6, updated_at = ?7
            WHERE id = ?8
            ",
            params![
                input.name.trim(),
                clean(input.description.as_deref()),
                clean(input.location.as_deref()),
                input.event_date.to_string(),
                clean(input.start_time.as_deref()),
                clean(input.end_time.as_deref()),
                to_db_time(Utc::now()),
                id,
            ],
        )?;
        if affected == 0 {
            return Err(Error::NotFound { entity: "event" });
        }

        self.get_event(id)?.ok_or(Error::NotFound { entity: "event" })
    }

    /// Delete an event with its attendees, collaborators and log.
    ///
    /// Returns `true` if an event was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn delete_event(&self, id: i64) -> Result<bool> {
        let affected = self.conn.execute("DELETE FROM events WHERE id = ?1", [id])?;
        if affected > 0 {
            info!(event_id = id, "Deleted event");
        }
        Ok(affected > 0)
    }

    /// Grant `permissions` to a user, replacing any previous grant.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty permission list or when the
    /// user owns the event.
    pub fn upsert_collaborator(
        &self,
        event_id: i64,
        user_id: i64,
        permissions: &[Permission],
    ) -> Result<Collaborator> {
        if permissions.is_empty() {
            return Err(Error::validation("at least one permission is required"));
        }
        let event = self
            .get_event(event_id)?
            .ok_or(Error::NotFound { entity: "event" })?;
        if event.owner_id == user_id {
            return Err(Error::validation("the owner cannot be added as a collaborator"));
        }

        let result = self.conn.execute(
            r"
            INSERT INTO event_collaborators (event_id, user_id, permissions, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (event_id, user_id) DO UPDATE SET permissions = excluded.permissions
            ",
            params![
                event_id,
                user_id,
                Permission::join(permissions),
                to_db_time(Utc::now())
            ],
        );
        if let Err(e) = result {
            return Err(match unique_violation(&e) {
                Some(_) => Error::conflict("collaborator already exists"),
                None => e.into(),
            });
        }

        self.get_collaborator(event_id, user_id)?
            .ok_or(Error::NotFound { entity: "collaborator" })
    }

    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_collaborator(&self, event_id: i64, user_id: i64) -> Result<Option<Collaborator>> {
        let collaborator = self
            .conn
            .query_row(
                r"
                SELECT c.event_id, c.user_id, u.username, u.display_name, c.permissions, c.created_at
                FROM event_collaborators c JOIN users u ON u.id = c.user_id
                WHERE c.event_id = ?1 AND c.user_id = ?2
                ",
                params![event_id, user_id],
                row_to_collaborator,
            )
            .optional()?;
        Ok(collaborator)
    }

    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn list_collaborators(&self, event_id: i64) -> Result<Vec<Collaborator>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT c.event_id, c.user_id, u.username, u.display_name, c.permissions, c.created_at
            FROM event_collaborators c JOIN users u ON u.id = c.user_id
            WHERE c.event_id = ?1
            ORDER BY u.username
            ",
        )?;
        let collaborators = stmt
            .query_map([event_id], row_to_collaborator)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(collaborators)
    }

    /// Returns `true` if a collaborator was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn remove_collaborator(&self, event_id: i64, user_id: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM event_collaborators WHERE event_id = ?1 AND user_id = ?2",
            params![event_id, user_id],
        )?;
        Ok(affected > 0)
    }
}

fn access_for(event: &Event, user_id: i64, permissions: Option<&str>) -> Result<EventAccess> {
    if event.owner_id == user_id {
        return Ok(EventAccess::Owner);
    }
    match permissions {
        Some(raw) => Ok(EventAccess::Collaborator(Permission::split(raw)?)),
        None => Ok(EventAccess::None),
    }
}

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let event_date: String = row.get(5)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(Event {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        location: row.get(4)?,
        event_date: event_date
            .parse::<NaiveDate>()
            .map_err(|e| conversion_error(5, e))?,
        start_time: row.get(6)?,
        end_time: row.get(7)?,
        created_at: from_db_time(8, &created_at)?,
        updated_at: from_db_time(9, &updated_at)?,
    })
}

fn row_to_collaborator(row: &Row) -> rusqlite::Result<Collaborator> {
    let permissions: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(Collaborator {
        event_id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        display_name: row.get(3)?,
        permissions: Permission::split(&permissions).map_err(|e| conversion_error(4, e))?,
        created_at: from_db_time(5, &created_at)?,
    })
}
