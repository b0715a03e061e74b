//! Account records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::{clean, from_db_time, from_db_time_opt, to_db_time, unique_violation, Storage};
use crate::error::{Error, Result};
use crate::models::User;

const USER_COLUMNS: &str =
    "id, username, email, display_name, password_hash, oidc_subject, created_at";

/// Identity returned by an OpenID provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OidcIdentity {
    pub subject: String,
    pub email: Option<String>,
    /// The provider vouches that the subject owns `email`.
    pub email_verified: bool,
    pub name: Option<String>,
    pub preferred_username: Option<String>,
}

impl Storage {
    /// Create an account.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the username or e-mail is taken.
    pub fn create_user(
        &self,
        username: &str,
        email: Option<&str>,
        display_name: &str,
        password_hash: Option<&str>,
    ) -> Result<User> {
        self.insert_user(username, email, display_name, password_hash, None)
    }

    fn insert_user(
        &self,
        username: &str,
        email: Option<&str>,
        display_name: &str,
        password_hash: Option<&str>,
        oidc_subject: Option<&str>,
    ) -> Result<User> {
        let now = Utc::now();
        let email = clean(email);
        let display_name = clean(Some(display_name)).unwrap_or_else(|| username.to_string());

        let result = self.conn.execute(
            r"
            INSERT INTO users (username, email, display_name, password_hash, oidc_subject, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                username,
                email,
                display_name,
                password_hash,
                oidc_subject,
                to_db_time(now)
            ],
        );

        match result {
            Ok(_) => {}
            Err(e) => {
                return Err(match unique_violation(&e) {
                    Some(cols) if cols.contains("email") => {
                        Error::conflict("email address is already registered")
                    }
                    Some(cols) if cols.contains("username") => {
                        Error::conflict("username already exists")
                    }
                    _ => e.into(),
                });
            }
        }

        let id = self.conn.last_insert_rowid();
        info!(user_id = id, username, "Created user");
        self.get_user(id)?.ok_or(Error::NotFound { entity: "user" })
    }

    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.find_user("id = ?1", id)
    }

    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.find_user("username = ?1", username)
    }

    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.find_user("email = ?1", email.trim())
    }

    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn find_user_by_oidc_subject(&self, subject: &str) -> Result<Option<User>> {
        self.find_user("oidc_subject = ?1", subject)
    }

    fn find_user(&self, condition: &str, value: impl rusqlite::ToSql) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {condition}");
        let user = self
            .conn
            .query_row(&sql, [value], row_to_user)
            .optional()?;
        Ok(user)
    }

    /// Find or create the account behind an OIDC identity.
    ///
    /// A known subject refreshes e-mail and name; an e-mail already used by
    /// another account is left alone. An unknown subject is linked to the
    /// password account with the same e-mail only when the provider marks
    /// that e-mail verified. Otherwise a new account is created with a
    /// unique username, and without the e-mail if another account holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn upsert_oidc_user(&self, identity: &OidcIdentity) -> Result<User> {
        let mut email = clean(identity.email.as_deref());

        if let Some(user) = self.find_user_by_oidc_subject(&identity.subject)? {
            let display_name = identity
                .name
                .clone()
                .unwrap_or_else(|| user.display_name.clone());
            let result = self.conn.execute(
                "UPDATE users SET email = COALESCE(?1, email), display_name = ?2 WHERE id = ?3",
                params![email, display_name, user.id],
            );
            match result {
                Ok(_) => {}
                Err(e) if unique_violation(&e).is_some_and(|cols| cols.contains("email")) => {
                    warn!(
                        user_id = user.id,
                        "OIDC e-mail belongs to another account; keeping the old one"
                    );
                    self.conn.execute(
                        "UPDATE users SET display_name = ?1 WHERE id = ?2",
                        params![display_name, user.id],
                    )?;
                }
                Err(e) => return Err(e.into()),
            }
            return self.get_user(user.id)?.ok_or(Error::NotFound { entity: "user" });
        }

        let holder = match email.as_deref() {
            Some(address) => self.find_user_by_email(address)?,
            None => None,
        };
        if let Some(user) = holder {
            if identity.email_verified && user.oidc_subject.is_none() {
                self.conn.execute(
                    "UPDATE users SET oidc_subject = ?1 WHERE id = ?2",
                    params![identity.subject, user.id],
                )?;
                info!(user_id = user.id, "Linked OIDC subject to existing account");
                return self.get_user(user.id)?.ok_or(Error::NotFound { entity: "user" });
            }
            debug!(user_id = user.id, "E-mail already registered; new OIDC account gets none");
            email = None;
        }

        let base = username_candidate(identity);
        let mut username = base.clone();
        let mut suffix = 1;
        while self.find_user_by_username(&username)?.is_some() {
            suffix += 1;
            username = format!("{base}{suffix}");
        }
        debug!(username, "Creating account for OIDC subject");

        let display_name = identity.name.clone().unwrap_or_else(|| username.clone());
        self.insert_user(
            &username,
            email.as_deref(),
            &display_name,
            None,
            Some(&identity.subject),
        )
    }

    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_password_hash(&self, user_id: i64, password_hash: &str) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE users SET password_hash = ?1, reset_code = NULL, reset_code_expires = NULL WHERE id = ?2",
            params![password_hash, user_id],
        )?;
        if affected == 0 {
            return Err(Error::NotFound { entity: "user" });
        }
        Ok(())
    }

    /// Store a password-reset code, or clear it with `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_reset_code(
        &self,
        user_id: i64,
        code: Option<(&str, DateTime<Utc>)>,
    ) -> Result<()> {
        let (code, expires) = match code {
            Some((code, expires)) => (Some(code.to_string()), Some(to_db_time(expires))),
            None => (None, None),
        };
        self.conn.execute(
            "UPDATE users SET reset_code = ?1, reset_code_expires = ?2 WHERE id = ?3",
            params![code, expires, user_id],
        )?;
        Ok(())
    }

    /// The pending reset code and its expiry, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn reset_code(&self, user_id: i64) -> Result<Option<(String, DateTime<Utc>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT reset_code, reset_code_expires FROM users WHERE id = ?1",
                [user_id],
                |row| {
                    let code: Option<String> = row.get(0)?;
                    let expires = from_db_time_opt(1, row.get(1)?)?;
                    Ok(code.zip(expires))
                },
            )
            .optional()?;
        Ok(row.flatten())
    }
}

fn username_candidate(identity: &OidcIdentity) -> String {
    let raw = identity
        .preferred_username
        .as_deref()
        .or_else(|| identity.email.as_deref().and_then(|e| e.split('@').next()))
        .unwrap_or("user");
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(32)
        .collect();
    if cleaned.is_empty() {
        "user".to_string()
    } else {
        cleaned
    }
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    let created_at: String = row.get(6)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        password_hash: row.get(4)?,
        oidc_subject: row.get(5)?,
        created_at: from_db_time(6, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{storage, user};
    use super::*;

    #[test]
    fn test_create_and_find_user() {
        let storage = storage();
        let created = storage
            .create_user("minh", Some("minh@example.edu.vn"), "Trần Minh", Some("hash"))
            .unwrap();

        let by_name = storage.find_user_by_username("minh").unwrap().unwrap();
        assert_eq!(by_name, created);
        assert_eq!(by_name.display_name, "Trần Minh");

        let by_email = storage
            .find_user_by_email("minh@example.edu.vn")
            .unwrap()
            .unwrap();
        assert_eq!(by_email.id, created.id);
    }

    #[test]
    fn test_duplicate_username_conflicts() {
        let storage = storage();
        user(&storage, "hoa");
        let err = storage.create_user("hoa", None, "Hoa", Some("hash")).unwrap_err();
        assert!(matches!(err, Error::Conflict(ref m) if m.contains("username")));
    }

    #[test]
    fn test_duplicate_email_conflicts() {
        let storage = storage();
        user(&storage, "hoa");
        let err = storage
            .create_user("hoa2", Some("hoa@example.edu.vn"), "Hoa", Some("hash"))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(ref m) if m.contains("email")));
    }

    #[test]
    fn test_reset_code_round_trip() {
        let storage = storage();
        let u = user(&storage, "binh");
        let expires = Utc::now() + chrono::Duration::hours(1);

        storage.set_reset_code(u.id, Some(("ABCD1234", expires))).unwrap();
        let (code, stored) = storage.reset_code(u.id).unwrap().unwrap();
        assert_eq!(code, "ABCD1234");
        assert_eq!(to_db_time(stored), to_db_time(expires));

        storage.set_password_hash(u.id, "new-hash").unwrap();
        assert!(storage.reset_code(u.id).unwrap().is_none());
        let reloaded = storage.get_user(u.id).unwrap().unwrap();
        assert_eq!(reloaded.password_hash.as_deref(), Some("new-hash"));
    }

    #[test]
    fn test_upsert_oidc_user_creates_then_updates() {
        let storage = storage();
        let identity = OidcIdentity {
            subject: "sub-1".into(),
            email: Some("thu@example.edu.vn".into()),
            email_verified: true,
            name: Some("Lê Thu".into()),
            preferred_username: Some("thu".into()),
        };

        let first = storage.upsert_oidc_user(&identity).unwrap();
        assert_eq!(first.username, "thu");
        assert!(first.password_hash.is_none());

        let renamed = OidcIdentity {
            name: Some("Lê Anh Thu".into()),
            ..identity
        };
        let second = storage.upsert_oidc_user(&renamed).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.display_name, "Lê Anh Thu");
    }

    #[test]
    fn test_upsert_oidc_user_links_verified_email() {
        let storage = storage();
        let existing = user(&storage, "quang");

        let linked = storage
            .upsert_oidc_user(&OidcIdentity {
                subject: "sub-9".into(),
                email: Some("quang@example.edu.vn".into()),
                email_verified: true,
                ..OidcIdentity::default()
            })
            .unwrap();
        assert_eq!(linked.id, existing.id);
        assert_eq!(linked.oidc_subject.as_deref(), Some("sub-9"));
    }

    #[test]
    fn test_upsert_oidc_user_does_not_take_over_unverified_email() {
        let storage = storage();
        let victim = user(&storage, "victim");

        let other = storage
            .upsert_oidc_user(&OidcIdentity {
                subject: "other-sub".into(),
                email: Some("victim@example.edu.vn".into()),
                preferred_username: Some("victim".into()),
                ..OidcIdentity::default()
            })
            .unwrap();
        assert_ne!(other.id, victim.id);
        assert_eq!(other.email, None);
        assert_eq!(other.username, "victim2");

        let untouched = storage.get_user(victim.id).unwrap().unwrap();
        assert_eq!(untouched.oidc_subject, None);
        assert_eq!(untouched.email.as_deref(), Some("victim@example.edu.vn"));
    }

    #[test]
    fn test_upsert_oidc_user_keeps_email_taken_by_another_account() {
        let storage = storage();
        user(&storage, "lan");
        let identity = OidcIdentity {
            subject: "sub-3".into(),
            email: Some("mai@example.edu.vn".into()),
            ..OidcIdentity::default()
        };
        let first = storage.upsert_oidc_user(&identity).unwrap();

        let moved = storage
            .upsert_oidc_user(&OidcIdentity {
                email: Some("lan@example.edu.vn".into()),
                name: Some("Mai".into()),
                ..identity
            })
            .unwrap();
        assert_eq!(moved.id, first.id);
        assert_eq!(moved.email.as_deref(), Some("mai@example.edu.vn"));
        assert_eq!(moved.display_name, "Mai");
    }

    #[test]
    fn test_upsert_oidc_user_avoids_username_clash() {
        let storage = storage();
        user(&storage, "nam");

        let created = storage
            .upsert_oidc_user(&OidcIdentity {
                subject: "sub-2".into(),
                email: Some("nam@other.example".into()),
                preferred_username: Some("nam".into()),
                ..OidcIdentity::default()
            })
            .unwrap();
        assert_eq!(created.username, "nam2");
    }
}
