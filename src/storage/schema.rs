//! `SQLite` schema definitions.

/// Accounts. `password_hash` is NULL for OIDC-only users.
pub const CREATE_USERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT UNIQUE,
    display_name TEXT NOT NULL,
    password_hash TEXT,
    oidc_subject TEXT UNIQUE,
    reset_code TEXT,
    reset_code_expires TEXT,
    created_at TEXT NOT NULL
)
";

pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT,
    location TEXT,
    event_date TEXT NOT NULL,
    start_time TEXT,
    end_time TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
";

pub const CREATE_EVENTS_OWNER_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_owner ON events(owner_id)
";

pub const CREATE_COLLABORATORS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS event_collaborators (
    event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    permissions TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (event_id, user_id)
)
";

pub const CREATE_COLLABORATORS_USER_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_collaborators_user ON event_collaborators(user_id)
";

pub const CREATE_ATTENDEES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS attendees (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    student_id TEXT NOT NULL,
    full_name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    organization TEXT,
    qr_code TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'pending',
    checked_in_at TEXT,
    checked_out_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (event_id, student_id)
)
";

pub const CREATE_ATTENDEES_STATUS_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_attendees_event_status ON attendees(event_id, status)
";

/// Append-only audit trail. Rows outlive the attendee they describe.
pub const CREATE_CHECKIN_LOGS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS checkin_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    attendee_id INTEGER REFERENCES attendees(id) ON DELETE SET NULL,
    student_id TEXT NOT NULL,
    full_name TEXT NOT NULL,
    action TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    method TEXT NOT NULL,
    performed_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
)
";

pub const CREATE_CHECKIN_LOGS_EVENT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_checkin_logs_event ON checkin_logs(event_id, created_at DESC)
";

/// Key-value pairs, currently only the schema version.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Tables of the first release.
pub const BASE_TABLES: &[&str] = &[
    CREATE_USERS_TABLE,
    CREATE_EVENTS_TABLE,
    CREATE_COLLABORATORS_TABLE,
    CREATE_ATTENDEES_TABLE,
    CREATE_CHECKIN_LOGS_TABLE,
];

/// Indexes behind the dashboard, sharing and log queries.
pub const LOOKUP_INDEXES: &[&str] = &[
    CREATE_EVENTS_OWNER_INDEX,
    CREATE_COLLABORATORS_USER_INDEX,
    CREATE_ATTENDEES_STATUS_INDEX,
    CREATE_CHECKIN_LOGS_EVENT_INDEX,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_groups() {
        assert!(BASE_TABLES.iter().all(|s| s.contains("CREATE TABLE")));
        assert!(LOOKUP_INDEXES.iter().all(|s| s.contains("CREATE INDEX")));
    }

    #[test]
    fn test_attendee_uniqueness_constraints() {
        assert!(CREATE_ATTENDEES_TABLE.contains("qr_code TEXT NOT NULL UNIQUE"));
        assert!(CREATE_ATTENDEES_TABLE.contains("UNIQUE (event_id, student_id)"));
    }

    #[test]
    fn test_logs_survive_attendee_deletion() {
        assert!(CREATE_CHECKIN_LOGS_TABLE.contains("ON DELETE SET NULL"));
    }
}
