//! Domain records shared by storage, the HTTP handlers and the exports.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

lazy_static! {
    static ref TIME_RE: Regex = Regex::new(r"^([01]\d|2[0-3]):[0-5]\d$").unwrap();
    static ref STUDENT_ID_RE: Regex = Regex::new(r"^[A-Za-z0-9._-]{1,32}$").unwrap();
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

/// Check an optional e-mail address.
///
/// # Errors
///
/// Returns a validation error when the address is present but malformed.
pub fn validate_email(email: Option<&str>) -> Result<()> {
    match email.map(str::trim).filter(|e| !e.is_empty()) {
        Some(e) if !EMAIL_RE.is_match(e) => Err(Error::validation(format!("invalid email: {e}"))),
        _ => Ok(()),
    }
}

/// A registered account (organizer or collaborator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub display_name: String,
    /// Argon2 hash; `None` for accounts that only sign in through OIDC.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing)]
    pub oidc_subject: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An organizer-owned event that attendees are enrolled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub event_date: NaiveDate,
    /// `HH:MM`, local to the event.
    pub start_time: Option<String>,
    /// `HH:MM`, local to the event.
    pub end_time: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields an organizer supplies when creating or editing an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub event_date: NaiveDate,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

impl EventInput {
    /// # Errors
    ///
    /// Returns a validation error for a blank name, a time not in `HH:MM`
    /// form, or an end time before the start time.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("event name must not be empty"));
        }
        for time in [&self.start_time, &self.end_time].into_iter().flatten() {
            if !TIME_RE.is_match(time) {
                return Err(Error::validation(format!("time must be HH:MM, got {time}")));
            }
        }
        if let (Some(start), Some(end)) = (&self.start_time, &self.end_time) {
            // Zero-padded HH:MM compares correctly as text.
            if end < start {
                return Err(Error::validation("end_time must not be before start_time"));
            }
        }
        Ok(())
    }
}

/// Lifecycle status of an attendee.
///
/// The field only moves forward: pending, then checked in, then checked out.
/// Managers can reset an attendee to pending explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendeeStatus {
    #[default]
    Pending,
    CheckedIn,
    CheckedOut,
}

impl AttendeeStatus {
    pub const ALL: [AttendeeStatus; 3] = [Self::Pending, Self::CheckedIn, Self::CheckedOut];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::CheckedIn => "checked_in",
            Self::CheckedOut => "checked_out",
        }
    }

    /// Label shown in the Vietnamese UI and in exports.
    #[must_use]
    pub fn label_vi(self) -> &'static str {
        match self {
            Self::Pending => "Chưa điểm danh",
            Self::CheckedIn => "Đã check-in",
            Self::CheckedOut => "Đã check-out",
        }
    }

    /// Work out where `action` takes an attendee currently in this status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] when the action would move the
    /// attendee backwards or skip a step.
    pub fn apply(self, action: CheckinAction) -> Result<Transition> {
        use AttendeeStatus::{CheckedIn, CheckedOut, Pending};

        let to = match (action, self) {
            (CheckinAction::CheckIn | CheckinAction::Auto, Pending) => CheckedIn,
            (CheckinAction::CheckIn, CheckedIn)
            | (CheckinAction::CheckOut | CheckinAction::Auto, CheckedOut) => {
                return Ok(Transition::Unchanged(self));
            }
            (CheckinAction::CheckOut | CheckinAction::Auto, CheckedIn) => CheckedOut,
            (CheckinAction::CheckIn, CheckedOut) | (CheckinAction::CheckOut, Pending) => {
                return Err(Error::InvalidTransition { from: self, action });
            }
        };

        Ok(Transition::Applied { from: self, to })
    }
}

impl fmt::Display for AttendeeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendeeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "checked_in" => Ok(Self::CheckedIn),
            "checked_out" => Ok(Self::CheckedOut),
            other => Err(Error::validation(format!("unknown status: {other}"))),
        }
    }
}

/// What a scan or manual entry asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinAction {
    CheckIn,
    CheckOut,
    /// Advance one step: pending attendees check in, checked-in ones check out.
    #[default]
    Auto,
}

impl CheckinAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckIn => "check_in",
            Self::CheckOut => "check_out",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for CheckinAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of applying an action to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: AttendeeStatus,
        to: AttendeeStatus,
    },
    /// The attendee already holds the requested status; nothing is recorded.
    Unchanged(AttendeeStatus),
}

impl Transition {
    #[must_use]
    pub fn status(self) -> AttendeeStatus {
        match self {
            Self::Applied { to, .. } => to,
            Self::Unchanged(status) => status,
        }
    }
}

/// How the attendee was identified at the door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinMethod {
    #[default]
    Qr,
    Manual,
    Admin,
}

impl CheckinMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qr => "qr",
            Self::Manual => "manual",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for CheckinMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qr" => Ok(Self::Qr),
            "manual" => Ok(Self::Manual),
            "admin" => Ok(Self::Admin),
            other => Err(Error::validation(format!("unknown check-in method: {other}"))),
        }
    }
}

/// Kind of entry in the check-in log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    CheckIn,
    CheckOut,
    Reset,
}

impl LogAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckIn => "check_in",
            Self::CheckOut => "check_out",
            Self::Reset => "reset",
        }
    }

    #[must_use]
    pub fn label_vi(self) -> &'static str {
        match self {
            Self::CheckIn => "Check-in",
            Self::CheckOut => "Check-out",
            Self::Reset => "Đặt lại",
        }
    }

    /// The log action recorded for a status change.
    #[must_use]
    pub fn for_status(to: AttendeeStatus) -> Self {
        match to {
            AttendeeStatus::Pending => Self::Reset,
            AttendeeStatus::CheckedIn => Self::CheckIn,
            AttendeeStatus::CheckedOut => Self::CheckOut,
        }
    }
}

impl FromStr for LogAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "check_in" => Ok(Self::CheckIn),
            "check_out" => Ok(Self::CheckOut),
            "reset" => Ok(Self::Reset),
            other => Err(Error::validation(format!("unknown log action: {other}"))),
        }
    }
}

/// A person enrolled in an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attendee {
    pub id: i64,
    pub event_id: i64,
    /// Student or staff ID, unique within the event.
    pub student_id: String,
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Class, faculty or department.
    pub organization: Option<String>,
    pub qr_code: String,
    pub status: AttendeeStatus,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub checked_out_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when enrolling an attendee.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAttendee {
    pub student_id: String,
    pub full_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl NewAttendee {
    /// # Errors
    ///
    /// Returns a validation error for a malformed student id, blank name or
    /// bad e-mail address.
    pub fn validate(&self) -> Result<()> {
        validate_student_id(&self.student_id)?;
        if self.full_name.trim().is_empty() {
            return Err(Error::validation("full_name must not be empty"));
        }
        validate_email(self.email.as_deref())
    }
}

/// Partial update of an attendee; absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttendeeUpdate {
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl AttendeeUpdate {
    /// # Errors
    ///
    /// Same rules as [`NewAttendee::validate`] for the fields present.
    pub fn validate(&self) -> Result<()> {
        if let Some(student_id) = &self.student_id {
            validate_student_id(student_id)?;
        }
        if self.full_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(Error::validation("full_name must not be empty"));
        }
        validate_email(self.email.as_deref())
    }
}

/// Filter for attendee listings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AttendeeFilter {
    #[serde(default)]
    pub status: Option<AttendeeStatus>,
    /// Case-insensitive match on student id, name or e-mail.
    #[serde(default)]
    pub q: Option<String>,
}

fn validate_student_id(student_id: &str) -> Result<()> {
    if STUDENT_ID_RE.is_match(student_id.trim()) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "student_id must be 1-32 letters, digits, '.', '-' or '_', got {student_id:?}"
        )))
    }
}

/// Append-only record of one status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinLog {
    pub id: i64,
    pub event_id: i64,
    /// `None` once the attendee has been removed from the event.
    pub attendee_id: Option<i64>,
    pub student_id: String,
    pub full_name: String,
    pub action: LogAction,
    pub from_status: AttendeeStatus,
    pub to_status: AttendeeStatus,
    pub method: CheckinMethod,
    pub performed_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Scoped right a collaborator holds on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    View,
    Checkin,
    Edit,
    Manage,
}

impl Permission {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Checkin => "checkin",
            Self::Edit => "edit",
            Self::Manage => "manage",
        }
    }

    /// Serialize a permission set for storage (`"view,checkin"`).
    #[must_use]
    pub fn join(permissions: &[Permission]) -> String {
        let mut sorted = permissions.to_vec();
        sorted.sort();
        sorted.dedup();
        sorted
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a stored permission set, ignoring empty segments.
    ///
    /// # Errors
    ///
    /// Returns a validation error on an unknown permission name.
    pub fn split(raw: &str) -> Result<Vec<Permission>> {
        let mut permissions = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>>>()?;
        permissions.sort();
        permissions.dedup();
        Ok(permissions)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "view" => Ok(Self::View),
            "checkin" | "check_in" => Ok(Self::Checkin),
            "edit" => Ok(Self::Edit),
            "manage" => Ok(Self::Manage),
            other => Err(Error::validation(format!("unknown permission: {other}"))),
        }
    }
}

/// A user granted access to someone else's event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collaborator {
    pub event_id: i64,
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub permissions: Vec<Permission>,
    pub created_at: DateTime<Utc>,
}

/// What a given user may do on a given event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAccess {
    Owner,
    Collaborator(Vec<Permission>),
    None,
}

impl EventAccess {
    /// Whether this access level includes `permission`.
    ///
    /// Any grant implies `view`; `manage` implies everything.
    #[must_use]
    pub fn allows(&self, permission: Permission) -> bool {
        match self {
            Self::Owner => true,
            Self::None => false,
            Self::Collaborator(granted) => {
                granted.contains(&Permission::Manage)
                    || granted.contains(&permission)
                    || (permission == Permission::View && !granted.is_empty())
            }
        }
    }

    /// Fail with [`Error::Forbidden`] unless `permission` is held.
    ///
    /// Users without any access get [`Error::NotFound`] so event ids are
    /// not disclosed.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn require(&self, permission: Permission) -> Result<()> {
        if matches!(self, Self::None) {
            return Err(Error::NotFound { entity: "event" });
        }
        if self.allows(permission) {
            Ok(())
        } else {
            Err(Error::Forbidden { permission })
        }
    }

    /// The effective permission list, for display.
    #[must_use]
    pub fn effective(&self) -> Vec<Permission> {
        [
            Permission::View,
            Permission::Checkin,
            Permission::Edit,
            Permission::Manage,
        ]
        .into_iter()
        .filter(|p| self.allows(*p))
        .collect()
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Owner)
    }
}

/// Check-in and check-out counts for one hour of the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourBucket {
    /// Hour in UTC, formatted `YYYY-MM-DDTHH:00`.
    pub hour: String,
    pub check_ins: i64,
    pub check_outs: i64,
}

/// Dashboard numbers for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStats {
    pub event_id: i64,
    pub total: i64,
    pub pending: i64,
    pub checked_in: i64,
    pub checked_out: i64,
    /// Share of attendees who showed up at all, in percent.
    pub attendance_rate: f64,
    pub hourly: Vec<HourBucket>,
    pub recent: Vec<CheckinLog>,
    pub generated_at: DateTime<Utc>,
}

impl EventStats {
    /// Percentage of `total` that has checked in (including those already out).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rate(checked_in: i64, checked_out: i64, total: i64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        let attended = (checked_in + checked_out) as f64;
        (attended * 1000.0 / total as f64).round() / 10.0
    }
}

/// Compact per-event line on the organizer dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub event: Event,
    pub permissions: Vec<Permission>,
    pub total: i64,
    pub checked_in: i64,
    pub checked_out: i64,
    pub attendance_rate: f64,
}

/// Overview across every event a user can see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardOverview {
    pub total_events: usize,
    pub total_attendees: i64,
    pub total_checked_in: i64,
    pub total_checked_out: i64,
    pub events: Vec<EventSummary>,
    pub recent: Vec<CheckinLog>,
    pub generated_at: DateTime<Utc>,
}
