//! The door: scans, manual entries and the check-in log.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::app::{AppState, SharedState};
use crate::dashboard::refresh_stats;
use crate::error::{Error, Result};
use crate::login::CurrentUser;
use crate::models::{
    Attendee, AttendeeStatus, CheckinAction, CheckinLog, CheckinMethod, Permission, Transition,
};
use crate::realtime::MessageKind;
use crate::storage::TransitionOutcome;

const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct CheckinRequest {
    /// QR token, or a student id typed in by hand.
    pub code: String,
    #[serde(default)]
    pub action: CheckinAction,
    #[serde(default)]
    pub method: CheckinMethod,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// What the door staff see after a scan.
#[derive(Debug, Clone, Serialize)]
pub struct CheckinResponse {
    /// `checked_in`, `checked_out`, `reset` or `unchanged`.
    pub result: &'static str,
    pub attendee: Attendee,
    pub log: Option<CheckinLog>,
    pub message_vi: String,
    pub message_en: String,
}

impl From<TransitionOutcome> for CheckinResponse {
    fn from(outcome: TransitionOutcome) -> Self {
        let name = outcome.attendee.full_name.clone();
        let (result, message_vi, message_en) = match outcome.transition {
            Transition::Applied { to, .. } => match to {
                AttendeeStatus::CheckedIn => (
                    "checked_in",
                    format!("{name} đã check-in thành công"),
                    format!("{name} checked in"),
                ),
                AttendeeStatus::CheckedOut => (
                    "checked_out",
                    format!("{name} đã check-out thành công"),
                    format!("{name} checked out"),
                ),
                AttendeeStatus::Pending => (
                    "reset",
                    format!("Đã đặt lại trạng thái của {name}"),
                    format!("{name} was reset to pending"),
                ),
            },
            Transition::Unchanged(status) => (
                "unchanged",
                format!("{name}: {}", status.label_vi()),
                format!("{name} is already {status}"),
            ),
        };

        Self {
            result,
            attendee: outcome.attendee,
            log: outcome.log,
            message_vi,
            message_en,
        }
    }
}

/// Find the attendee a scanned or typed code refers to.
///
/// The code is tried as a QR token first, then as a student id.
fn resolve_code(state: &AppState, event_id: i64, code: &str) -> Result<Attendee> {
    let code = code.trim();
    if code.is_empty() {
        return Err(Error::validation("code must not be empty"));
    }

    let storage = state.storage();
    if let Some(attendee) = storage.find_attendee_by_qr(code)? {
        if attendee.event_id != event_id {
            warn!(event_id, other_event = attendee.event_id, "QR code belongs to another event");
            return Err(Error::validation("this QR code belongs to a different event"));
        }
        return Ok(attendee);
    }

    storage
        .find_attendee_by_student_id(event_id, code)?
        .ok_or(Error::NotFound { entity: "attendee" })
}

/// `POST /api/events/:event_id/checkin`
pub async fn check_in(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
    Json(req): Json<CheckinRequest>,
) -> Result<Json<CheckinResponse>> {
    state.authorize(user.id, event_id, Permission::Checkin)?;
    let attendee = resolve_code(&state, event_id, &req.code)?;

    let outcome = state.storage().record_transition(
        event_id,
        attendee.id,
        req.action,
        req.method,
        Some(user.id),
        Utc::now(),
        state.config.rescan_cooldown(),
    )?;
    let response = CheckinResponse::from(outcome);

    if response.log.is_some() {
        state.invalidate_event(event_id);
        let kind = match response.attendee.status {
            AttendeeStatus::CheckedOut => MessageKind::Checkout,
            _ => MessageKind::Checkin,
        };
        state.realtime.publish(event_id, kind, &response);

        if state.realtime.subscriber_count(event_id) > 0 {
            match refresh_stats(&state, event_id) {
                Ok(stats) => {
                    state.realtime.publish(event_id, MessageKind::Stats, &stats);
                }
                Err(e) => warn!(event_id, error = %e, "Could not refresh stats after check-in"),
            }
        }
    } else {
        debug!(event_id, attendee_id = response.attendee.id, "Check-in left status unchanged");
    }

    Ok(Json(response))
}

/// `GET /api/events/:event_id/logs?limit=`
pub async fn logs(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
    Query(params): Query<LogParams>,
) -> Result<Json<Vec<CheckinLog>>> {
    state.authorize(user.id, event_id, Permission::View)?;
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    Ok(Json(state.storage().recent_logs(event_id, limit)?))
}

/// `GET /api/qr/:code`: who a QR code belongs to, for scanner previews.
pub async fn lookup(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(code): Path<String>,
) -> Result<Json<Attendee>> {
    let attendee = state
        .storage()
        .find_attendee_by_qr(code.trim())?
        .ok_or(Error::NotFound { entity: "attendee" })?;

    // Codes from events the user cannot see look like unknown codes.
    state
        .authorize(user.id, attendee.event_id, Permission::View)
        .map_err(|_| Error::NotFound { entity: "attendee" })?;
    Ok(Json(attendee))
}
