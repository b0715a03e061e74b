//! Enrolling attendees and serving their QR codes.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::app::SharedState;
use crate::checkin::CheckinResponse;
use crate::error::{Error, Result};
use crate::login::CurrentUser;
use crate::models::{Attendee, AttendeeFilter, AttendeeUpdate, NewAttendee, Permission};
use crate::qr;
use crate::realtime::MessageKind;

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub attendees: Vec<NewAttendee>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Svg,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImageParams {
    #[serde(default)]
    pub format: ImageFormat,
}

/// `GET /api/events/:event_id/attendees?status=&q=`
pub async fn list(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
    Query(filter): Query<AttendeeFilter>,
) -> Result<Json<Vec<Attendee>>> {
    state.authorize(user.id, event_id, Permission::View)?;
    Ok(Json(state.storage().list_attendees(event_id, &filter)?))
}

/// `POST /api/events/:event_id/attendees`
pub async fn create(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
    Json(input): Json<NewAttendee>,
) -> Result<(StatusCode, Json<Attendee>)> {
    state.authorize(user.id, event_id, Permission::Edit)?;
    let attendee = state
        .storage()
        .add_attendee(event_id, &input, || state.new_token())?;

    state.invalidate_event(event_id);
    state
        .realtime
        .publish(event_id, MessageKind::AttendeeAdded, &attendee);
    Ok((StatusCode::CREATED, Json(attendee)))
}

/// `POST /api/events/:event_id/attendees/bulk`
pub async fn bulk_create(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
    Json(req): Json<BulkRequest>,
) -> Result<(StatusCode, Json<Vec<Attendee>>)> {
    state.authorize(user.id, event_id, Permission::Edit)?;
    if req.attendees.is_empty() {
        return Err(Error::validation("attendees must not be empty"));
    }

    let attendees =
        state
            .storage()
            .add_attendees_bulk(event_id, &req.attendees, || state.new_token())?;

    state.invalidate_event(event_id);
    for attendee in &attendees {
        state
            .realtime
            .publish(event_id, MessageKind::AttendeeAdded, attendee);
    }
    Ok((StatusCode::CREATED, Json(attendees)))
}

/// `GET /api/events/:event_id/attendees/:attendee_id`
pub async fn get(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((event_id, attendee_id)): Path<(i64, i64)>,
) -> Result<Json<Attendee>> {
    state.authorize(user.id, event_id, Permission::View)?;
    let attendee = state
        .storage()
        .get_attendee(event_id, attendee_id)?
        .ok_or(Error::NotFound { entity: "attendee" })?;
    Ok(Json(attendee))
}

/// `PUT /api/events/:event_id/attendees/:attendee_id`
pub async fn update(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((event_id, attendee_id)): Path<(i64, i64)>,
    Json(update): Json<AttendeeUpdate>,
) -> Result<Json<Attendee>> {
    state.authorize(user.id, event_id, Permission::Edit)?;
    let attendee = state
        .storage()
        .update_attendee(event_id, attendee_id, &update)?;

    state.invalidate_event(event_id);
    state
        .realtime
        .publish(event_id, MessageKind::AttendeeUpdated, &attendee);
    Ok(Json(attendee))
}

/// `DELETE /api/events/:event_id/attendees/:attendee_id`
pub async fn delete(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((event_id, attendee_id)): Path<(i64, i64)>,
) -> Result<StatusCode> {
    state.authorize(user.id, event_id, Permission::Edit)?;
    let removed = state.storage().delete_attendee(event_id, attendee_id)?;

    state.invalidate_event(event_id);
    state.realtime.publish(
        event_id,
        MessageKind::AttendeeRemoved,
        &serde_json::json!({ "id": removed.id, "student_id": removed.student_id }),
    );
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/events/:event_id/attendees/:attendee_id/qr?format=png|svg`
pub async fn qr_image(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((event_id, attendee_id)): Path<(i64, i64)>,
    Query(params): Query<ImageParams>,
) -> Result<Response> {
    state.authorize(user.id, event_id, Permission::View)?;
    let attendee = state
        .storage()
        .get_attendee(event_id, attendee_id)?
        .ok_or(Error::NotFound { entity: "attendee" })?;

    let size = state.config.qr.image_size;
    let response = match params.format {
        ImageFormat::Png => (
            [(header::CONTENT_TYPE, "image/png")],
            qr::render_png(&attendee.qr_code, size)?,
        )
            .into_response(),
        ImageFormat::Svg => (
            [(header::CONTENT_TYPE, "image/svg+xml")],
            qr::render_svg(&attendee.qr_code, size)?,
        )
            .into_response(),
    };
    Ok(response)
}

/// `POST /api/events/:event_id/attendees/:attendee_id/qr/regenerate`
pub async fn regenerate_qr(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((event_id, attendee_id)): Path<(i64, i64)>,
) -> Result<Json<Attendee>> {
    state.authorize(user.id, event_id, Permission::Edit)?;
    let attendee = state
        .storage()
        .regenerate_qr(event_id, attendee_id, || state.new_token())?;

    info!(event_id, attendee_id, "Regenerated QR code");
    state
        .realtime
        .publish(event_id, MessageKind::AttendeeUpdated, &attendee);
    Ok(Json(attendee))
}

/// `POST /api/events/:event_id/attendees/:attendee_id/qr/email`
pub async fn email_qr(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((event_id, attendee_id)): Path<(i64, i64)>,
) -> Result<StatusCode> {
    let (event, _) = state.authorize(user.id, event_id, Permission::Edit)?;
    let Some(mailer) = state.mailer.as_ref() else {
        return Err(Error::ServiceUnavailable("mail is not configured".into()));
    };

    let attendee = state
        .storage()
        .get_attendee(event_id, attendee_id)?
        .ok_or(Error::NotFound { entity: "attendee" })?;
    let Some(email) = attendee.email.clone() else {
        return Err(Error::validation("attendee has no email address"));
    };

    let png = qr::render_png(&attendee.qr_code, state.config.qr.image_size)?;
    mailer.send_attendee_qr(&email, &attendee, &event, png).await?;
    Ok(StatusCode::ACCEPTED)
}

/// `POST /api/events/:event_id/attendees/:attendee_id/reset`
pub async fn reset(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((event_id, attendee_id)): Path<(i64, i64)>,
) -> Result<Json<CheckinResponse>> {
    state.authorize(user.id, event_id, Permission::Manage)?;
    let outcome = state
        .storage()
        .reset_attendee(event_id, attendee_id, Some(user.id), Utc::now())?;

    let response = CheckinResponse::from(outcome);
    if response.log.is_some() {
        state.invalidate_event(event_id);
        state
            .realtime
            .publish(event_id, MessageKind::Reset, &response);
    }
    Ok(Json(response))
}
