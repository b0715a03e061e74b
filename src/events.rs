//! Event CRUD endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Serialize;
use tracing::info;

use crate::app::SharedState;
use crate::error::{Error, Result};
use crate::login::CurrentUser;
use crate::models::{Event, EventAccess, EventInput, Permission};

/// An event as seen by a particular user.
#[derive(Debug, Serialize)]
pub struct EventView {
    #[serde(flatten)]
    pub event: Event,
    pub is_owner: bool,
    pub permissions: Vec<Permission>,
}

impl EventView {
    fn new(event: Event, access: &EventAccess) -> Self {
        Self {
            event,
            is_owner: access.is_owner(),
            permissions: access.effective(),
        }
    }
}

/// `GET /api/events`
pub async fn list(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<Vec<EventView>>> {
    let events = state.storage().list_events_for_user(user.id)?;
    Ok(Json(
        events
            .into_iter()
            .map(|(event, access)| EventView::new(event, &access))
            .collect(),
    ))
}

/// `POST /api/events`
pub async fn create(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Json(input): Json<EventInput>,
) -> Result<(StatusCode, Json<EventView>)> {
    let event = state.storage().create_event(user.id, &input)?;
    state.dashboard_cache.invalidate(&user.id);
    Ok((
        StatusCode::CREATED,
        Json(EventView::new(event, &EventAccess::Owner)),
    ))
}

/// `GET /api/events/:event_id`
pub async fn get(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
) -> Result<Json<EventView>> {
    let (event, access) = state.authorize(user.id, event_id, Permission::View)?;
    Ok(Json(EventView::new(event, &access)))
}

/// `PUT /api/events/:event_id`
pub async fn update(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
    Json(input): Json<EventInput>,
) -> Result<Json<EventView>> {
    let (_, access) = state.authorize(user.id, event_id, Permission::Edit)?;
    let event = state.storage().update_event(event_id, &input)?;
    state.invalidate_event(event_id);
    info!(event_id, user_id = user.id, "Updated event");
    Ok(Json(EventView::new(event, &access)))
}

/// `DELETE /api/events/:event_id`. Only the owner may delete.
pub async fn delete(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
) -> Result<StatusCode> {
    let (_, access) = state.authorize(user.id, event_id, Permission::View)?;
    if !access.is_owner() {
        return Err(Error::Forbidden {
            permission: Permission::Manage,
        });
    }

    state.storage().delete_event(event_id)?;
    state.invalidate_event(event_id);
    Ok(StatusCode::NO_CONTENT)
}
