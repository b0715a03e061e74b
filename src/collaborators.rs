//! Sharing an event with other accounts.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use tracing::info;

use crate::app::SharedState;
use crate::error::{Error, Result};
use crate::login::CurrentUser;
use crate::models::{Collaborator, Permission};

#[derive(Debug, Deserialize)]
pub struct AddCollaborator {
    pub username: String,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePermissions {
    pub permissions: Vec<Permission>,
}

/// `GET /api/events/:event_id/collaborators`
pub async fn list(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
) -> Result<Json<Vec<Collaborator>>> {
    state.authorize(user.id, event_id, Permission::View)?;
    Ok(Json(state.storage().list_collaborators(event_id)?))
}

/// `POST /api/events/:event_id/collaborators`
pub async fn add(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
    Json(req): Json<AddCollaborator>,
) -> Result<(StatusCode, Json<Collaborator>)> {
    state.authorize(user.id, event_id, Permission::Manage)?;

    let collaborator = {
        let storage = state.storage();
        let target = storage
            .find_user_by_username(req.username.trim())?
            .ok_or(Error::NotFound { entity: "user" })?;
        storage.upsert_collaborator(event_id, target.id, &req.permissions)?
    };

    state.dashboard_cache.clear();
    info!(
        event_id,
        collaborator = collaborator.user_id,
        granted_by = user.id,
        "Added collaborator"
    );
    Ok((StatusCode::CREATED, Json(collaborator)))
}

/// `PUT /api/events/:event_id/collaborators/:user_id`
pub async fn update(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((event_id, collaborator_id)): Path<(i64, i64)>,
    Json(req): Json<UpdatePermissions>,
) -> Result<Json<Collaborator>> {
    state.authorize(user.id, event_id, Permission::Manage)?;

    let collaborator = {
        let storage = state.storage();
        if storage.get_collaborator(event_id, collaborator_id)?.is_none() {
            return Err(Error::NotFound {
                entity: "collaborator",
            });
        }
        storage.upsert_collaborator(event_id, collaborator_id, &req.permissions)?
    };

    state.dashboard_cache.clear();
    Ok(Json(collaborator))
}

/// `DELETE /api/events/:event_id/collaborators/:user_id`
pub async fn remove(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((event_id, collaborator_id)): Path<(i64, i64)>,
) -> Result<StatusCode> {
    state.authorize(user.id, event_id, Permission::Manage)?;

    if !state.storage().remove_collaborator(event_id, collaborator_id)? {
        return Err(Error::NotFound {
            entity: "collaborator",
        });
    }

    state.dashboard_cache.clear();
    info!(event_id, collaborator = collaborator_id, "Removed collaborator");
    Ok(StatusCode::NO_CONTENT)
}
