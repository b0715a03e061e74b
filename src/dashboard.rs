//! Attendance statistics, cached for a short while.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::Utc;
use tracing::debug;

use crate::app::{AppState, SharedState};
use crate::error::Result;
use crate::login::CurrentUser;
use crate::models::{DashboardOverview, EventStats, Permission};

/// Stats for `event_id`, from the cache when fresh.
///
/// Access is not checked here.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn cached_stats(state: &AppState, event_id: i64) -> Result<EventStats> {
    if let Some(stats) = state.stats_cache.get(&event_id) {
        return Ok(stats);
    }
    refresh_stats(state, event_id)
}

/// Recompute stats for `event_id` and store them in the cache.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn refresh_stats(state: &AppState, event_id: i64) -> Result<EventStats> {
    let stats = state.storage().event_stats(
        event_id,
        state.config.checkin.recent_activity_limit,
        Utc::now(),
    )?;
    debug!(event_id, total = stats.total, "Computed event stats");
    state.stats_cache.insert(event_id, stats.clone());
    Ok(stats)
}

/// `GET /api/events/:event_id/stats`
pub async fn event_stats(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(event_id): Path<i64>,
) -> Result<Json<EventStats>> {
    state.authorize(user.id, event_id, Permission::View)?;
    Ok(Json(cached_stats(&state, event_id)?))
}

/// `GET /api/dashboard`
pub async fn overview(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<DashboardOverview>> {
    if let Some(overview) = state.dashboard_cache.get(&user.id) {
        return Ok(Json(overview));
    }

    let overview = state.storage().dashboard_overview(
        user.id,
        state.config.checkin.recent_activity_limit,
        Utc::now(),
    )?;
    state.dashboard_cache.insert(user.id, overview.clone());
    Ok(Json(overview))
}
