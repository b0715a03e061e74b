use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::{middleware, Json, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::Result;
use crate::mailer::Mailer;
use crate::models::{DashboardOverview, Event, EventAccess, EventStats, Permission};
use crate::oidc::OidcClient;
use crate::realtime::WsManager;
use crate::storage::Storage;
use crate::{attendees, checkin, collaborators, dashboard, downloader, events, login, oidc, realtime};

/// Everything the request handlers share.
#[derive(Debug)]
pub struct AppState {
    pub config: Config,
    storage: Mutex<Storage>,
    /// Session id to user id.
    pub sessions: TtlCache<String, i64>,
    pub stats_cache: TtlCache<i64, EventStats>,
    /// Dashboard overview per user id.
    pub dashboard_cache: TtlCache<i64, DashboardOverview>,
    pub realtime: WsManager,
    pub mailer: Option<Mailer>,
    pub oidc: Option<OidcClient>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// # Errors
    ///
    /// Returns an error if the mailer or OIDC client cannot be built from
    /// the configuration.
    pub fn new(config: Config, storage: Storage) -> Result<Self> {
        let mailer = config.mail.as_ref().map(Mailer::new).transpose()?;
        let oidc = config.oidc.clone().map(OidcClient::new).transpose()?;

        Ok(Self {
            sessions: TtlCache::new(config.session_ttl()),
            stats_cache: TtlCache::new(config.stats_cache_ttl()),
            dashboard_cache: TtlCache::new(config.stats_cache_ttl()),
            realtime: WsManager::new(config.checkin.broadcast_capacity),
            storage: Mutex::new(storage),
            mailer,
            oidc,
            config,
        })
    }

    /// Lock the database. Never hold the guard across an `.await`.
    pub fn storage(&self) -> MutexGuard<'_, Storage> {
        self.storage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load an event and make sure `user_id` holds `permission` on it.
    ///
    /// # Errors
    ///
    /// [`crate::Error::NotFound`] when the event is missing or invisible to
    /// the user, [`crate::Error::Forbidden`] when the permission is missing.
    pub fn authorize(
        &self,
        user_id: i64,
        event_id: i64,
        permission: Permission,
    ) -> Result<(Event, EventAccess)> {
        let (event, access) = self.storage().event_access(user_id, event_id)?;
        access.require(permission)?;
        Ok((event, access))
    }

    /// Forget cached numbers after anything about `event_id` changed.
    pub fn invalidate_event(&self, event_id: i64) {
        self.stats_cache.invalidate(&event_id);
        // Overviews span events of many users; dropping them all is simplest.
        self.dashboard_cache.clear();
    }

    /// A fresh QR token of the configured length.
    #[must_use]
    pub fn new_token(&self) -> String {
        crate::qr::generate_token(self.config.qr.token_length)
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Assemble every route on top of `state`.
pub fn router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/api/auth/me", get(login::me))
        .route("/api/auth/logout", post(login::logout))
        .route("/api/auth/change-password", post(login::change_password))
        .route("/api/dashboard", get(dashboard::overview))
        .route("/api/events", get(events::list).post(events::create))
        .route(
            "/api/events/:event_id",
            get(events::get).put(events::update).delete(events::delete),
        )
        .route(
            "/api/events/:event_id/collaborators",
            get(collaborators::list).post(collaborators::add),
        )
        .route(
            "/api/events/:event_id/collaborators/:user_id",
            put(collaborators::update).delete(collaborators::remove),
        )
        .route(
            "/api/events/:event_id/attendees",
            get(attendees::list).post(attendees::create),
        )
        .route("/api/events/:event_id/attendees/bulk", post(attendees::bulk_create))
        .route(
            "/api/events/:event_id/attendees/:attendee_id",
            get(attendees::get).put(attendees::update).delete(attendees::delete),
        )
        .route("/api/events/:event_id/attendees/:attendee_id/qr", get(attendees::qr_image))
        .route(
            "/api/events/:event_id/attendees/:attendee_id/qr/regenerate",
            post(attendees::regenerate_qr),
        )
        .route(
            "/api/events/:event_id/attendees/:attendee_id/qr/email",
            post(attendees::email_qr),
        )
        .route(
            "/api/events/:event_id/attendees/:attendee_id/reset",
            post(attendees::reset),
        )
        .route("/api/events/:event_id/checkin", post(checkin::check_in))
        .route("/api/events/:event_id/logs", get(checkin::logs))
        .route("/api/events/:event_id/stats", get(dashboard::event_stats))
        .route("/api/events/:event_id/export", get(downloader::export))
        .route("/api/qr/:code", get(checkin::lookup))
        .route("/ws/events/:event_id", get(realtime::ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), login::require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/api/auth/register", post(login::register))
        .route("/api/auth/login", post(login::login))
        .route("/api/auth/forgot-password", post(login::forgot_password))
        .route("/api/auth/reset-password", post(login::reset_password))
        .route("/auth/oidc/login", get(oidc::login))
        .route("/auth/oidc/callback", get(oidc::callback))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.server.cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Drop expired sessions and cache entries once a minute.
fn spawn_janitor(state: SharedState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let purged = state.sessions.purge_expired()
                + state.stats_cache.purge_expired()
                + state.dashboard_cache.purge_expired()
                + state.oidc.as_ref().map_or(0, OidcClient::purge_expired);
            if purged > 0 {
                tracing::debug!(purged, "Purged expired cache entries");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Open the database, bind and serve until Ctrl+C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the database cannot be opened, the state cannot be
/// built, or the listener fails.
pub async fn run(config: Config) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let storage = Storage::open(&config.storage.database_path)?;
    let bind = config.server.bind.clone();
    let state: SharedState = Arc::new(AppState::new(config, storage)?);

    spawn_janitor(state.clone());
    let app = router(state);

    let listener = TcpListener::bind(&bind).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}
