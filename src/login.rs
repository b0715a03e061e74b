//! Username/password accounts, sessions and the auth middleware.

use std::ops::Deref;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::{AppState, SharedState};
use crate::error::{Error, Result};
use crate::mailer::generate_reset_code;
use crate::models::{validate_email, User};

/// Name of the cookie carrying the session id.
pub const SESSION_COOKIE: &str = "session";

const MIN_PASSWORD_LEN: usize = 8;

lazy_static! {
    static ref USERNAME_RE: Regex = Regex::new(r"^[A-Za-z0-9._-]{3,32}$").unwrap();
}

/// The signed-in user, placed in request extensions by [`require_auth`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl Deref for CurrentUser {
    type Target = User;

    fn deref(&self) -> &User {
        &self.0
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub password: String,
}

/// `username` may also be the account's e-mail address.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordChangeRequest {
    #[serde(default)]
    pub current_password: Option<String>,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetConfirm {
    pub email: String,
    pub code: String,
    pub new_password: String,
}

/// Hash a password with Argon2 and a random salt.
///
/// # Errors
///
/// Returns an internal error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::internal(format!("password hashing failed: {e}")))
}

/// Check a password against a stored Argon2 hash.
///
/// # Errors
///
/// Returns an internal error if the stored hash is malformed.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| Error::internal(format!("invalid password hash format: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Start a session for `user_id` and return its id.
pub fn create_session(state: &AppState, user_id: i64) -> String {
    let session_id = Uuid::new_v4().to_string();
    state.sessions.insert(session_id.clone(), user_id);
    session_id
}

/// End every session of `user_id` except `keep`.
pub fn end_other_sessions(state: &AppState, user_id: i64, keep: Option<&str>) {
    state
        .sessions
        .retain(|session_id, owner| *owner != user_id || Some(session_id.as_str()) == keep);
}

/// The user id behind a live session.
pub fn validate_session(state: &AppState, session_id: &str) -> Option<i64> {
    state.sessions.get(&session_id.to_string())
}

/// Cookie for a fresh session.
pub fn session_cookie(state: &AppState, session_id: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, session_id))
        .path("/")
        .http_only(true)
        .secure(state.config.auth.cookie_secure)
        .same_site(SameSite::Lax)
        .build()
}

/// Resolve the session cookie into a [`CurrentUser`] extension, or answer 401.
pub async fn require_auth(
    State(state): State<SharedState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let user = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| validate_session(&state, cookie.value()))
        .map(|user_id| state.storage().get_user(user_id));

    match user {
        Some(Ok(Some(user))) => {
            request.extensions_mut().insert(CurrentUser(user));
            next.run(request).await
        }
        Some(Err(e)) => e.into_response(),
        Some(Ok(None)) | None => Error::Unauthorized.into_response(),
    }
}

/// `POST /api/auth/register`
pub async fn register(
    State(state): State<SharedState>,
    jar: CookieJar,
    Json(req): Json<RegisterRequest>,
) -> Result<(CookieJar, (StatusCode, Json<User>))> {
    let username = req.username.trim();
    if !USERNAME_RE.is_match(username) {
        return Err(Error::validation(
            "username must be 3-32 letters, digits, '.', '-' or '_'",
        ));
    }
    validate_email(req.email.as_deref())?;
    validate_password(&req.password)?;

    let hash = hash_password(&req.password)?;
    let display_name = req.display_name.as_deref().unwrap_or(username);
    let user = state
        .storage()
        .create_user(username, req.email.as_deref(), display_name, Some(&hash))?;

    info!(user_id = user.id, username = %user.username, "Registered user");
    let session_id = create_session(&state, user.id);
    Ok((
        jar.add(session_cookie(&state, session_id)),
        (StatusCode::CREATED, Json(user)),
    ))
}

/// `POST /api/auth/login`
pub async fn login(
    State(state): State<SharedState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, Json<User>)> {
    let ident = req.username.trim();
    let user = {
        let storage = state.storage();
        match storage.find_user_by_username(ident)? {
            Some(user) => Some(user),
            None if ident.contains('@') => storage.find_user_by_email(ident)?,
            None => None,
        }
    };

    let Some(user) = user else {
        return Err(Error::InvalidCredentials);
    };
    // OIDC-only accounts have no password to check.
    let Some(hash) = user.password_hash.as_deref() else {
        return Err(Error::InvalidCredentials);
    };
    if !verify_password(&req.password, hash)? {
        warn!(username = %user.username, "Failed login");
        return Err(Error::InvalidCredentials);
    }

    info!(user_id = user.id, "User logged in");
    let session_id = create_session(&state, user.id);
    Ok((jar.add(session_cookie(&state, session_id)), Json(user)))
}

/// `POST /api/auth/logout`
pub async fn logout(State(state): State<SharedState>, jar: CookieJar) -> (CookieJar, StatusCode) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.invalidate(&cookie.value().to_string());
    }
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        StatusCode::NO_CONTENT,
    )
}

/// `GET /api/auth/me`
pub async fn me(Extension(user): Extension<CurrentUser>) -> Json<User> {
    Json(user.0)
}

/// `POST /api/auth/change-password`
///
/// The current password is required unless the account has none yet
/// (signed up through OIDC).
pub async fn change_password(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    jar: CookieJar,
    Json(req): Json<PasswordChangeRequest>,
) -> Result<StatusCode> {
    if let Some(hash) = user.password_hash.as_deref() {
        let current = req.current_password.as_deref().unwrap_or_default();
        if !verify_password(current, hash)? {
            return Err(Error::InvalidCredentials);
        }
    }
    validate_password(&req.new_password)?;

    let hash = hash_password(&req.new_password)?;
    state.storage().set_password_hash(user.id, &hash)?;
    let current = jar.get(SESSION_COOKIE).map(|cookie| cookie.value().to_string());
    end_other_sessions(&state, user.id, current.as_deref());
    info!(user_id = user.id, "Password changed");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/auth/forgot-password`
///
/// Always answers 202 for a well-formed request so the endpoint does not
/// reveal which addresses are registered.
pub async fn forgot_password(
    State(state): State<SharedState>,
    Json(req): Json<PasswordResetRequest>,
) -> Result<StatusCode> {
    let Some(mailer) = state.mailer.as_ref() else {
        return Err(Error::ServiceUnavailable("mail is not configured".into()));
    };

    let email = req.email.trim();
    let user = state.storage().find_user_by_email(email)?;
    let Some(user) = user else {
        info!("Password reset requested for unknown address");
        return Ok(StatusCode::ACCEPTED);
    };

    let code = generate_reset_code();
    let ttl = state.config.reset_code_ttl();
    let expires = Utc::now()
        + chrono::Duration::from_std(ttl).map_err(|e| Error::internal(e.to_string()))?;
    state.storage().set_reset_code(user.id, Some((&code, expires)))?;

    // Same answer as for an unknown address.
    if let Err(e) = mailer
        .send_password_reset(email, &code, ttl.as_secs() / 60)
        .await
    {
        warn!(user_id = user.id, error = %e, "Failed to send reset code");
    }
    Ok(StatusCode::ACCEPTED)
}

/// `POST /api/auth/reset-password`
pub async fn reset_password(
    State(state): State<SharedState>,
    Json(req): Json<PasswordResetConfirm>,
) -> Result<StatusCode> {
    let invalid = || Error::validation("invalid or expired reset code");
    validate_password(&req.new_password)?;
    // Hash before taking the storage lock.
    let hash = hash_password(&req.new_password)?;

    let user_id = {
        let storage = state.storage();
        let user = storage
            .find_user_by_email(req.email.trim())?
            .ok_or_else(invalid)?;
        let (stored, expires) = storage.reset_code(user.id)?.ok_or_else(invalid)?;

        if expires < Utc::now() {
            storage.set_reset_code(user.id, None)?;
            return Err(invalid());
        }
        if !stored.eq_ignore_ascii_case(req.code.trim()) {
            return Err(invalid());
        }
        storage.set_password_hash(user.id, &hash)?;
        user.id
    };

    end_other_sessions(&state, user_id, None);
    info!(user_id, "Password reset with code");
    Ok(StatusCode::NO_CONTENT)
}
