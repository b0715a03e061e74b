//! OpenID Connect sign-in (authorization code flow).
//!
//! `/auth/oidc/login` sends the browser to the provider with a random
//! `state`, also kept in a cookie on that browser. `/auth/oidc/callback`
//! accepts only a `state` matching the cookie, trades the code for an access
//! token, reads the userinfo endpoint and opens a normal session.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Redirect;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::SharedState;
use crate::cache::TtlCache;
use crate::config::OidcConfig;
use crate::error::{Error, Result};
use crate::login::{create_session, session_cookie};
use crate::storage::OidcIdentity;

/// How long a user may take at the provider before the login expires.
const PENDING_LOGIN_TTL: Duration = Duration::from_secs(10 * 60);

/// Cookie binding a pending login to the browser that started it.
pub const STATE_COOKIE: &str = "oidc_state";
const STATE_COOKIE_PATH: &str = "/auth/oidc";

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoints {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
}

impl From<UserInfo> for OidcIdentity {
    fn from(info: UserInfo) -> Self {
        OidcIdentity {
            subject: info.sub,
            email: info.email,
            email_verified: info.email_verified,
            name: info.name,
            preferred_username: info.preferred_username,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Client for one configured provider.
#[derive(Debug)]
pub struct OidcClient {
    config: OidcConfig,
    http: reqwest::Client,
    endpoints: OnceCell<Endpoints>,
    /// `state` parameter to the nonce sent with it.
    pending: TtlCache<String, String>,
}

impl OidcClient {
    /// # Errors
    ///
    /// Returns [`Error::Oidc`] if the HTTP client cannot be built.
    pub fn new(config: OidcConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(oidc_error)?;

        let endpoints = OnceCell::new();
        if let (Some(auth), Some(token), Some(userinfo)) = (
            config.authorize_url.clone(),
            config.token_url.clone(),
            config.userinfo_url.clone(),
        ) {
            endpoints
                .set(Endpoints {
                    authorization_endpoint: auth,
                    token_endpoint: token,
                    userinfo_endpoint: userinfo,
                })
                .map_err(|_| Error::internal("OIDC endpoints set twice"))?;
        }

        Ok(Self {
            config,
            http,
            endpoints,
            pending: TtlCache::new(PENDING_LOGIN_TTL),
        })
    }

    /// Provider endpoints, fetched from the discovery document on first use
    /// unless all three were configured.
    async fn endpoints(&self) -> Result<&Endpoints> {
        self.endpoints.get_or_try_init(|| self.discover()).await
    }

    async fn discover(&self) -> Result<Endpoints> {
        let issuer = self
            .config
            .issuer_url
            .as_deref()
            .ok_or_else(|| Error::Oidc("no issuer_url to discover endpoints".into()))?;
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(%url, "Fetching OIDC discovery document");

        self.http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(oidc_error)?
            .json::<Endpoints>()
            .await
            .map_err(oidc_error)
    }

    /// Remember a new login attempt and return its `(state, nonce)`.
    fn begin(&self) -> (String, String) {
        let state = Uuid::new_v4().simple().to_string();
        let nonce = Uuid::new_v4().simple().to_string();
        self.pending.insert(state.clone(), nonce.clone());
        (state, nonce)
    }

    /// Consume a pending login; each `state` works once.
    fn finish(&self, state: &str) -> Result<String> {
        self.pending
            .remove(&state.to_string())
            .ok_or_else(|| Error::Oidc("unknown or expired login state".into()))
    }

    pub fn purge_expired(&self) -> usize {
        self.pending.purge_expired()
    }

    fn authorize_url(&self, endpoints: &Endpoints, state: &str, nonce: &str) -> String {
        let separator = if endpoints.authorization_endpoint.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{separator}response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&nonce={}",
            endpoints.authorization_endpoint,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_url),
            urlencoding::encode(&self.config.scopes.join(" ")),
            urlencoding::encode(state),
            urlencoding::encode(nonce),
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<OidcIdentity> {
        let endpoints = self.endpoints().await?;

        let token: TokenResponse = self
            .http
            .post(&endpoints.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_url.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(oidc_error)?
            .json()
            .await
            .map_err(oidc_error)?;

        let info: UserInfo = self
            .http
            .get(&endpoints.userinfo_endpoint)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(oidc_error)?
            .json()
            .await
            .map_err(oidc_error)?;

        Ok(info.into())
    }
}

fn oidc_error(err: impl std::fmt::Display) -> Error {
    Error::Oidc(err.to_string())
}

fn client(state: &SharedState) -> Result<&OidcClient> {
    state
        .oidc
        .as_ref()
        .ok_or_else(|| Error::ServiceUnavailable("OIDC login is not configured".into()))
}

fn state_cookie(state: &SharedState, login_state: String) -> Cookie<'static> {
    // Lax still sends it on the provider's top-level redirect back.
    Cookie::build((STATE_COOKIE, login_state))
        .path(STATE_COOKIE_PATH)
        .http_only(true)
        .secure(state.config.auth.cookie_secure)
        .same_site(SameSite::Lax)
        .build()
}

/// `GET /auth/oidc/login`
pub async fn login(
    State(state): State<SharedState>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect)> {
    let oidc = client(&state)?;
    let endpoints = oidc.endpoints().await?;
    let (login_state, nonce) = oidc.begin();
    let url = oidc.authorize_url(endpoints, &login_state, &nonce);
    Ok((jar.add(state_cookie(&state, login_state)), Redirect::to(&url)))
}

/// `GET /auth/oidc/callback`
pub async fn callback(
    State(state): State<SharedState>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<(CookieJar, Redirect)> {
    let oidc = client(&state)?;

    if let Some(error) = params.error {
        warn!(%error, "Provider rejected the login");
        return Err(Error::Oidc(match params.error_description {
            Some(description) => format!("{error}: {description}"),
            None => error,
        }));
    }
    let login_state = params
        .state
        .ok_or_else(|| Error::validation("missing state parameter"))?;
    let code = params
        .code
        .ok_or_else(|| Error::validation("missing code parameter"))?;
    if jar.get(STATE_COOKIE).map(|cookie| cookie.value()) != Some(login_state.as_str()) {
        warn!("OIDC callback state does not match the browser's login");
        return Err(Error::validation("login was not started from this browser"));
    }
    oidc.finish(&login_state)?;
    let jar = jar.remove(Cookie::build(STATE_COOKIE).path(STATE_COOKIE_PATH));

    let identity = oidc.exchange_code(&code).await?;
    let user = state.storage().upsert_oidc_user(&identity)?;
    info!(user_id = user.id, "User signed in with OIDC");

    let session_id = create_session(&state, user.id);
    Ok((
        jar.add(session_cookie(&state, session_id)),
        Redirect::to(&state.config.server.public_url),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OidcConfig {
        OidcConfig {
            issuer_url: None,
            authorize_url: Some("https://id.example.edu.vn/authorize".into()),
            token_url: Some("https://id.example.edu.vn/token".into()),
            userinfo_url: Some("https://id.example.edu.vn/userinfo".into()),
            client_id: "attendance".into(),
            client_secret: "secret".into(),
            redirect_url: "http://127.0.0.1:3000/auth/oidc/callback".into(),
            scopes: vec!["openid".into(), "email".into()],
        }
    }

    #[tokio::test]
    async fn test_configured_endpoints_skip_discovery() {
        let client = OidcClient::new(config()).unwrap();
        let endpoints = client.endpoints().await.unwrap();
        assert_eq!(endpoints.token_endpoint, "https://id.example.edu.vn/token");
    }

    #[tokio::test]
    async fn test_authorize_url() {
        let client = OidcClient::new(config()).unwrap();
        let endpoints = client.endpoints().await.unwrap().clone();
        let url = client.authorize_url(&endpoints, "abc", "xyz");

        assert!(url.starts_with("https://id.example.edu.vn/authorize?response_type=code"));
        assert!(url.contains("client_id=attendance"));
        assert!(url.contains("scope=openid%20email"));
        assert!(url.contains(
            "redirect_uri=http%3A%2F%2F127.0.0.1%3A3000%2Fauth%2Foidc%2Fcallback"
        ));
        assert!(url.contains("state=abc&nonce=xyz"));
    }

    #[test]
    fn test_state_is_single_use() {
        let client = OidcClient::new(config()).unwrap();
        let (state, nonce) = client.begin();
        assert_eq!(client.finish(&state).unwrap(), nonce);
        assert!(matches!(client.finish(&state), Err(Error::Oidc(_))));
        assert!(client.finish("forged").is_err());
    }

    #[test]
    fn test_userinfo_email_verified_defaults_to_false() {
        let info: UserInfo =
            serde_json::from_str(r#"{"sub":"s1","email":"an@example.edu.vn"}"#).unwrap();
        assert!(!OidcIdentity::from(info).email_verified);

        let info: UserInfo =
            serde_json::from_str(r#"{"sub":"s1","email":"an@example.edu.vn","email_verified":true}"#)
                .unwrap();
        assert!(OidcIdentity::from(info).email_verified);
    }

    #[tokio::test]
    async fn test_discovery_requires_issuer() {
        let mut cfg = config();
        cfg.token_url = None;
        let client = OidcClient::new(cfg).unwrap();
        assert!(matches!(client.endpoints().await, Err(Error::Oidc(_))));
    }
}
