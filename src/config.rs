//! Configuration management for the attendance server.
//!
//! Configuration is layered with figment: built-in defaults, then a TOML
//! file, then environment variables prefixed with `ATTENDANCE_` (nested keys
//! separated by `__`, e.g. `ATTENDANCE_SERVER__BIND`).

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name, looked up in the working directory.
const CONFIG_FILE_NAME: &str = "attendance.toml";

/// Default database location, relative to the working directory.
const DATABASE_PATH: &str = "database/attendance.db";

/// Longest QR token we are willing to generate.
const MAX_TOKEN_LENGTH: usize = 64;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub checkin: CheckinConfig,
    pub qr: QrConfig,
    /// SMTP settings; mail features are disabled when absent.
    pub mail: Option<MailConfig>,
    /// OpenID Connect provider; OIDC login is disabled when absent.
    pub oidc: Option<OidcConfig>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, `host:port`.
    pub bind: String,
    /// Origins allowed by CORS. Empty means same-origin only.
    pub cors_origins: Vec<String>,
    /// Externally visible base URL; OIDC logins land here.
    pub public_url: String,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

/// Session and password-reset settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub session_ttl_secs: u64,
    pub reset_code_ttl_secs: u64,
    /// Mark the session cookie `Secure` (enable behind HTTPS).
    pub cookie_secure: bool,
}

/// Check-in behaviour and the live dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckinConfig {
    /// An automatic scan this soon after check-in does not check the attendee out.
    pub rescan_cooldown_secs: u64,
    pub stats_cache_ttl_secs: u64,
    pub recent_activity_limit: usize,
    /// Per-event buffer of the WebSocket broadcast channel.
    pub broadcast_capacity: usize,
}

/// QR token and image settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    pub token_length: usize,
    /// Minimum edge of rendered images, in pixels.
    pub image_size: u32,
}

/// SMTP relay used for reset codes and QR code mails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Sender mailbox, e.g. `Điểm danh <noreply@example.edu.vn>`.
    pub from: String,
}

/// OpenID Connect client registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcConfig {
    /// Issuer base URL, used for discovery when endpoints are not given.
    #[serde(default)]
    pub issuer_url: Option<String>,
    #[serde(default)]
    pub authorize_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub userinfo_url: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_smtp_port() -> u16 {
    465
}

fn default_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "email".to_string(),
        "profile".to_string(),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            cors_origins: Vec::new(),
            public_url: "http://127.0.0.1:3000".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DATABASE_PATH),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 24 * 60 * 60,
            reset_code_ttl_secs: 60 * 60,
            cookie_secure: false,
        }
    }
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            rescan_cooldown_secs: 60,
            stats_cache_ttl_secs: 30,
            recent_activity_limit: 10,
            broadcast_capacity: 64,
        }
    }
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            token_length: 10,
            image_size: 300,
        }
    }
}

impl Config {
    /// Load configuration from `attendance.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("ATTENDANCE_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.auth.session_ttl_secs == 0 {
            return Err(invalid("auth.session_ttl_secs must be greater than 0"));
        }
        if self.auth.reset_code_ttl_secs == 0 {
            return Err(invalid("auth.reset_code_ttl_secs must be greater than 0"));
        }
        if self.checkin.stats_cache_ttl_secs == 0 {
            return Err(invalid("checkin.stats_cache_ttl_secs must be greater than 0"));
        }
        if self.checkin.broadcast_capacity == 0 {
            return Err(invalid("checkin.broadcast_capacity must be greater than 0"));
        }
        if self.qr.token_length < 6 || self.qr.token_length > MAX_TOKEN_LENGTH {
            return Err(invalid(format!(
                "qr.token_length must be between 6 and {MAX_TOKEN_LENGTH}, got {}",
                self.qr.token_length
            )));
        }
        if self.qr.image_size < 64 {
            return Err(invalid("qr.image_size must be at least 64 pixels"));
        }

        if let Some(oidc) = &self.oidc {
            let explicit = oidc.authorize_url.is_some()
                && oidc.token_url.is_some()
                && oidc.userinfo_url.is_some();
            if oidc.issuer_url.is_none() && !explicit {
                return Err(invalid(
                    "oidc needs issuer_url or all of authorize_url, token_url and userinfo_url",
                ));
            }
            if oidc.client_id.is_empty() || oidc.redirect_url.is_empty() {
                return Err(invalid("oidc.client_id and oidc.redirect_url are required"));
            }
        }

        if let Some(mail) = &self.mail {
            if mail.host.is_empty() || mail.from.is_empty() {
                return Err(invalid("mail.host and mail.from are required"));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.session_ttl_secs)
    }

    #[must_use]
    pub fn reset_code_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.reset_code_ttl_secs)
    }

    #[must_use]
    pub fn stats_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.checkin.stats_cache_ttl_secs)
    }

    #[must_use]
    pub fn rescan_cooldown(&self) -> chrono::Duration {
        let secs = i64::try_from(self.checkin.rescan_cooldown_secs).unwrap_or(i64::MAX);
        chrono::Duration::seconds(secs.min(i64::MAX / 1000))
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}
