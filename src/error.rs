//! Error types for the attendance service.
//!
//! Every fallible operation in the crate returns [`Result`]. With the `web`
//! feature the error doubles as an HTTP response, so handlers can simply
//! propagate with `?`.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::{AttendeeStatus, CheckinAction, Permission};

/// The main error type for attendance operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Request Errors ===
    /// The requested record does not exist (or is not visible to the caller).
    #[error("{entity} not found")]
    NotFound {
        /// Kind of record that was looked up.
        entity: &'static str,
    },

    /// Input failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The request conflicts with existing data.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The attendee cannot move in the requested direction.
    #[error("cannot {action} an attendee who is {from}")]
    InvalidTransition {
        /// Status the attendee currently holds.
        from: AttendeeStatus,
        /// Action that was requested.
        action: CheckinAction,
    },

    /// No valid session accompanied the request.
    #[error("authentication required")]
    Unauthorized,

    /// Login failed.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// The caller lacks a permission on the event.
    #[error("missing permission: {permission}")]
    Forbidden {
        /// The permission that was required.
        permission: Permission,
    },

    // === Integration Errors ===
    /// Sending mail failed.
    #[error("mail error: {0}")]
    Mail(String),

    /// The OpenID Connect exchange failed.
    #[error("OIDC error: {0}")]
    Oidc(String),

    /// QR code generation failed.
    #[error("QR code error: {0}")]
    Qr(String),

    /// Building an export file failed.
    #[error("export error: {0}")]
    Export(String),

    /// An optional integration is not configured.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for attendance operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Short machine-readable name of the error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseOpen { .. } | Self::Database(_) | Self::DatabaseMigration { .. } => {
                "database"
            }
            Self::ConfigLoad(_) | Self::ConfigValidation { .. } => "config",
            Self::NotFound { .. } => "not_found",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Unauthorized => "unauthorized",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Forbidden { .. } => "forbidden",
            Self::Mail(_) => "mail",
            Self::Oidc(_) => "oidc",
            Self::Qr(_) => "qr",
            Self::Export(_) => "export",
            Self::ServiceUnavailable(_) => "unavailable",
            Self::Io(_) | Self::DirectoryCreate { .. } => "io",
            Self::Json(_) => "json",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the error was caused by the caller rather than the server.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Validation(_)
                | Self::Conflict(_)
                | Self::InvalidTransition { .. }
                | Self::Unauthorized
                | Self::InvalidCredentials
                | Self::Forbidden { .. }
        )
    }
}

#[cfg(feature = "web")]
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Validation(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::Unauthorized | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Oidc(_) | Self::Mail(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, axum::Json(body)).into_response()
    }
}
