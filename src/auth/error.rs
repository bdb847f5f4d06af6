use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use super::session_store::SessionError;
use crate::authz::AuthzError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// A claim or rule check ran before any verified user was loaded.
    #[error("User data is empty; the OpenID login flow has not completed")]
    EmptyUser,

    /// The provider returned attribute data that cannot be normalized.
    #[error("Invalid provider data: {0}")]
    ProviderData(String),

    /// A configured login rule is malformed.
    #[error("Login rule #{index} is malformed: {reason}")]
    RuleFormat { index: usize, reason: String },

    /// The selected role index does not exist for this user.
    #[error("Role selection {index} is out of range ({available} roles available)")]
    InvalidRoleSelection { index: usize, available: usize },

    /// The provider could not be reached or answered unexpectedly during verification.
    #[error("OpenID verification failed: {0}")]
    Verification(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<AuthzError> for AuthError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::RuleFormat { index, reason } => AuthError::RuleFormat { index, reason },
        }
    }
}

/// JSON error body returned to HTTP clients.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::EmptyUser => "empty_user",
            AuthError::ProviderData(_) => "provider_data",
            AuthError::RuleFormat { .. } => "rule_format",
            AuthError::InvalidRoleSelection { .. } => "invalid_role_selection",
            AuthError::Verification(_) => "verification_failed",
            AuthError::Session(_) => "session_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AuthError::EmptyUser => StatusCode::UNAUTHORIZED,
            AuthError::InvalidRoleSelection { .. } => StatusCode::BAD_REQUEST,
            AuthError::ProviderData(_) | AuthError::Verification(_) => StatusCode::BAD_GATEWAY,
            AuthError::RuleFormat { .. } | AuthError::Session(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Login flow error");
        }

        // Operator-facing details stay in the log
        let message = match &self {
            AuthError::RuleFormat { .. } | AuthError::Session(_) => {
                "Login is misconfigured".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                kind: "authentication_error",
                code: self.code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
