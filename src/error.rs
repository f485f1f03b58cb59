//! Error handling for the chat server

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat server error types
#[derive(Debug, Clone)]
pub enum ChatError {
    /// Malformed request (shape, size, type)
    BadRequest(String),
    /// Missing or invalid credentials
    Unauthenticated(String),
    /// Authenticated but not allowed (e.g. edit by non-owner, kick by non-admin)
    Forbidden(String),
    /// Resource does not exist
    NotFound(String),
    /// State conflict (e.g. duplicate room name)
    Conflict(String),
    /// Resource existed but was removed (e.g. editing a deleted message)
    Gone(String),
    /// Edit attempted past the edit window
    WindowExpired(String),
    /// Rate limit hit or a bounded queue is full
    Overloaded(String),
    /// A dependency is down or in fallback
    Unavailable(String),
    /// Server internal error
    Internal(String),
}

impl ChatError {
    /// HTTP status this error maps to on the REST surface
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::Gone(_) => StatusCode::GONE,
            ChatError::WindowExpired(_) => StatusCode::FORBIDDEN,
            ChatError::Overloaded(_) => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get human-readable error message
    pub fn message(&self) -> &str {
        match self {
            ChatError::BadRequest(msg) => msg,
            ChatError::Unauthenticated(msg) => msg,
            ChatError::Forbidden(msg) => msg,
            ChatError::NotFound(msg) => msg,
            ChatError::Conflict(msg) => msg,
            ChatError::Gone(msg) => msg,
            ChatError::WindowExpired(msg) => msg,
            ChatError::Overloaded(msg) => msg,
            ChatError::Unavailable(msg) => msg,
            ChatError::Internal(msg) => msg,
        }
    }

    /// Create a bad request error
    pub fn bad_request<T: Into<String>>(msg: T) -> Self {
        ChatError::BadRequest(msg.into())
    }

    /// Create an unauthenticated error
    pub fn unauthenticated<T: Into<String>>(msg: T) -> Self {
        ChatError::Unauthenticated(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden<T: Into<String>>(msg: T) -> Self {
        ChatError::Forbidden(msg.into())
    }

    /// Create a not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        ChatError::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        ChatError::Conflict(msg.into())
    }

    /// Create a gone error
    pub fn gone<T: Into<String>>(msg: T) -> Self {
        ChatError::Gone(msg.into())
    }

    /// Create a window expired error
    pub fn window_expired<T: Into<String>>(msg: T) -> Self {
        ChatError::WindowExpired(msg.into())
    }

    /// Create an overloaded error
    pub fn overloaded<T: Into<String>>(msg: T) -> Self {
        ChatError::Overloaded(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable<T: Into<String>>(msg: T) -> Self {
        ChatError::Unavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ChatError::Internal(msg.into())
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            ChatError::Unauthenticated(msg) => write!(f, "Unauthenticated: {}", msg),
            ChatError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            ChatError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ChatError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ChatError::Gone(msg) => write!(f, "Gone: {}", msg),
            ChatError::WindowExpired(msg) => write!(f, "Edit window expired: {}", msg),
            ChatError::Overloaded(msg) => write!(f, "Overloaded: {}", msg),
            ChatError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
            ChatError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for ChatError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        ChatError::Unauthenticated(format!("token error: {}", err))
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.message(),
        });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ChatError::bad_request("x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ChatError::unauthenticated("x").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ChatError::forbidden("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(ChatError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(ChatError::gone("x").status(), StatusCode::GONE);
        assert_eq!(
            ChatError::window_expired("x").status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ChatError::overloaded("x").status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ChatError::unavailable("x").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_display_carries_message() {
        let err = ChatError::window_expired("edit too late");
        assert!(err.to_string().contains("edit too late"));
    }
}
