//! Agent error taxonomy.

use std::fmt;

use thiserror::Error;

/// A specialized `Result` type for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// HTTP status codes for which a retry is warranted.
///
/// These are limited to the server being inaccessible (502, 503) or the
/// server reporting that the request could not be routed for a retryable
/// reason (504).
pub const RETRY_STATUS_CODES: [u16; 3] = [502, 503, 504];

/// A non-2xx HTTP response surfaced as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    /// Response status code.
    pub status: u16,
    /// Response body, possibly empty.
    pub body: String,
    /// Value of the `Location` header, if present.
    pub location: Option<String>,
}

impl HttpError {
    /// Create an error for the given status and body.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            location: None,
        }
    }

    /// Attach a `Location` header value.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Canonical reason phrase for the status code.
    pub fn reason(&self) -> &'static str {
        http::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown Status")
    }

    /// Whether the status is one of [`RETRY_STATUS_CODES`].
    pub fn is_retryable_status(&self) -> bool {
        RETRY_STATUS_CODES.contains(&self.status)
    }

    /// Whether the status is a 5xx server error.
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.body.is_empty() {
            write!(f, "{} {}", self.status, self.reason())
        } else {
            write!(f, "{} {}: {}", self.status, self.reason(), self.body)
        }
    }
}

impl std::error::Error for HttpError {}

/// Errors raised by agent clients, senders and dispatchers.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum AgentError {
    /// Credentials were rejected; the client cannot continue.
    #[error("{0}")]
    Unauthorized(String),

    /// The server is unreachable or the client is not connected.
    #[error("{0}")]
    ConnectivityFailure(String),

    /// The server did not respond (502/503/504 or every endpoint failed).
    ///
    /// This is a specialization of [`AgentError::ConnectivityFailure`].
    #[error("{0}")]
    NotResponding(String),

    /// Transient failure; the caller should resend.
    #[error("{0}")]
    Retryable(String),

    /// The client is shutting down; do not retry, do not respond.
    #[error("{0}")]
    Terminating(String),

    /// The peer failed while processing the request.
    ///
    /// Displays the peer's detail; callers that surface it as a result
    /// report `"<server> internal error"` instead.
    #[error("{detail}")]
    InternalServer {
        /// Name of the server that failed
        server: String,
        /// Detail reported by the server
        detail: String,
    },

    /// Any other non-2xx HTTP response.
    #[error(transparent)]
    Http(HttpError),

    /// The envelope type does not resolve to a registered handler.
    #[error("Invalid request type: {0}")]
    InvalidRequestType(String),

    /// A non-idempotent request was already dispatched.
    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    /// An argument or option was rejected.
    #[error("{0}")]
    InvalidArgument(String),

    /// A connection state change that the state machine does not allow.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// State before the attempted transition
        from: String,
        /// Requested state
        to: String,
    },

    /// Failed to encode or decode JSON.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// An unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether this error means the server could not be reached.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::ConnectivityFailure(_) | Self::NotResponding(_))
    }

    /// The HTTP status carried by this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http(e) => Some(e.status),
            _ => None,
        }
    }

    /// Build an internal server error for the named server.
    pub fn internal_server(server: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InternalServer {
            server: server.into(),
            detail: detail.into(),
        }
    }
}

impl From<HttpError> for AgentError {
    fn from(err: HttpError) -> Self {
        Self::Http(err)
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_display() {
        let err = HttpError::new(400, "bad data");
        assert_eq!(err.to_string(), "400 Bad Request: bad data");
        assert_eq!(HttpError::new(404, "").to_string(), "404 Not Found");
    }

    #[test]
    fn test_retryable_status() {
        assert!(HttpError::new(503, "").is_retryable_status());
        assert!(!HttpError::new(500, "").is_retryable_status());
        assert!(HttpError::new(500, "").is_server_error());
    }

    #[test]
    fn test_internal_server_display() {
        let err = AgentError::internal_server("Router", "unprocessable");
        assert_eq!(err.to_string(), "unprocessable");
        assert!(matches!(err, AgentError::InternalServer { ref server, .. } if server == "Router"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = AgentError::InvalidStateTransition {
            from: "connected".into(),
            to: "pending".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: connected -> pending"
        );
    }

    #[test]
    fn test_is_connectivity() {
        assert!(AgentError::NotResponding("x".into()).is_connectivity());
        assert!(AgentError::ConnectivityFailure("x".into()).is_connectivity());
        assert!(!AgentError::Retryable("x".into()).is_connectivity());
    }
}
