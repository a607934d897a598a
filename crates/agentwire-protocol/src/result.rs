//! Operation results carried by replies.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Non-delivery reason: no target was specified or resolvable.
pub const NO_TARGET: &str = "no target";
/// Non-delivery reason: the target is not known to the router.
pub const UNKNOWN_TARGET: &str = "unknown target";
/// Non-delivery reason: no route exists to the target.
pub const NO_ROUTE_TO_TARGET: &str = "no route to target";
/// Non-delivery reason: the target is known but not connected.
pub const TARGET_NOT_CONNECTED: &str = "target not connected";
/// Non-delivery reason: the request expired before it could be dispatched.
pub const TTL_EXPIRATION: &str = "TTL expiration";
/// Non-delivery reason: the sender gave up retrying.
pub const RETRY_TIMEOUT: &str = "retry timeout";

/// Outcome of an operation, as normalized before crossing a sender or
/// dispatcher boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "content", rename_all = "snake_case")]
pub enum OperationResult {
    /// The operation succeeded, possibly with content.
    Success(Option<Value>),
    /// The operation failed and should not be retried.
    Error(String),
    /// The operation failed transiently and should be retried.
    Retry(String),
    /// The request could not be delivered.
    NonDelivery(String),
    /// The operation was cancelled.
    Cancel(String),
}

impl OperationResult {
    /// Successful result with content.
    pub fn success(content: impl Into<Option<Value>>) -> Self {
        Self::Success(content.into())
    }

    /// Error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Retry result.
    pub fn retry(message: impl Into<String>) -> Self {
        Self::Retry(message.into())
    }

    /// Non-delivery result.
    pub fn non_delivery(reason: impl Into<String>) -> Self {
        Self::NonDelivery(reason.into())
    }

    /// Cancel result.
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::Cancel(reason.into())
    }

    /// Whether the result is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Whether the result is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Whether the result asks for a retry.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    /// Whether the result is a non-delivery.
    pub fn is_non_delivery(&self) -> bool {
        matches!(self, Self::NonDelivery(_))
    }

    /// Whether the result is a cancellation.
    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel(_))
    }

    /// Message, reason or reason-like text of a non-success result.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Error(m) | Self::Retry(m) | Self::NonDelivery(m) | Self::Cancel(m) => Some(m),
        }
    }

    /// Short status label used in logs and statistics.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Error(_) => "error",
            Self::Retry(_) => "retry",
            Self::NonDelivery(_) => "non_delivery",
            Self::Cancel(_) => "cancel",
        }
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(None) => write!(f, "success"),
            Self::Success(Some(v)) => write!(f, "success ({v})"),
            other => write!(f, "{} ({})", other.status(), other.message().unwrap_or("")),
        }
    }
}
