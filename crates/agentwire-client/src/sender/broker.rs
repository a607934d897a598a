//! Message broker collaborator used in broker mode.

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use agentwire_protocol::Envelope;

/// Options for one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask brokers to persist the message
    pub persistent: bool,
    /// Ask brokers to return the message if it cannot be routed
    pub mandatory: bool,
    /// Restrict the publish to these brokers
    pub broker_ids: Option<Vec<String>>,
}

/// Failure reported by a [`Broker`].
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// No broker connection is usable.
    #[error("No connected brokers")]
    NoConnectedBrokers,

    /// Anything else.
    #[error("{0}")]
    Unexpected(String),
}

/// Outcome of a failed broker-mode send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SendError {
    /// Brokers are unreachable for now.
    #[error("temporarily offline")]
    TemporarilyOffline,

    /// The publish failed for another reason.
    #[error("send failed unexpectedly")]
    SendFailure,
}

/// Publisher of envelopes to named queues.
#[async_trait]
pub trait Broker: Send + Sync + Debug {
    /// Publish `packet` to `queue` and return the ids of the brokers used.
    async fn publish(
        &self,
        queue: &str,
        packet: &Envelope,
        options: &PublishOptions,
    ) -> Result<Vec<String>, BrokerError>;
}
