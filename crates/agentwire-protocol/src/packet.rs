//! Envelopes exchanged between agents, routers and dispatchers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::OperationResult;
use crate::target::{Scope, Selector, Target};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 23;

/// Oldest protocol version that understands non-delivery results.
pub const NON_DELIVERY_MIN_VERSION: u32 = 13;

/// Action invoked when an envelope type names only an actor.
pub const DEFAULT_ACTION: &str = "index";

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

/// Kind of an outbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    /// One-way message; may still be confirmed.
    Push,
    /// Message expecting exactly one reply.
    Request,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "Push"),
            Self::Request => write!(f, "Request"),
        }
    }
}

/// A push or request envelope.
///
/// `token` identifies the logical request. `tries` accumulates the tokens of
/// earlier automatic retries so that a dispatcher can recognize a retried
/// duplicate even though the token changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Push or request
    pub kind: PacketKind,
    /// Type path such as `/actor/action`
    #[serde(rename = "type")]
    pub type_: String,
    /// Application payload
    #[serde(default)]
    pub payload: Value,
    /// Identity of the sender
    pub from: String,
    /// Unique token of the logical request
    pub token: String,
    /// Identity of a specific target agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Tags that target agents must carry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Routing scope for tag selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    /// Fan-out selector
    #[serde(default)]
    pub selector: Selector,
    /// Expiry in unix seconds, 0 for never
    #[serde(default)]
    pub expires_at: i64,
    /// Tokens used by earlier retries of this request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tries: Vec<String>,
    /// Whether brokers should persist the message
    #[serde(default)]
    pub persistent: bool,
    /// Whether a push asks for delivery confirmation
    #[serde(default)]
    pub confirm: bool,
    /// Queue or identity that replies go to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Protocol version of the sender
    #[serde(default = "default_version")]
    pub recv_version: u32,
}

impl Envelope {
    fn new(
        kind: PacketKind,
        type_: impl Into<String>,
        payload: Value,
        from: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            type_: type_.into(),
            payload,
            from: from.into(),
            token: uuid::Uuid::new_v4().to_string(),
            target: None,
            tags: Vec::new(),
            scope: None,
            selector: Selector::Any,
            expires_at: 0,
            tries: Vec::new(),
            persistent: false,
            confirm: false,
            reply_to: None,
            recv_version: PROTOCOL_VERSION,
        }
    }

    /// Create a push envelope with a fresh token.
    pub fn push(type_: impl Into<String>, payload: Value, from: impl Into<String>) -> Self {
        Self::new(PacketKind::Push, type_, payload, from)
    }

    /// Create a request envelope with a fresh token.
    pub fn request(type_: impl Into<String>, payload: Value, from: impl Into<String>) -> Self {
        Self::new(PacketKind::Request, type_, payload, from)
    }

    /// Replace the token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Set the expiry in unix seconds.
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Set the reply destination.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set the sender's protocol version.
    #[must_use]
    pub fn with_recv_version(mut self, version: u32) -> Self {
        self.recv_version = version;
        self
    }

    /// Copy routing fields from a target.
    pub fn apply_target(&mut self, target: &Target) {
        match target {
            Target::Identity(id) | Target::Agent { agent_id: id } => {
                self.target = Some(id.clone());
            }
            Target::Selection {
                tags,
                scope,
                selector,
            } => {
                self.tags = tags.clone().unwrap_or_default();
                self.scope = scope.clone();
                self.selector = selector.unwrap_or_default();
            }
        }
    }

    /// Whether the envelope has expired at `now` (unix seconds).
    ///
    /// An envelope is still live at exactly its expiry second.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at > 0 && now > self.expires_at
    }

    /// Whether the sender understands non-delivery results.
    pub fn understands_non_delivery(&self) -> bool {
        self.recv_version >= NON_DELIVERY_MIN_VERSION
    }

    /// Split the type into actor prefix and action.
    ///
    /// `/foo/bar` yields `("foo", "bar")`; `/foo` yields `("foo", "index")`.
    pub fn actor_and_action(&self) -> (&str, &str) {
        let trimmed = self.type_.trim_start_matches('/');
        match trimmed.split_once('/') {
            Some((actor, action)) if !action.is_empty() => (actor, action),
            Some((actor, _)) => (actor, DEFAULT_ACTION),
            None => (trimmed, DEFAULT_ACTION),
        }
    }

    /// Short trace text for logs.
    pub fn trace(&self) -> String {
        format!("<{}>", self.token)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind, self.type_, self.trace())?;
        if let Some(target) = &self.target {
            write!(f, " to {target}")?;
        }
        Ok(())
    }
}

/// Reply to a push or request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Token of the request being answered
    pub token: String,
    /// Identity the reply is addressed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Identity of the responder
    pub from: String,
    /// Outcome
    pub results: OperationResult,
    /// When the originating request was received, in fractional unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<f64>,
    /// Protocol version of the responder
    #[serde(default = "default_version")]
    pub recv_version: u32,
}

impl Reply {
    /// Create a reply.
    pub fn new(
        token: impl Into<String>,
        to: Option<String>,
        results: OperationResult,
        from: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            to,
            from: from.into(),
            results,
            received_at: None,
            recv_version: PROTOCOL_VERSION,
        }
    }

    /// Record when the originating request was received.
    #[must_use]
    pub fn with_received_at(mut self, received_at: f64) -> Self {
        self.received_at = Some(received_at);
        self
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Result <{}> from {} {}", self.token, self.from, self.results)
    }
}

/// Event delivered by a router over a WebSocket or long-poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id, echoed back in acknowledgements
    pub uuid: String,
    /// `Push` or `Request`
    #[serde(rename = "type")]
    pub type_: String,
    /// Type path of the carried operation
    pub path: String,
    /// Identity of the originator
    pub from: String,
    /// Operation payload
    #[serde(default)]
    pub data: Value,
    /// Protocol version of the originator
    #[serde(default)]
    pub version: Option<Value>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}> {} {} from {}", self.uuid, self.type_, self.path, self.from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_actor_and_action() {
        let env = Envelope::request("/foo/bar", json!(null), "me");
        assert_eq!(env.actor_and_action(), ("foo", "bar"));
        let env = Envelope::request("/foo", json!(null), "me");
        assert_eq!(env.actor_and_action(), ("foo", "index"));
    }

    #[test]
    fn test_expiry_boundary() {
        let env = Envelope::push("/foo/bar", json!(null), "me").with_expires_at(1_000_008);
        assert!(!env.is_expired_at(1_000_008));
        assert!(env.is_expired_at(1_000_009));
        let never = Envelope::push("/foo/bar", json!(null), "me");
        assert!(!never.is_expired_at(i64::MAX));
    }

    #[test]
    fn test_apply_target() {
        let mut env = Envelope::push("/foo/bar", json!(null), "me");
        env.apply_target(&Target::agent("rs-agent-1-1"));
        assert_eq!(env.target.as_deref(), Some("rs-agent-1-1"));

        let mut env = Envelope::push("/foo/bar", json!(null), "me");
        env.apply_target(&Target::tags(["a:b=c"]).with_selector(Selector::All));
        assert_eq!(env.tags, vec!["a:b=c".to_string()]);
        assert_eq!(env.selector, Selector::All);
        assert!(env.scope.is_none());
    }

    #[test]
    fn test_event_from_string_keys() {
        let event: Event = serde_json::from_value(json!({
            "uuid": "uuid", "type": "Push", "path": "/foo/bar",
            "from": "rs-agent-1-1", "data": {}, "version": 23
        }))
        .unwrap();
        assert_eq!(event.to_string(), "<uuid> Push /foo/bar from rs-agent-1-1");
    }

    #[test]
    fn test_old_peers_do_not_understand_non_delivery() {
        let env = Envelope::request("/foo/bar", json!(null), "me").with_recv_version(12);
        assert!(!env.understands_non_delivery());
        assert!(Envelope::request("/foo/bar", json!(null), "me").understands_non_delivery());
    }
}
