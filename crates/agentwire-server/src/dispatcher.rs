//! Routes inbound envelopes to registered actions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info};

use agentwire_protocol::{
    ActivityCounts, AgentError, AgentResult, Envelope, OperationResult, PacketKind, Reply,
    SharedClock, TTL_EXPIRATION,
};

use crate::cache::DispatchedCache;
use crate::registry::ActorRegistry;

/// Dispatches pushes and requests to actors.
///
/// Before invoking an action the dispatcher drops envelopes whose
/// time-to-live has passed and, when it has a [`DispatchedCache`], rejects
/// non-idempotent requests whose token or any earlier retry token was
/// already dispatched.
#[derive(Debug)]
pub struct Dispatcher {
    identity: String,
    registry: Arc<ActorRegistry>,
    cache: Option<DispatchedCache>,
    clock: SharedClock,
    dispatches: ActivityCounts,
    rejects: ActivityCounts,
}

impl Dispatcher {
    /// Create a dispatcher; `cache` of `None` disables duplicate checks.
    pub fn new(
        identity: impl Into<String>,
        registry: Arc<ActorRegistry>,
        cache: Option<DispatchedCache>,
        clock: SharedClock,
    ) -> Self {
        Self {
            identity: identity.into(),
            registry,
            cache,
            clock,
            dispatches: ActivityCounts::new(),
            rejects: ActivityCounts::new(),
        }
    }

    /// Identity used as the `from` of replies.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether an actor is registered under `prefix`.
    pub fn routable(&self, prefix: &str) -> bool {
        self.registry.actor_for(prefix).is_some()
    }

    /// Duplicate cache, if enabled.
    pub fn cache(&self) -> Option<&DispatchedCache> {
        self.cache.as_ref()
    }

    /// Dispatch one envelope.
    ///
    /// Pushes always yield `Ok(None)`. Requests yield a reply echoing the
    /// request token. Handler failures become `error` results; unknown
    /// types and duplicates are returned as errors without running
    /// anything.
    pub async fn dispatch(&self, envelope: Envelope) -> AgentResult<Option<Reply>> {
        let now = self.clock.unix();
        if envelope.is_expired_at(now) {
            return Ok(self.reject_expired(&envelope, now));
        }

        let (prefix, action_name) = envelope.actor_and_action();
        let action = self
            .registry
            .actor_for(prefix)
            .and_then(|actor| actor.action(action_name).cloned())
            .ok_or_else(|| {
                self.rejects.update("unknown");
                AgentError::InvalidRequestType(format!(
                    "Unknown actor or method for dispatching request <{}> of type {}",
                    envelope.token, envelope.type_
                ))
            })?;

        let dedup = self.cache.as_ref().filter(|_| !action.is_idempotent());
        if let Some(cache) = dedup {
            self.check_duplicate(cache, &envelope)?;
        }

        debug!("Dispatching {}", envelope);
        let results = match action
            .handler()
            .handle(envelope.payload.clone(), &envelope)
            .await
        {
            Ok(content) => OperationResult::success(content),
            Err(e) => {
                error!("Failed dispatching {}: {:#}", envelope, e);
                self.rejects.update("exception");
                OperationResult::error(format!(
                    "Could not handle {} request ({})",
                    envelope.type_, e
                ))
            }
        };
        self.dispatches.update(envelope.type_.as_str());

        if let Some(cache) = dedup {
            cache.store(&envelope.token);
        }

        Ok(match envelope.kind {
            PacketKind::Push => None,
            PacketKind::Request => Some(self.reply(&envelope, results)),
        })
    }

    /// Counts of dispatched envelopes by type.
    pub fn dispatch_counts(&self) -> BTreeMap<String, u64> {
        self.dispatches.all()
    }

    /// Counts of rejections by reason.
    pub fn reject_counts(&self) -> BTreeMap<String, u64> {
        self.rejects.all()
    }

    fn reject_expired(&self, envelope: &Envelope, now: i64) -> Option<Reply> {
        info!(
            "REJECT EXPIRED {} TTL {} sec ago",
            envelope.trace(),
            now - envelope.expires_at
        );
        self.rejects.update("expired");
        match envelope.kind {
            PacketKind::Push => None,
            PacketKind::Request => {
                let results = if envelope.understands_non_delivery() {
                    OperationResult::non_delivery(TTL_EXPIRATION)
                } else {
                    OperationResult::error(format!("Could not deliver request ({TTL_EXPIRATION})"))
                };
                Some(self.reply(envelope, results))
            }
        }
    }

    fn check_duplicate(&self, cache: &DispatchedCache, envelope: &Envelope) -> AgentResult<()> {
        if let Some(by) = cache.serviced_by(&envelope.token) {
            info!("REJECT DUP {} serviced by {}", envelope.trace(), by);
            self.rejects.update("duplicate");
            return Err(AgentError::DuplicateRequest(format!(
                "<{}> already serviced by {}",
                envelope.token, by
            )));
        }
        for token in &envelope.tries {
            if let Some(by) = cache.serviced_by(token) {
                info!(
                    "REJECT RETRY DUP {} of <{}> serviced by {}",
                    envelope.trace(),
                    token,
                    by
                );
                self.rejects.update("retry duplicate");
                return Err(AgentError::DuplicateRequest(format!(
                    "<{}> retry of <{}> already serviced by {}",
                    envelope.token, token, by
                )));
            }
        }
        Ok(())
    }

    fn reply(&self, envelope: &Envelope, results: OperationResult) -> Reply {
        Reply::new(
            envelope.token.clone(),
            envelope.reply_to.clone(),
            results,
            self.identity.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupConfig;
    use crate::registry::{Actor, FunctionHandler};
    use agentwire_protocol::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    const NOW: i64 = 1_000_000;

    struct Fixture {
        dispatcher: Dispatcher,
        clock: ManualClock,
        counter: Arc<AtomicI64>,
    }

    fn fixture(with_cache: bool) -> Fixture {
        let counter = Arc::new(AtomicI64::new(0));
        let total = counter.clone();
        let actor = Actor::new("foo")
            .idempotent(FunctionHandler::new("bar", |payload| async move {
                Ok(json!(["hello", payload]))
            }))
            .idempotent(FunctionHandler::new("index", |payload| async move {
                Ok(json!(["hello", payload]))
            }))
            .idempotent(FunctionHandler::with_envelope(
                "bar2",
                |payload, envelope| async move { Ok(json!(["hello", payload, envelope.token])) },
            ))
            .idempotent(FunctionHandler::new("i_kill_you", |_| async move {
                Err(anyhow::anyhow!("I kill you!"))
            }))
            .non_idempotent(FunctionHandler::new("fail_non", |_| async move {
                Err(anyhow::anyhow!("half done"))
            }))
            .non_idempotent(FunctionHandler::new("bar_non", move |payload| {
                let total = total.clone();
                async move {
                    let n = payload.as_i64().unwrap_or_default();
                    Ok(json!(total.fetch_add(n, Ordering::SeqCst) + n))
                }
            }));
        let registry = Arc::new(ActorRegistry::new());
        registry.register(actor, None);
        let clock = ManualClock::at_unix(NOW);
        let cache =
            with_cache.then(|| DispatchedCache::new("rs-agent-1-1", &DedupConfig::default()));
        Fixture {
            dispatcher: Dispatcher::new("rs-agent-1-1", registry, cache, Arc::new(clock.clone())),
            clock,
            counter,
        }
    }

    fn request(type_: &str, payload: Value) -> Envelope {
        Envelope::request(type_, payload, "rs-agent-2-2").with_token("token")
    }

    #[test]
    fn test_routable() {
        let f = fixture(true);
        assert!(f.dispatcher.routable("foo"));
        assert!(!f.dispatcher.routable("bar"));
    }

    #[tokio::test]
    async fn test_dispatch_request() {
        let f = fixture(true);
        let reply = f
            .dispatcher
            .dispatch(request("/foo/bar", json!("you")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.token, "token");
        assert_eq!(reply.from, "rs-agent-1-1");
        assert_eq!(reply.results, OperationResult::success(json!(["hello", "you"])));
    }

    #[tokio::test]
    async fn test_dispatch_passes_envelope_when_asked() {
        let f = fixture(true);
        let reply = f
            .dispatcher
            .dispatch(request("/foo/bar2", json!("you")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reply.results,
            OperationResult::success(json!(["hello", "you", "token"]))
        );
    }

    #[tokio::test]
    async fn test_dispatch_default_action() {
        let f = fixture(true);
        let reply = f
            .dispatcher
            .dispatch(request("/foo", json!("you")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.results, OperationResult::success(json!(["hello", "you"])));
    }

    #[tokio::test]
    async fn test_push_returns_none() {
        let f = fixture(true);
        let push = Envelope::push("/foo", json!("you"), "rs-agent-2-2");
        assert!(f.dispatcher.dispatch(push).await.unwrap().is_none());
        assert_eq!(f.dispatcher.dispatch_counts().get("/foo"), Some(&1));
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let f = fixture(true);
        f.dispatcher.registry.register(
            Actor::new("foo").idempotent(FunctionHandler::new("bar", |p| async move { Ok(p) })),
            Some("umbongo"),
        );
        let reply = f
            .dispatcher
            .dispatch(request("/umbongo/bar", json!("you")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.results, OperationResult::success(json!("you")));
    }

    #[tokio::test]
    async fn test_unknown_actor_or_action() {
        let f = fixture(true);
        for type_ in ["/bad", "/foo/bar-none"] {
            let err = f
                .dispatcher
                .dispatch(request(type_, json!("you")))
                .await
                .unwrap_err();
            assert!(matches!(err, AgentError::InvalidRequestType(_)));
        }
        assert_eq!(f.dispatcher.reject_counts().get("unknown"), Some(&2));
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_result() {
        let f = fixture(true);
        let reply = f
            .dispatcher
            .dispatch(request("/foo/i_kill_you", Value::Null))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.results.is_error());
        assert!(reply.results.message().unwrap().contains("I kill you!"));
    }

    #[tokio::test]
    async fn test_expired_push_not_executed() {
        let f = fixture(true);
        let push = Envelope::push("/foo/bar_non", json!(1), "rs-agent-2-2")
            .with_expires_at(NOW + 8);
        f.clock.advance(Duration::from_secs(10));
        assert!(f.dispatcher.dispatch(push).await.unwrap().is_none());
        assert_eq!(f.counter.load(Ordering::SeqCst), 0);
        assert_eq!(f.dispatcher.reject_counts().get("expired"), Some(&1));
    }

    #[tokio::test]
    async fn test_expired_request_gets_non_delivery() {
        let f = fixture(true);
        let req = request("/foo/bar", json!("you"))
            .with_reply_to("rs-router-1-1")
            .with_expires_at(NOW + 8);
        f.clock.advance(Duration::from_secs(10));
        let reply = f.dispatcher.dispatch(req).await.unwrap().unwrap();
        assert_eq!(reply.results, OperationResult::non_delivery(TTL_EXPIRATION));
        assert_eq!(reply.to.as_deref(), Some("rs-router-1-1"));
    }

    #[tokio::test]
    async fn test_expired_request_from_old_peer_gets_error() {
        let f = fixture(true);
        let req = request("/foo/bar", json!("you"))
            .with_expires_at(NOW + 8)
            .with_recv_version(12);
        f.clock.advance(Duration::from_secs(10));
        let reply = f.dispatcher.dispatch(req).await.unwrap().unwrap();
        assert!(reply.results.is_error());
        assert!(reply.results.message().unwrap().contains("Could not deliver"));
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let f = fixture(true);
        f.clock.advance(Duration::from_secs(10));

        let live = request("/foo/bar", json!("you")).with_expires_at(NOW + 10);
        let reply = f.dispatcher.dispatch(live).await.unwrap().unwrap();
        assert!(reply.results.is_success());

        let expired = request("/foo/bar", json!("you")).with_expires_at(NOW + 9);
        let reply = f.dispatcher.dispatch(expired).await.unwrap().unwrap();
        assert!(reply.results.is_non_delivery());
    }

    #[tokio::test]
    async fn test_zero_expiry_never_checked() {
        let f = fixture(true);
        f.clock.advance(Duration::from_secs(1_000_000));
        let req = request("/foo/bar", json!("you")).with_expires_at(0);
        let reply = f.dispatcher.dispatch(req).await.unwrap().unwrap();
        assert!(reply.results.is_success());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let f = fixture(true);
        f.dispatcher.cache().unwrap().store("try");
        let mut req = request("/foo/bar_non", json!(1));
        req.token = "try".to_string();
        let err = f.dispatcher.dispatch(req).await.unwrap_err();
        assert!(matches!(err, AgentError::DuplicateRequest(_)));
        assert_eq!(f.counter.load(Ordering::SeqCst), 0);
        assert_eq!(f.dispatcher.reject_counts().get("duplicate"), Some(&1));
    }

    #[tokio::test]
    async fn test_retry_duplicate_rejected() {
        let f = fixture(true);
        f.dispatcher.cache().unwrap().store("try2");
        let mut req = request("/foo/bar_non", json!(1));
        req.tries = vec!["try1".to_string(), "try2".to_string()];
        let err = f.dispatcher.dispatch(req).await.unwrap_err();
        assert!(matches!(err, AgentError::DuplicateRequest(_)));
        assert_eq!(f.dispatcher.reject_counts().get("retry duplicate"), Some(&1));
    }

    #[tokio::test]
    async fn test_non_duplicate_accepted_and_stored() {
        let f = fixture(true);
        f.dispatcher.cache().unwrap().store("try3");
        let mut req = request("/foo/bar_non", json!(1));
        req.tries = vec!["try1".to_string(), "try2".to_string()];
        assert!(f.dispatcher.dispatch(req).await.unwrap().is_some());
        let cache = f.dispatcher.cache().unwrap();
        assert_eq!(cache.serviced_by("token").as_deref(), Some("rs-agent-1-1"));
        assert_eq!(cache.serviced_by("try1"), None);
    }

    #[tokio::test]
    async fn test_failed_handler_token_still_stored() {
        let f = fixture(true);
        let reply = f
            .dispatcher
            .dispatch(request("/foo/fail_non", Value::Null))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.results.is_error());
        let cache = f.dispatcher.cache().unwrap();
        assert_eq!(cache.serviced_by("token").as_deref(), Some("rs-agent-1-1"));

        let err = f
            .dispatcher
            .dispatch(request("/foo/fail_non", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::DuplicateRequest(_)));
    }

    #[tokio::test]
    async fn test_rejected_envelopes_not_stored() {
        let f = fixture(true);
        let expired = request("/foo/bar_non", json!(1)).with_expires_at(NOW + 1);
        f.clock.advance(Duration::from_secs(10));
        f.dispatcher.dispatch(expired).await.unwrap();
        assert!(f.dispatcher.dispatch(request("/foo/nope", json!(1))).await.is_err());
        assert!(f.dispatcher.cache().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_duplicate_accepted() {
        let f = fixture(true);
        f.dispatcher.cache().unwrap().store("token");
        let reply = f
            .dispatcher
            .dispatch(request("/foo/bar", json!("you")))
            .await
            .unwrap();
        assert!(reply.is_some());
    }

    #[tokio::test]
    async fn test_push_executed_once_with_cache() {
        let f = fixture(true);
        let push = Envelope::push("/foo/bar_non", json!(1), "rs-agent-2-2").with_token("p1");
        f.dispatcher.dispatch(push.clone()).await.unwrap();
        assert!(f.dispatcher.dispatch(push).await.is_err());
        assert_eq!(f.counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_executed_twice_without_cache() {
        let f = fixture(false);
        let push = Envelope::push("/foo/bar_non", json!(1), "rs-agent-2-2").with_token("p1");
        f.dispatcher.dispatch(push.clone()).await.unwrap();
        f.dispatcher.dispatch(push).await.unwrap();
        assert_eq!(f.counter.load(Ordering::SeqCst), 2);
        assert!(f.dispatcher.cache().is_none());
    }
}
