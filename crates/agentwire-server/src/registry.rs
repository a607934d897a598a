//! Actors and the registry the dispatcher routes into.
//!
//! An [`Actor`] groups named actions under a prefix: the envelope type
//! `/foo/bar` reaches action `bar` of the actor registered as `foo`. Each
//! action declares at registration whether it is idempotent; the
//! dispatcher only runs duplicate suppression for actions that are not.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;

use agentwire_protocol::Envelope;

/// Executes one action.
#[async_trait]
pub trait ActionHandler: Send + Sync + fmt::Debug {
    /// Run the action with the envelope payload.
    ///
    /// The envelope itself is passed for handlers that need the token,
    /// sender or tags.
    async fn handle(&self, payload: Value, envelope: &Envelope) -> anyhow::Result<Value>;
}

type HandlerFn =
    Arc<dyn Fn(Value, Envelope) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Closure-backed [`ActionHandler`].
#[derive(Clone)]
pub struct FunctionHandler {
    name: String,
    handler: HandlerFn,
}

impl fmt::Debug for FunctionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionHandler")
            .field("name", &self.name)
            .finish()
    }
}

impl FunctionHandler {
    /// Handler that only looks at the payload.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::with_envelope(name, move |payload, _| handler(payload))
    }

    /// Handler that also receives the envelope.
    pub fn with_envelope<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |payload, envelope| {
                Box::pin(handler(payload, envelope)) as BoxFuture<'static, _>
            }),
        }
    }

    /// Action name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ActionHandler for FunctionHandler {
    async fn handle(&self, payload: Value, envelope: &Envelope) -> anyhow::Result<Value> {
        (self.handler)(payload, envelope.clone()).await
    }
}

/// A registered action.
#[derive(Debug, Clone)]
pub struct Action {
    handler: Arc<dyn ActionHandler>,
    idempotent: bool,
}

impl Action {
    /// Whether repeating the action is harmless.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// The handler.
    pub fn handler(&self) -> &Arc<dyn ActionHandler> {
        &self.handler
    }
}

/// Named group of actions.
#[derive(Debug, Clone)]
pub struct Actor {
    prefix: String,
    actions: HashMap<String, Action>,
}

impl Actor {
    /// Create an actor with its default prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            actions: HashMap::new(),
        }
    }

    /// Expose an action that may safely run more than once.
    #[must_use]
    pub fn idempotent(mut self, handler: FunctionHandler) -> Self {
        self.expose(handler.name.clone(), Arc::new(handler), true);
        self
    }

    /// Expose an action that must run at most once per token.
    #[must_use]
    pub fn non_idempotent(mut self, handler: FunctionHandler) -> Self {
        self.expose(handler.name.clone(), Arc::new(handler), false);
        self
    }

    /// Expose any handler under `name`.
    pub fn expose(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
        idempotent: bool,
    ) {
        self.actions.insert(
            name.into(),
            Action {
                handler,
                idempotent,
            },
        );
    }

    /// Default prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Look up an action.
    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    /// Names of the exposed actions, sorted.
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Actors by prefix.
#[derive(Debug, Default)]
pub struct ActorRegistry {
    actors: DashMap<String, Arc<Actor>>,
}

impl ActorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an actor under `prefix`, or its own prefix when `None`.
    ///
    /// Replaces any actor already registered there.
    pub fn register(&self, actor: Actor, prefix: Option<&str>) {
        let prefix = prefix.unwrap_or(actor.prefix()).to_string();
        tracing::debug!("[actors] {} -> {:?}", prefix, actor.action_names());
        self.actors.insert(prefix, Arc::new(actor));
    }

    /// Actor registered under `prefix`.
    pub fn actor_for(&self, prefix: &str) -> Option<Arc<Actor>> {
        self.actors.get(prefix).map(|a| Arc::clone(a.value()))
    }

    /// Registered prefixes, sorted.
    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.actors.iter().map(|e| e.key().clone()).collect();
        prefixes.sort();
        prefixes
    }

    /// Every `/prefix/action` the registry serves, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .actors
            .iter()
            .flat_map(|e| {
                let prefix = e.key().clone();
                e.value()
                    .action_names()
                    .into_iter()
                    .map(move |action| format!("/{prefix}/{action}"))
            })
            .collect();
        services.sort();
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn foo() -> Actor {
        Actor::new("foo")
            .idempotent(FunctionHandler::new("bar", |payload| async move {
                Ok(json!(["hello", payload]))
            }))
            .non_idempotent(FunctionHandler::new("bar_non", |payload| async move {
                Ok(payload)
            }))
    }

    #[test]
    fn test_register_under_default_and_custom_prefix() {
        let registry = ActorRegistry::new();
        registry.register(foo(), None);
        registry.register(foo(), Some("umbongo"));
        assert_eq!(registry.prefixes(), vec!["foo", "umbongo"]);
        assert!(registry.actor_for("bar").is_none());
        assert_eq!(
            registry.services(),
            vec![
                "/foo/bar",
                "/foo/bar_non",
                "/umbongo/bar",
                "/umbongo/bar_non"
            ]
        );
    }

    #[test]
    fn test_idempotence_flag() {
        let actor = foo();
        assert!(actor.action("bar").unwrap().is_idempotent());
        assert!(!actor.action("bar_non").unwrap().is_idempotent());
        assert!(actor.action("missing").is_none());
    }

    #[tokio::test]
    async fn test_envelope_handler_sees_token() {
        let handler = FunctionHandler::with_envelope("whoami", |_, envelope| async move {
            Ok(json!(envelope.token))
        });
        let envelope = Envelope::request("/foo/whoami", json!(null), "rs-agent-2-2")
            .with_token("token1");
        let result = handler.handle(json!(null), &envelope).await.unwrap();
        assert_eq!(result, json!("token1"));
        assert_eq!(handler.name(), "whoami");
    }
}
