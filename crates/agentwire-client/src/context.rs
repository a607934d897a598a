//! Process-wide agent context.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use agentwire_protocol::{AgentResult, SharedClock, SystemClock};

use crate::auth::AuthProvider;
use crate::config::{RetryClientConfig, RetryableConfig, RouterConfig, SendMode, SenderConfig};
use crate::retry_client::{CloseScope, ConnectionState};
use crate::retryable::RetryableRequest;
use crate::router::RouterClient;
use crate::sender::{Broker, Sender, Transport, WeakSender};

/// Everything an agent needs to send requests, built once at startup and
/// passed to the components that use it.
///
/// In HTTP mode the sender goes offline whenever the router client
/// disconnects or fails and replays its queue when it reconnects.
#[derive(Debug, Clone)]
pub struct AgentContext {
    identity: String,
    auth: Arc<dyn AuthProvider>,
    router: Option<RouterClient>,
    sender: Sender,
    clock: SharedClock,
}

impl AgentContext {
    /// Context sending through a router over HTTP.
    pub fn http(
        auth: Arc<dyn AuthProvider>,
        client: RetryClientConfig,
        router: RouterConfig,
        sender: SenderConfig,
    ) -> AgentResult<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        let identity = auth.identity();
        let router = RouterClient::new(auth.clone(), client, router)?;
        let sender = Sender::with_clock(
            identity.clone(),
            Transport::Http(Arc::new(router.clone())),
            SenderConfig {
                mode: SendMode::Http,
                ..sender
            },
            clock.clone(),
        )?;
        watch_router(&router, sender.downgrade());
        Ok(Self {
            identity,
            auth,
            router: Some(router),
            sender,
            clock,
        })
    }

    /// Context publishing through a message broker.
    pub fn broker(
        auth: Arc<dyn AuthProvider>,
        broker: Arc<dyn Broker>,
        sender: SenderConfig,
    ) -> AgentResult<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        let identity = auth.identity();
        let sender = Sender::with_clock(
            identity.clone(),
            Transport::Broker(broker),
            SenderConfig {
                mode: SendMode::Broker,
                ..sender
            },
            clock.clone(),
        )?;
        Ok(Self {
            identity,
            auth,
            router: None,
            sender,
            clock,
        })
    }

    /// Agent identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Authorization provider.
    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    /// Router client, in HTTP mode.
    pub fn router(&self) -> Option<&RouterClient> {
        self.router.as_ref()
    }

    /// Request sender.
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Time source.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Prepare a [`RetryableRequest`] sent through this context.
    pub fn retryable(
        &self,
        operation: &str,
        payload: Value,
        config: RetryableConfig,
    ) -> AgentResult<RetryableRequest> {
        RetryableRequest::new(self.sender.clone(), operation, payload, config)
    }

    /// Stop sending and close the router client.
    ///
    /// Returns the number of unanswered requests and the age of the
    /// youngest.
    pub fn terminate(&self) -> (usize, Option<f64>) {
        let (count, age) = self.sender.terminate();
        if count > 0 {
            info!(
                "Terminating with {} unanswered requests, youngest {:.1} sec old",
                count,
                age.unwrap_or_default()
            );
        }
        if let Some(router) = &self.router {
            router.close(CloseScope::Both);
        }
        (count, age)
    }
}

fn watch_router(router: &RouterClient, sender: WeakSender) {
    router.client().status(move |server, state| {
        let Some(sender) = sender.upgrade() else {
            return Ok(());
        };
        match state {
            ConnectionState::Connected => {
                debug!("{} connected, leaving offline mode", server);
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move { sender.disable_offline_mode().await });
                    }
                    Err(_) => warn!("No runtime to replay offline requests"),
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                sender.enable_offline_mode();
            }
            _ => {}
        }
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ServerType, StaticAuth};
    use agentwire_protocol::AgentError;
    use url::Url;

    fn context(offline_queueing: bool) -> AgentContext {
        let auth = StaticAuth::new("rs-agent-1-1")
            .with_url(ServerType::Router, Url::parse("http://127.0.0.1:1").unwrap());
        AgentContext::http(
            Arc::new(auth),
            RetryClientConfig::fast(),
            RouterConfig::default(),
            SenderConfig::default().with_offline_queueing(offline_queueing),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_router_status_toggles_offline_mode() {
        let ctx = context(true);
        let client = ctx.router().unwrap().client().clone();
        assert_eq!(ctx.identity(), "rs-agent-1-1");

        client.set_state(ConnectionState::Connected).unwrap();
        client.set_state(ConnectionState::Failed).unwrap();
        assert!(ctx.sender().is_queueing());

        client.set_state(ConnectionState::Connected).unwrap();
        for _ in 0..10 {
            if !ctx.sender().is_queueing() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!ctx.sender().is_queueing());
    }

    #[tokio::test]
    async fn test_offline_mode_ignored_without_queueing() {
        let ctx = context(false);
        let client = ctx.router().unwrap().client().clone();
        client.set_state(ConnectionState::Failed).unwrap();
        assert!(!ctx.sender().is_queueing());
    }

    #[tokio::test]
    async fn test_terminate_closes_router() {
        let ctx = context(false);
        assert_eq!(ctx.terminate(), (0, None));
        assert_eq!(ctx.router().unwrap().state(), ConnectionState::Closed);
    }

    #[test]
    fn test_retryable_requires_operation() {
        let ctx = context(false);
        let err = ctx
            .retryable("", Value::Null, RetryableConfig::default())
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
    }
}
