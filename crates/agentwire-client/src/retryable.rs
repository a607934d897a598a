//! Durable request that keeps resending until it gets an answer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use agentwire_protocol::{AgentError, AgentResult, OperationResult, Reply, Target};

use crate::config::RetryableConfig;
use crate::sender::{ResponseHandler, SendOptions, Sender};

const BACKOFF_FACTOR: u32 = 2;

/// How a [`RetryableRequest`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryableOutcome {
    /// Response content
    Succeeded(Option<Value>),
    /// Failure or cancellation reason
    Failed(String),
}

/// Resend delay schedule.
///
/// Every `count` resends at the same delay, the delay doubles up to the
/// maximum and `count` halves down to 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Backoff {
    delay: Duration,
    count: u32,
    retries: u32,
    max_delay: Duration,
}

impl Backoff {
    pub(crate) fn new(config: &RetryableConfig) -> Self {
        Self {
            delay: config.retry_delay,
            count: config.retry_delay_count,
            retries: 0,
            max_delay: config.max_retry_delay,
        }
    }

    /// Delay before the next resend.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        if delay.is_zero() {
            return delay;
        }
        self.retries += 1;
        if self.retries >= self.count {
            self.delay = (self.delay * BACKOFF_FACTOR).min(self.max_delay);
            self.count = (self.count / BACKOFF_FACTOR).max(1);
            self.retries = 0;
        }
        delay
    }
}

struct RetryableInner {
    operation: String,
    payload: Value,
    config: RetryableConfig,
    sender: Sender,
    expires_at: Option<i64>,
    backoff: Mutex<Backoff>,
    timer: Mutex<Option<JoinHandle<()>>>,
    raw_response: Mutex<Option<Reply>>,
    outcome: watch::Sender<Option<RetryableOutcome>>,
}

/// A request resent on `retry` and non-delivery results until it
/// succeeds, fails, is cancelled, or times out.
///
/// ```no_run
/// # async fn example(sender: agentwire_client::Sender) -> agentwire_protocol::AgentResult<()> {
/// use agentwire_client::{RetryableConfig, RetryableRequest};
/// use serde_json::json;
///
/// let request = RetryableRequest::new(
///     sender,
///     "/booter/declare",
///     json!({"agent_identity": "rs-instance-1-1"}),
///     RetryableConfig::default(),
/// )?;
/// request.run().await;
/// let outcome = request.wait().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RetryableRequest {
    inner: Arc<RetryableInner>,
}

impl fmt::Debug for RetryableRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryableRequest")
            .field("operation", &self.inner.operation)
            .field("expires_at", &self.inner.expires_at)
            .field("outcome", &*self.inner.outcome.borrow())
            .finish_non_exhaustive()
    }
}

impl RetryableRequest {
    /// Prepare a request for `operation`; nothing is sent until
    /// [`RetryableRequest::run`].
    pub fn new(
        sender: Sender,
        operation: impl Into<String>,
        payload: Value,
        config: RetryableConfig,
    ) -> AgentResult<Self> {
        let operation = operation.into();
        if operation.is_empty() {
            return Err(AgentError::InvalidArgument("operation is required".into()));
        }
        let expires_at = config
            .timeout
            .filter(|t| !t.is_zero())
            .map(|t| sender_now(&sender) + t.as_secs() as i64);
        let (outcome, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(RetryableInner {
                operation,
                payload,
                backoff: Mutex::new(Backoff::new(&config)),
                config,
                sender,
                expires_at,
                timer: Mutex::new(None),
                raw_response: Mutex::new(None),
                outcome,
            }),
        })
    }

    /// Operation type path.
    pub fn operation(&self) -> &str {
        &self.inner.operation
    }

    /// Last response received.
    pub fn raw_response(&self) -> Option<Reply> {
        self.inner.raw_response.lock().clone()
    }

    /// Outcome, if finished.
    pub fn outcome(&self) -> Option<RetryableOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Whether the request finished.
    pub fn is_done(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> RetryableOutcome {
        let mut rx = self.inner.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(abandoned),
            Err(_) => abandoned(),
        }
    }

    /// Send one attempt and arm the overall timeout on the first.
    pub async fn run(&self) {
        if self.is_done() {
            return;
        }
        let mut options = SendOptions::default();
        if let Some(expires_at) = self.inner.expires_at {
            let remaining = expires_at - sender_now(&self.inner.sender);
            if remaining <= 0 {
                self.cancel(self.timeout_message());
                return;
            }
            options.time_to_live = Some(Duration::from_secs(remaining as u64));
        }
        self.arm_timer();

        let this = self.clone();
        let callback: ResponseHandler = Arc::new(move |reply| this.handle_response(reply));
        if let Err(e) = self
            .inner
            .sender
            .send_request(
                &self.inner.operation,
                self.inner.payload.clone(),
                self.pick_target(),
                options,
                callback,
            )
            .await
        {
            self.cancel(e.to_string());
        }
    }

    /// Stop retrying and fail with `reason`.
    ///
    /// Only the first cancellation has an effect.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.finish(RetryableOutcome::Failed(reason.into()));
    }

    fn finish(&self, outcome: RetryableOutcome) {
        let finished = self.inner.outcome.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
        if finished && let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
    }

    fn arm_timer(&self) {
        let Some(timeout) = self.inner.config.timeout.filter(|t| !t.is_zero()) else {
            return;
        };
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            return;
        }
        let this = self.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let msg = this.timeout_message();
            info!("{}", msg);
            this.cancel(msg);
        }));
    }

    fn timeout_message(&self) -> String {
        let timeout = self.inner.config.timeout.unwrap_or_default();
        format!(
            "Request {} timed out after {} seconds",
            self.inner.operation,
            timeout.as_secs_f64()
        )
    }

    fn pick_target(&self) -> Option<Target> {
        let targets = &self.inner.config.targets;
        if targets.is_empty() {
            return None;
        }
        Some(Target::agent(targets[fastrand::usize(..targets.len())].clone()))
    }

    fn handle_response(&self, reply: Reply) {
        if self.is_done() {
            return;
        }
        let op = &self.inner.operation;
        let result = reply.results.clone();
        *self.inner.raw_response.lock() = Some(reply);

        let reason = result.message().filter(|m| !m.is_empty()).map(str::to_string);
        let retry = match &result {
            OperationResult::Success(content) => {
                self.finish(RetryableOutcome::Succeeded(content.clone()));
                return;
            }
            OperationResult::NonDelivery(reason) => {
                info!("Request non-delivery ({}) for {}", reason, op);
                true
            }
            OperationResult::Retry(_) => {
                let reason = reason.as_deref().unwrap_or("Service not ready");
                info!("Request {} failed ({}) and should be retried", op, reason);
                true
            }
            OperationResult::Cancel(_) => {
                let reason = reason.as_deref().unwrap_or("Service cannot execute request");
                info!("Request {} canceled ({})", op, reason);
                false
            }
            OperationResult::Error(reason) => {
                info!("Request {} failed ({})", op, reason);
                self.inner.config.retry_on_error
            }
        };

        if !retry {
            self.cancel(reason.unwrap_or_default());
            return;
        }
        let delay = self.inner.backoff.lock().next_delay();
        info!("Retrying in {} seconds...", delay.as_secs_f64());
        let this = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            this.run().await;
        });
    }
}

fn sender_now(sender: &Sender) -> i64 {
    sender.clock().unix()
}

fn abandoned() -> RetryableOutcome {
    RetryableOutcome::Failed("Request abandoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SenderConfig;
    use crate::retry_client::RequestOptions;
    use crate::sender::{RequestClient, Transport};
    use agentwire_protocol::ManualClock;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct ScriptedRouter {
        responses: Mutex<VecDeque<AgentResult<Option<Value>>>>,
        targets: Mutex<Vec<Option<Target>>>,
    }

    #[async_trait]
    impl RequestClient for ScriptedRouter {
        async fn push(
            &self,
            _: &str,
            _: &Value,
            _: Option<&Target>,
            _: RequestOptions,
        ) -> AgentResult<Option<Value>> {
            Ok(None)
        }

        async fn request(
            &self,
            _: &str,
            _: &Value,
            target: Option<&Target>,
            _: RequestOptions,
        ) -> AgentResult<Option<Value>> {
            self.targets.lock().push(target.cloned());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::Retryable("not ready".into())))
        }

        fn identity(&self) -> String {
            "rs-agent-1-1".into()
        }
    }

    fn setup(responses: Vec<AgentResult<Option<Value>>>) -> (Arc<ScriptedRouter>, Sender) {
        let router = Arc::new(ScriptedRouter {
            responses: Mutex::new(responses.into()),
            targets: Mutex::new(Vec::new()),
        });
        let config = SenderConfig {
            async_response: false,
            ..SenderConfig::default()
        };
        let sender = Sender::with_clock(
            "rs-agent-1-1",
            Transport::Http(router.clone()),
            config,
            Arc::new(ManualClock::at_unix(1_000_000)),
        )
        .unwrap();
        (router, sender)
    }

    fn fast() -> RetryableConfig {
        RetryableConfig {
            retry_delay: Duration::from_millis(100),
            retry_delay_count: 2,
            max_retry_delay: Duration::from_millis(400),
            timeout: Some(Duration::from_secs(10)),
            ..RetryableConfig::default()
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = Backoff::new(&RetryableConfig {
            retry_delay: Duration::from_secs(1),
            retry_delay_count: 2,
            max_retry_delay: Duration::from_secs(3),
            ..RetryableConfig::default()
        });
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 3]);
    }

    #[test]
    fn test_operation_required() {
        let (_, sender) = setup(Vec::new());
        let err = RetryableRequest::new(sender, "", json!({}), fast()).unwrap_err();
        assert_eq!(err.to_string(), "operation is required");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let (router, sender) = setup(vec![
            Err(AgentError::Retryable("not ready".into())),
            Err(AgentError::Retryable("not ready".into())),
            Ok(Some(json!({"r": 1}))),
        ]);
        let request = RetryableRequest::new(sender, "/foo/bar", json!({}), fast()).unwrap();
        request.run().await;
        assert_eq!(
            request.wait().await,
            RetryableOutcome::Succeeded(Some(json!({"r": 1})))
        );
        assert_eq!(router.targets.lock().len(), 3);
        assert!(request.raw_response().is_some_and(|r| r.results.is_success()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_fails_unless_retry_on_error() {
        let (_, sender) = setup(vec![Err(AgentError::Unauthorized("denied".into()))]);
        let request = RetryableRequest::new(sender, "/foo/bar", json!({}), fast()).unwrap();
        request.run().await;
        assert_eq!(request.wait().await, RetryableOutcome::Failed("denied".into()));

        let (router, sender) = setup(vec![
            Err(AgentError::Unauthorized("denied".into())),
            Ok(None),
        ]);
        let config = RetryableConfig {
            retry_on_error: true,
            ..fast()
        };
        let request = RetryableRequest::new(sender, "/foo/bar", json!({}), config).unwrap();
        request.run().await;
        assert_eq!(request.wait().await, RetryableOutcome::Succeeded(None));
        assert_eq!(router.targets.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let (_, sender) = setup(Vec::new());
        let config = RetryableConfig {
            timeout: Some(Duration::from_secs(1)),
            ..fast()
        };
        let request = RetryableRequest::new(sender, "/foo/bar", json!({}), config).unwrap();
        request.run().await;
        assert_eq!(
            request.wait().await,
            RetryableOutcome::Failed("Request /foo/bar timed out after 1 seconds".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (router, sender) = setup(Vec::new());
        let request = RetryableRequest::new(sender, "/foo/bar", json!({}), fast()).unwrap();
        request.run().await;
        request.cancel("first");
        request.cancel("second");
        assert_eq!(request.wait().await, RetryableOutcome::Failed("first".into()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(router.targets.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_pending_until_finished() {
        let (_, sender) = setup(Vec::new());
        let request = RetryableRequest::new(sender, "/foo/bar", json!({}), fast()).unwrap();
        let mut wait = tokio_test::task::spawn(request.wait());
        tokio_test::assert_pending!(wait.poll());
        assert!(!request.is_done());

        request.cancel("stop");
        assert!(wait.is_woken());
        assert_eq!(
            tokio_test::assert_ready!(wait.poll()),
            RetryableOutcome::Failed("stop".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_one_of_configured_agents() {
        let (router, sender) = setup(vec![Ok(None)]);
        let config = RetryableConfig {
            targets: vec!["rs-agent-9-9".into()],
            ..fast()
        };
        let request = RetryableRequest::new(sender, "/foo/bar", json!({}), config).unwrap();
        request.run().await;
        request.wait().await;
        assert_eq!(
            router.targets.lock().as_slice(),
            &[Some(Target::agent("rs-agent-9-9"))]
        );
    }
}
