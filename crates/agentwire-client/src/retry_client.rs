//! Reconnecting HTTP client with a request retry policy.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agentwire_http::{BalancedHttpClient, CallOptions, EXPIRES_AT_HEADER, Verb};
use agentwire_protocol::{
    AgentError, AgentResult, AtomicStats, ClientStats, HttpError, SharedClock, SystemClock,
};

use crate::auth::{AuthProvider, ServerType};
use crate::config::RetryClientConfig;

/// Connection state of a [`RetryClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not yet initialized
    Pending,
    /// Health check passed; requests are accepted
    Connected,
    /// Server unreachable; a reconnect loop is running
    Disconnected,
    /// Unrecoverable failure
    Failed,
    /// No longer receiving; in-flight sends still allowed
    Closing,
    /// Shut down; no further transitions
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What [`RetryClient::close`] shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseScope {
    /// Stop receiving but keep sending
    Receive,
    /// Close everything
    #[default]
    Both,
}

/// Per-request options for [`RetryClient::make_request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Request UUID; generated when absent
    pub request_uuid: Option<String>,
    /// How long the request stays meaningful; non-positive means no expiry
    pub time_to_live: Option<Duration>,
    /// Overrides the configured request timeout
    pub request_timeout: Option<Duration>,
    /// Timeout of a long-poll
    pub poll_timeout: Option<Duration>,
    /// Parameter names hidden in logs
    pub filter_params: Vec<String>,
    /// Extra headers
    pub headers: HashMap<String, String>,
}

impl RequestOptions {
    /// Use the given request UUID.
    #[must_use]
    pub fn with_request_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.request_uuid = Some(uuid.into());
        self
    }

    /// Set the time-to-live.
    #[must_use]
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// Callback notified of connection state changes.
pub type StatusCallback =
    Arc<dyn Fn(ServerType, ConnectionState) -> anyhow::Result<()> + Send + Sync>;

/// Callback notified after every successful request.
pub type CommunicatedCallback = Arc<dyn Fn() + Send + Sync>;

/// Hook run after the client connects, before it is used.
pub type EnableUseHook = Arc<dyn Fn() -> BoxFuture<'static, AgentResult<()>> + Send + Sync>;

struct Inner {
    server_type: ServerType,
    server_name: String,
    auth: Arc<dyn AuthProvider>,
    config: RetryClientConfig,
    clock: SharedClock,
    state: Mutex<ConnectionState>,
    http: RwLock<Option<Arc<BalancedHttpClient>>>,
    status_callbacks: Mutex<Vec<StatusCallback>>,
    communicated_callbacks: Mutex<Vec<CommunicatedCallback>>,
    enable_use: Mutex<Option<EnableUseHook>>,
    reconnecting: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    stats: AtomicStats,
}

/// Durable client for one server type.
///
/// Wraps a [`BalancedHttpClient`] with a [`ConnectionState`] machine,
/// a reconnect loop, and a retry policy that classifies failures:
///
/// | failure | outcome |
/// |---|---|
/// | 301/302 | auth provider told to redirect, then [`AgentError::Retryable`] |
/// | 401 | [`AgentError::Unauthorized`] |
/// | 403 | auth provider told the session expired, then [`AgentError::Retryable`] |
/// | 449 | one resend with a `:retry` suffixed UUID, if the budget allows |
/// | other 5xx | [`AgentError::InternalServer`] |
/// | not responding | resend with the same UUID until the budget runs out, then disconnect |
/// | anything else | returned as is |
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct RetryClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for RetryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryClient")
            .field("server_type", &self.inner.server_type)
            .field("server_name", &self.inner.server_name)
            .field("state", &*self.inner.state.lock())
            .field("reconnecting", &self.inner.reconnecting.load(Ordering::Relaxed))
            .finish()
    }
}

impl RetryClient {
    /// Create a client in the `pending` state.
    ///
    /// Fails if the configuration lacks an API version or the auth
    /// provider has no URL for `server_type`.
    pub fn new(
        server_type: ServerType,
        auth: Arc<dyn AuthProvider>,
        config: RetryClientConfig,
    ) -> AgentResult<Self> {
        Self::with_clock(server_type, auth, config, Arc::new(SystemClock))
    }

    /// Same as [`RetryClient::new`] with an explicit clock.
    pub fn with_clock(
        server_type: ServerType,
        auth: Arc<dyn AuthProvider>,
        config: RetryClientConfig,
        clock: SharedClock,
    ) -> AgentResult<Self> {
        config.validate()?;
        let server_name = config.server_name_for(server_type);
        let http = create_http_client(server_type, auth.as_ref(), &config)?;
        Ok(Self {
            inner: Arc::new(Inner {
                server_type,
                server_name,
                auth,
                config,
                clock,
                state: Mutex::new(ConnectionState::Pending),
                http: RwLock::new(Some(Arc::new(http))),
                status_callbacks: Mutex::new(Vec::new()),
                communicated_callbacks: Mutex::new(Vec::new()),
                enable_use: Mutex::new(None),
                reconnecting: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
                stats: AtomicStats::new(),
            }),
        })
    }

    /// Server type.
    pub fn server_type(&self) -> ServerType {
        self.inner.server_type
    }

    /// Server name used in error messages.
    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    /// Configuration.
    pub fn config(&self) -> &RetryClientConfig {
        &self.inner.config
    }

    /// Auth provider.
    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.inner.auth
    }

    /// Clock.
    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Whether the client is closed.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Whether a reconnect loop is active.
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    /// Request statistics.
    pub fn stats(&self) -> ClientStats {
        self.inner.stats.snapshot()
    }

    /// Register a state change callback and return the current state.
    ///
    /// Callbacks run on transitions into `connected`, `disconnected` and
    /// `failed`. Their errors are logged, never returned.
    pub fn status<F>(&self, callback: F) -> ConnectionState
    where
        F: Fn(ServerType, ConnectionState) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.status_callbacks.lock().push(Arc::new(callback));
        self.state()
    }

    /// Register a callback run after every successful request.
    pub fn communicated<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.communicated_callbacks.lock().push(Arc::new(callback));
    }

    /// Install the hook run each time the client connects.
    pub fn on_enable_use<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AgentResult<()>> + Send + 'static,
    {
        let hook: EnableUseHook = Arc::new(move || Box::pin(hook()));
        *self.inner.enable_use.lock() = Some(hook);
    }

    /// Change state.
    ///
    /// A closed client ignores every transition, as does a transition into
    /// the current state. Entering `pending` again is rejected. Entering
    /// `disconnected` starts the reconnect loop.
    pub fn set_state(&self, new: ConnectionState) -> AgentResult<()> {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed || *state == new {
                return Ok(());
            }
            if new == ConnectionState::Pending {
                return Err(AgentError::InvalidStateTransition {
                    from: state.to_string(),
                    to: new.to_string(),
                });
            }
            debug!(
                "{} client state changed from {} to {}",
                self.inner.server_type, *state, new
            );
            *state = new;
            AtomicStats::bump(&self.inner.stats.state_changes);
            self.inner.status_callbacks.lock().clone()
        };

        if matches!(
            new,
            ConnectionState::Connected | ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            for callback in callbacks {
                if let Err(e) = callback(self.inner.server_type, new) {
                    error!("Failed status callback: {}", e);
                }
            }
        }
        if new == ConnectionState::Disconnected {
            self.reconnect();
        }
        Ok(())
    }

    fn transition(&self, new: ConnectionState) {
        if let Err(e) = self.set_state(new) {
            warn!("{}", e);
        }
    }

    /// Check health and, if connected, run the enable-use hook.
    ///
    /// Returns whether the client ended up connected. Failures leave the
    /// client disconnected with a reconnect loop running.
    pub async fn init(&self) -> bool {
        let result = async {
            if self.check_health().await == ConnectionState::Connected {
                self.enable_use().await?;
            }
            Ok::<_, AgentError>(())
        }
        .await;
        if let Err(e) = result {
            error!("Failed to initialize {} client: {}", self.inner.server_type, e);
            self.transition(ConnectionState::Disconnected);
        }
        self.state() == ConnectionState::Connected
    }

    /// Health-check the server and update the state from the outcome.
    pub async fn check_health(&self) -> ConnectionState {
        let result = match self.http() {
            Ok(http) => http.check_health(None).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => self.transition(ConnectionState::Connected),
            Err(e) => {
                error!("Failed {} health check: {}", self.inner.server_type, e);
                self.transition(ConnectionState::Disconnected);
            }
        }
        self.state()
    }

    async fn enable_use(&self) -> AgentResult<()> {
        let hook = self.inner.enable_use.lock().clone();
        match hook {
            Some(hook) => hook().await,
            None => Ok(()),
        }
    }

    /// Start the reconnect loop unless one is already running.
    ///
    /// The first attempt comes after a random delay below the reconnect
    /// interval, then one per interval. Each attempt recreates the HTTP
    /// client, checks health and runs the enable-use hook. The loop ends
    /// once the client is connected or closed.
    pub fn reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Cannot reconnect {} client outside a runtime",
                self.inner.server_type
            );
            self.inner.reconnecting.store(false, Ordering::SeqCst);
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.reconnect_interval;
        let server_type = self.inner.server_type;
        let task = runtime.spawn(async move {
            debug!("{} reconnect task started", server_type);
            tokio::time::sleep(interval.mul_f64(fastrand::f64())).await;
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if (Self { inner }).reconnect_attempt().await {
                    break;
                }
            }
            debug!("{} reconnect task stopped", server_type);
        });
        *self.inner.reconnect_task.lock() = Some(task);
    }

    /// One reconnect attempt; returns true when the loop should stop.
    async fn reconnect_attempt(&self) -> bool {
        if self.is_closed() {
            self.inner.reconnecting.store(false, Ordering::SeqCst);
            return true;
        }
        AtomicStats::bump(&self.inner.stats.reconnects);
        let attempt = async {
            let http = create_http_client(
                self.inner.server_type,
                self.inner.auth.as_ref(),
                &self.inner.config,
            )?;
            *self.inner.http.write() = Some(Arc::new(http));
            if self.check_health().await == ConnectionState::Connected {
                self.enable_use().await?;
            }
            Ok::<_, AgentError>(())
        }
        .await;

        match attempt {
            Ok(()) if self.state() == ConnectionState::Connected => {
                info!("{} client reconnected", self.inner.server_type);
                self.inner.reconnecting.store(false, Ordering::SeqCst);
                true
            }
            Ok(()) => false,
            Err(e) => {
                error!("Failed {} reconnect: {}", self.inner.server_type, e);
                self.transition(ConnectionState::Disconnected);
                if self.is_closed() {
                    self.inner.reconnecting.store(false, Ordering::SeqCst);
                    return true;
                }
                false
            }
        }
    }

    fn http(&self) -> AgentResult<Arc<BalancedHttpClient>> {
        self.inner.http.read().clone().ok_or_else(|| {
            AgentError::ConnectivityFailure(format!(
                "{} client not connected",
                self.inner.server_type
            ))
        })
    }

    async fn ensure_usable(&self) -> AgentResult<()> {
        let not_connected = || {
            AgentError::ConnectivityFailure(format!(
                "{} client not connected",
                self.inner.server_type
            ))
        };
        match self.state() {
            ConnectionState::Closed => Err(AgentError::Terminating(format!(
                "{} client terminating",
                self.inner.server_type
            ))),
            ConnectionState::Connected | ConnectionState::Closing => Ok(()),
            ConnectionState::Disconnected if !self.is_reconnecting() => {
                if self.check_health().await != ConnectionState::Connected {
                    return Err(not_connected());
                }
                if let Err(e) = self.enable_use().await {
                    error!("Failed to enable {} client: {}", self.inner.server_type, e);
                    self.transition(ConnectionState::Disconnected);
                    return Err(not_connected());
                }
                Ok(())
            }
            _ => Err(not_connected()),
        }
    }

    /// Issue a request, retrying per the classification table.
    ///
    /// `request_type` names the request in logs; the path is used when
    /// absent. The retry budget ends at the earlier of the time-to-live
    /// and the configured retry timeout.
    pub async fn make_request(
        &self,
        verb: Verb,
        path: &str,
        params: &Value,
        request_type: Option<&str>,
        options: RequestOptions,
    ) -> AgentResult<Option<Value>> {
        let request_type = request_type.unwrap_or(path);
        self.ensure_usable().await?;

        let now = self.inner.clock.unix_f64();
        let ttl = options.time_to_live.filter(|t| !t.is_zero());
        let retry_timeout = self.inner.config.retry_timeout;
        let window = ttl.map_or(retry_timeout, |t| t.min(retry_timeout));
        let expires_at = now + window.as_secs_f64();

        let mut headers = self.inner.auth.headers();
        headers.extend(options.headers);
        if let Some(ttl) = ttl {
            let header = (now + ttl.as_secs_f64()) as i64;
            headers.insert(EXPIRES_AT_HEADER.to_string(), header.to_string());
        }
        let mut uuid = options
            .request_uuid
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut call = CallOptions {
            request_uuid: Some(uuid.clone()),
            headers,
            request_timeout: options.request_timeout,
            poll_timeout: options.poll_timeout,
            filter_params: options.filter_params,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let http = self.http()?;
            AtomicStats::bump(&self.inner.stats.requests);
            let started = Instant::now();
            match http.request(verb, path, params, &call).await {
                Ok(result) => {
                    if self.is_closed() {
                        return Err(AgentError::Terminating(format!(
                            "{} client terminating",
                            self.inner.server_type
                        )));
                    }
                    self.inner
                        .stats
                        .record_latency_us(started.elapsed().as_micros() as u64);
                    AtomicStats::bump(&self.inner.stats.completed);
                    let callbacks = self.inner.communicated_callbacks.lock().clone();
                    for callback in callbacks {
                        callback();
                    }
                    return Ok(result);
                }
                Err(err) => {
                    match self
                        .handle_exception(err, request_type, &uuid, expires_at, attempt)
                        .await
                    {
                        Ok(next) => {
                            AtomicStats::bump(&self.inner.stats.retries);
                            uuid = next;
                            call.request_uuid = Some(uuid.clone());
                        }
                        Err(e) => {
                            AtomicStats::bump(&self.inner.stats.failures);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Classify a failed request.
    ///
    /// `Ok(uuid)` means resend with that UUID; `Err` is the error to raise.
    async fn handle_exception(
        &self,
        err: AgentError,
        request_type: &str,
        uuid: &str,
        expires_at: f64,
        attempt: u32,
    ) -> AgentResult<String> {
        match err {
            AgentError::Http(e) => match e.status {
                301 | 302 => Err(self.handle_redirect(e, request_type, uuid)),
                401 => Err(AgentError::Unauthorized(e.body)),
                403 => {
                    self.inner.auth.expired();
                    Err(AgentError::Retryable("Authorization expired".to_string()))
                }
                449 => {
                    self.handle_retry_with(e, request_type, uuid, expires_at, attempt)
                        .await
                }
                status if status >= 500 => Err(AgentError::internal_server(
                    self.inner.server_name.clone(),
                    e.body,
                )),
                _ => Err(AgentError::Http(e)),
            },
            AgentError::NotResponding(message) => {
                self.handle_not_responding(message, request_type, uuid, expires_at, attempt)
                    .await?;
                Ok(uuid.to_string())
            }
            other => Err(other),
        }
    }

    fn handle_redirect(&self, e: HttpError, request_type: &str, uuid: &str) -> AgentError {
        info!(
            "Received REDIRECT {} for {} request <{}>",
            e, request_type, uuid
        );
        match e.location.as_deref() {
            Some(location) => {
                info!("Requesting auth client to handle redirect to {:?}", location);
                self.inner.auth.redirect(location);
                AgentError::Retryable(e.body)
            }
            None => AgentError::internal_server(
                self.inner.server_name.clone(),
                "No redirect location provided",
            ),
        }
    }

    async fn handle_retry_with(
        &self,
        e: HttpError,
        request_type: &str,
        uuid: &str,
        expires_at: f64,
        attempt: u32,
    ) -> AgentResult<String> {
        match self.retry_interval(expires_at, attempt, Some(1)) {
            Some(interval) if !interval.is_zero() => {
                error!(
                    "Retrying {} request <{}> in {} seconds in response to retryable error ({})",
                    request_type,
                    uuid,
                    interval.as_secs_f64(),
                    e.body
                );
                self.wait(interval).await;
                Ok(format!("{uuid}:retry"))
            }
            _ => Err(AgentError::Retryable(e.body)),
        }
    }

    async fn handle_not_responding(
        &self,
        message: String,
        request_type: &str,
        uuid: &str,
        expires_at: f64,
        attempt: u32,
    ) -> AgentResult<()> {
        match self.retry_interval(expires_at, attempt, None) {
            Some(interval) if !interval.is_zero() => {
                error!(
                    "Retrying {} request <{}> in {} seconds in response to routing failure ({})",
                    request_type,
                    uuid,
                    interval.as_secs_f64(),
                    message
                );
                self.wait(interval).await;
                Ok(())
            }
            Some(_) => {
                self.transition(ConnectionState::Disconnected);
                Err(AgentError::ConnectivityFailure(format!(
                    "{message} after {attempt} attempts"
                )))
            }
            None => {
                self.transition(ConnectionState::Disconnected);
                Err(AgentError::ConnectivityFailure(message))
            }
        }
    }

    /// Wait before resending after `attempt` failed.
    ///
    /// `None` when retries are disabled; zero when the attempt limit is
    /// exceeded or the next wait would end past `expires_at` (unix seconds).
    /// Otherwise the attempt's entry in the interval table, repeating the
    /// last entry for later attempts.
    pub fn retry_interval(
        &self,
        expires_at: f64,
        attempt: u32,
        max_attempts: Option<u32>,
    ) -> Option<Duration> {
        let config = &self.inner.config;
        if !config.retry_enabled {
            return None;
        }
        if max_attempts.is_some_and(|max| attempt > max) {
            return Some(Duration::ZERO);
        }
        let index = attempt.saturating_sub(1) as usize;
        let interval = config
            .retry_intervals
            .get(index)
            .or_else(|| config.retry_intervals.last())
            .copied()
            .unwrap_or_default();
        if self.inner.clock.unix_f64() + interval.as_secs_f64() > expires_at {
            Some(Duration::ZERO)
        } else {
            Some(interval)
        }
    }

    pub(crate) async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Close the client.
    ///
    /// [`CloseScope::Receive`] only moves to `closing`. [`CloseScope::Both`]
    /// also drops the HTTP client and stops the reconnect loop.
    pub fn close(&self, scope: CloseScope) {
        match scope {
            CloseScope::Receive => self.transition(ConnectionState::Closing),
            CloseScope::Both => {
                if let Some(task) = self.inner.reconnect_task.lock().take() {
                    task.abort();
                }
                self.inner.reconnecting.store(false, Ordering::SeqCst);
                *self.inner.http.write() = None;
                self.transition(ConnectionState::Closed);
            }
        }
    }
}

fn create_http_client(
    server_type: ServerType,
    auth: &dyn AuthProvider,
    config: &RetryClientConfig,
) -> AgentResult<BalancedHttpClient> {
    let endpoints = auth.endpoints_for(server_type).ok_or_else(|| {
        AgentError::InvalidArgument(format!(
            "Auth client does not support server type {server_type}"
        ))
    })?;
    BalancedHttpClient::new(endpoints, config.http_config(server_type))
}
