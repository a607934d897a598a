//! Configuration for retry clients, the router listen loop, the sender and
//! retryable requests.
//!
//! Every struct deserializes with missing fields taking their defaults, and
//! writes durations as fractional seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use agentwire_http::{Balancing, DEFAULT_HEALTH_CHECK_PATH, HttpClientConfig};
use agentwire_protocol::{AgentError, AgentResult, secs};

use crate::auth::ServerType;

/// Configuration for [`crate::RetryClient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryClientConfig {
    /// Name of the server in error messages; defaults to the server type's name
    pub server_name: Option<String>,

    /// API version sent with every request (required)
    pub api_version: Option<String>,

    /// Connection establishment timeout
    #[serde(with = "secs")]
    pub open_timeout: Duration,

    /// Request timeout
    #[serde(with = "secs")]
    pub request_timeout: Duration,

    /// Upper bound on how long one request keeps being retried
    #[serde(with = "secs")]
    pub retry_timeout: Duration,

    /// Wait before each retry, indexed by attempt; the last entry repeats
    #[serde(with = "secs::list")]
    pub retry_intervals: Vec<Duration>,

    /// Period of the reconnect timer
    #[serde(with = "secs")]
    pub reconnect_interval: Duration,

    /// Whether failed requests are retried at all
    pub retry_enabled: bool,

    /// Parameter names whose values are hidden in logs
    pub filter_params: Vec<String>,

    /// Run long-polls inline instead of on a spawned task
    pub non_blocking: bool,

    /// Timeout applied to health checks
    #[serde(with = "secs")]
    pub health_check_timeout: Duration,

    /// Path probed by health checks
    pub health_check_path: String,

    /// Endpoint selection policy
    pub balancing: Balancing,

    /// Proxy URL; `None` disables proxying
    pub proxy: Option<String>,
}

impl Default for RetryClientConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            api_version: None,
            open_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(35),
            retry_timeout: Duration::from_secs(25),
            retry_intervals: vec![
                Duration::from_secs(4),
                Duration::from_secs(12),
                Duration::from_secs(36),
            ],
            reconnect_interval: Duration::from_secs(15),
            retry_enabled: false,
            filter_params: Vec::new(),
            non_blocking: false,
            health_check_timeout: Duration::from_secs(5),
            health_check_path: DEFAULT_HEALTH_CHECK_PATH.to_string(),
            balancing: Balancing::RoundRobin,
            proxy: agentwire_http::detect_proxy(),
        }
    }
}

impl RetryClientConfig {
    /// Short intervals with retries enabled, suited to tests.
    pub fn fast() -> Self {
        Self {
            api_version: Some("2.0".to_string()),
            open_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            retry_timeout: Duration::from_secs(2),
            retry_intervals: vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(200),
            ],
            reconnect_interval: Duration::from_millis(100),
            retry_enabled: true,
            health_check_timeout: Duration::from_millis(500),
            proxy: None,
            ..Self::default()
        }
    }

    /// Set the API version.
    #[must_use]
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Enable or disable retries.
    #[must_use]
    pub fn with_retry_enabled(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    /// Replace the retry interval schedule.
    #[must_use]
    pub fn with_retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.retry_intervals = intervals;
        self
    }

    /// Check required options.
    pub fn validate(&self) -> AgentResult<()> {
        if self.api_version.is_none() {
            return Err(AgentError::InvalidArgument(
                ":api_version option missing".to_string(),
            ));
        }
        Ok(())
    }

    /// Server name for `server`, falling back to the type's default.
    pub fn server_name_for(&self, server: ServerType) -> String {
        self.server_name
            .clone()
            .unwrap_or_else(|| server.default_server_name().to_string())
    }

    /// Configuration of the underlying balanced HTTP client.
    pub fn http_config(&self, server: ServerType) -> HttpClientConfig {
        HttpClientConfig {
            server_name: Some(self.server_name_for(server)),
            api_version: self.api_version.clone(),
            open_timeout: self.open_timeout,
            request_timeout: self.request_timeout,
            health_check_timeout: self.health_check_timeout,
            health_check_path: self.health_check_path.clone(),
            filter_params: self.filter_params.clone(),
            balancing: self.balancing,
            proxy: self.proxy.clone(),
        }
    }
}

/// Listen-loop settings for [`crate::RouterClient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How long a long-poll may be held open by the router
    #[serde(with = "secs")]
    pub listen_timeout: Duration,

    /// Never try a WebSocket
    pub long_polling_only: bool,

    /// Initial wait between WebSocket connect attempts
    #[serde(with = "secs")]
    pub connect_interval: Duration,

    /// Cap on the connect backoff
    #[serde(with = "secs")]
    pub max_connect_interval: Duration,

    /// Initial wait between reconnect attempts after a failure
    #[serde(with = "secs")]
    pub reconnect_interval: Duration,

    /// Cap on the reconnect backoff
    #[serde(with = "secs")]
    pub max_reconnect_interval: Duration,

    /// Ticks in `check` before a connection counts as healthy
    pub check_count: u32,

    /// Consecutive unexpected listen failures before listening stops
    pub max_listen_failures: u32,

    /// WebSocket ping period
    #[serde(with = "secs")]
    pub ping_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_timeout: Duration::from_secs(60),
            long_polling_only: false,
            connect_interval: Duration::from_secs(30),
            max_connect_interval: Duration::from_secs(60 * 60 * 24),
            reconnect_interval: Duration::from_secs(2),
            max_reconnect_interval: Duration::from_secs(30),
            check_count: 5,
            max_listen_failures: 10,
            ping_interval: Duration::from_secs(60),
        }
    }
}

impl RouterConfig {
    /// Long-poll only, with a short poll hold.
    pub fn long_polling(listen_timeout: Duration) -> Self {
        Self {
            listen_timeout,
            long_polling_only: true,
            ..Self::default()
        }
    }
}

/// Transport the sender uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    /// Direct HTTP calls through a router client
    #[default]
    Http,
    /// Publishing to a message broker
    Broker,
}

/// Configuration for [`crate::Sender`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Transport
    pub mode: SendMode,

    /// Default time-to-live of requests; pushes only expire when given one
    #[serde(with = "secs::option")]
    pub time_to_live: Option<Duration>,

    /// How long broker requests are republished before giving up
    #[serde(with = "secs::option")]
    pub retry_timeout: Option<Duration>,

    /// Initial wait between broker republishes; doubles each time
    #[serde(with = "secs::option")]
    pub retry_interval: Option<Duration>,

    /// Queue requests locally while the router is unreachable
    pub offline_queueing: bool,

    /// Send HTTP requests on a spawned task
    pub async_response: bool,

    /// Broker queue requests are published to
    pub request_queue: String,

    /// Queue capacity while offline
    pub max_queued_requests: usize,

    /// Age after which push records stop waiting for acks
    #[serde(with = "secs")]
    pub max_push_age: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            mode: SendMode::Http,
            time_to_live: None,
            retry_timeout: None,
            retry_interval: None,
            offline_queueing: false,
            async_response: true,
            request_queue: "request".to_string(),
            max_queued_requests: 1000,
            max_push_age: Duration::from_secs(120),
        }
    }
}

impl SenderConfig {
    /// Broker mode with the given republish schedule.
    pub fn broker(retry_timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            mode: SendMode::Broker,
            retry_timeout: Some(retry_timeout),
            retry_interval: Some(retry_interval),
            ..Self::default()
        }
    }

    /// Enable offline queueing.
    #[must_use]
    pub fn with_offline_queueing(mut self, enabled: bool) -> Self {
        self.offline_queueing = enabled;
        self
    }

    /// Set the default time-to-live.
    #[must_use]
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// Configuration for [`crate::RetryableRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryableConfig {
    /// Initial wait before resending
    #[serde(with = "secs")]
    pub retry_delay: Duration,

    /// Resends at one delay before the delay doubles
    pub retry_delay_count: u32,

    /// Cap on the resend delay
    #[serde(with = "secs")]
    pub max_retry_delay: Duration,

    /// Overall timeout; `None` waits forever
    #[serde(with = "secs::option")]
    pub timeout: Option<Duration>,

    /// Resend on `error` results too
    pub retry_on_error: bool,

    /// Agents to target; one is picked at random per attempt
    pub targets: Vec<String>,
}

impl Default for RetryableConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            retry_delay_count: 60,
            max_retry_delay: Duration::from_secs(60),
            timeout: Some(Duration::from_secs(4 * 24 * 60 * 60)),
            retry_on_error: false,
            targets: Vec::new(),
        }
    }
}
