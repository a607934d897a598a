//! Balanced HTTP client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variables consulted for a proxy, in order of precedence.
pub const PROXY_ENVIRONMENT_VARIABLES: [&str; 5] = [
    "HTTPS_PROXY",
    "https_proxy",
    "HTTP_PROXY",
    "http_proxy",
    "ALL_PROXY",
];

/// Default path probed by health checks.
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/health-check";

/// How the balancer picks among live endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Balancing {
    /// Rotate through endpoints in order.
    #[default]
    RoundRobin,
    /// Start from a random endpoint on each call.
    Random,
}

/// Configuration for [`crate::BalancedHttpClient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Name of the server used in error messages; defaults to the host
    pub server_name: Option<String>,

    /// Value sent in the `X-API-Version` header
    pub api_version: Option<String>,

    /// Connection establishment timeout
    #[serde(with = "agentwire_protocol::secs")]
    pub open_timeout: Duration,

    /// Overall request timeout
    #[serde(with = "agentwire_protocol::secs")]
    pub request_timeout: Duration,

    /// Timeout applied to health checks
    #[serde(with = "agentwire_protocol::secs")]
    pub health_check_timeout: Duration,

    /// Path probed by health checks
    pub health_check_path: String,

    /// Parameter names whose values are hidden in logs
    pub filter_params: Vec<String>,

    /// Endpoint selection policy
    pub balancing: Balancing,

    /// Proxy URL; detected from the environment when absent
    pub proxy: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            api_version: None,
            open_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            health_check_path: DEFAULT_HEALTH_CHECK_PATH.to_string(),
            filter_params: Vec::new(),
            balancing: Balancing::RoundRobin,
            proxy: detect_proxy(),
        }
    }
}

impl HttpClientConfig {
    /// Short timeouts suited to tests against local servers.
    pub fn fast() -> Self {
        Self {
            open_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            health_check_timeout: Duration::from_secs(1),
            proxy: None,
            ..Self::default()
        }
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the API version header value.
    #[must_use]
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    /// Hide the given parameters in logs.
    #[must_use]
    pub fn with_filter_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_params = params.into_iter().map(Into::into).collect();
        self
    }
}

/// First proxy found in [`PROXY_ENVIRONMENT_VARIABLES`].
///
/// A value without a scheme is taken to be an `http://` proxy.
pub fn detect_proxy() -> Option<String> {
    PROXY_ENVIRONMENT_VARIABLES
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
        .map(|value| {
            if value.contains("://") {
                value
            } else {
                format!("http://{value}")
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_proxy_env() {
        for name in PROXY_ENVIRONMENT_VARIABLES {
            // SAFETY: tests touching the environment are serialized
            #[allow(unsafe_code)]
            unsafe {
                std::env::remove_var(name)
            };
        }
    }

    #[test]
    fn test_defaults() {
        let config = HttpClientConfig::default();
        assert_eq!(config.open_timeout, Duration::from_secs(2));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.health_check_timeout, Duration::from_secs(5));
        assert_eq!(config.health_check_path, "/health-check");
        assert_eq!(config.balancing, Balancing::RoundRobin);
    }

    #[test]
    #[serial]
    fn test_proxy_detection_order() {
        clear_proxy_env();
        assert_eq!(detect_proxy(), None);
        #[allow(unsafe_code)]
        unsafe {
            std::env::set_var("ALL_PROXY", "all.example.com:3128");
            std::env::set_var("http_proxy", "http://lower.example.com:3128");
        }
        assert_eq!(
            detect_proxy().as_deref(),
            Some("http://lower.example.com:3128")
        );
        #[allow(unsafe_code)]
        unsafe {
            std::env::remove_var("http_proxy")
        };
        assert_eq!(detect_proxy().as_deref(), Some("http://all.example.com:3128"));
        clear_proxy_env();
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let parsed: HttpClientConfig =
            serde_json::from_value(serde_json::json!({"open_timeout": 1.5})).unwrap();
        assert_eq!(parsed.open_timeout, Duration::from_millis(1500));
        assert_eq!(parsed.request_timeout, Duration::from_secs(30));
    }
}
