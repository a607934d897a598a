//! Load-balanced JSON HTTP client.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::header::{ACCEPT, LOCATION};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use agentwire_protocol::{AgentError, AgentResult, HttpError};

use crate::balancer::Balancer;
use crate::config::HttpClientConfig;
use crate::format::{Verb, filter_params, format_query, host_label, join_path, strip_credentials};

/// Header carrying the request UUID.
pub const REQUEST_UUID_HEADER: &str = "X-Request-Lineage-Uuid";
/// Header carrying the API version.
pub const API_VERSION_HEADER: &str = "X-API-Version";
/// Header carrying the absolute expiry in unix seconds.
pub const EXPIRES_AT_HEADER: &str = "X-Expires-At";

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// UUID sent in [`REQUEST_UUID_HEADER`]; generated when absent
    pub request_uuid: Option<String>,
    /// Extra headers
    pub headers: HashMap<String, String>,
    /// Overrides the configured request timeout
    pub request_timeout: Option<Duration>,
    /// Timeout for [`Verb::Poll`]; a poll that times out yields no result
    pub poll_timeout: Option<Duration>,
    /// Parameter names hidden in logs, on top of the configured ones
    pub filter_params: Vec<String>,
}

impl CallOptions {
    /// Use the given request UUID.
    #[must_use]
    pub fn with_request_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.request_uuid = Some(uuid.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Why an endpoint did not produce a response.
#[derive(Debug)]
enum Miss {
    Status(HttpError),
    Timeout(String),
    Transport(String),
}

impl Miss {
    fn code(&self) -> String {
        match self {
            Self::Status(e) => e.status.to_string(),
            Self::Timeout(_) | Self::Transport(_) => "nil".to_string(),
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Status(e) => e.to_string(),
            Self::Timeout(m) | Self::Transport(m) => m.clone(),
        }
    }
}

enum Attempt {
    Miss(Miss),
    Fatal(AgentError),
}

impl From<reqwest::Error> for Attempt {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Miss(Miss::Timeout(err.to_string()))
        } else {
            Self::Miss(Miss::Transport(err.to_string()))
        }
    }
}

/// HTTP client that spreads calls over a set of endpoints.
///
/// Parameters of GET, DELETE and POLL calls are sent in the query string;
/// POST and PUT send them as a JSON body. A 2xx response yields:
///
/// - the `Location` header for 201,
/// - `None` for 204, an empty body, or an empty decoded value,
/// - otherwise the decoded JSON body.
///
/// Any other status becomes [`AgentError::Http`], except 502/503/504 and
/// transport failures, which move on to the next endpoint. Once every
/// endpoint has missed, the call fails with [`AgentError::NotResponding`].
#[derive(Debug)]
pub struct BalancedHttpClient {
    config: HttpClientConfig,
    balancer: Balancer,
    server_name: String,
    http: reqwest::Client,
}

impl BalancedHttpClient {
    /// Create a client for `endpoints`.
    pub fn new(endpoints: Vec<Url>, config: HttpClientConfig) -> AgentResult<Self> {
        let first = endpoints
            .first()
            .ok_or_else(|| AgentError::InvalidArgument("No endpoints configured".to_string()))?;
        let server_name = config
            .server_name
            .clone()
            .unwrap_or_else(|| host_label(first));

        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.open_timeout)
            .timeout(config.request_timeout);
        builder = match &config.proxy {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| {
                AgentError::InvalidArgument(format!("Invalid proxy {proxy}: {e}"))
            })?),
            None => builder.no_proxy(),
        };
        let http = builder
            .build()
            .map_err(|e| AgentError::Internal(format!("Failed to create HTTP client: {e}")))?;

        let balancer = Balancer::new(endpoints, config.balancing);
        Ok(Self {
            config,
            balancer,
            server_name,
            http,
        })
    }

    /// Create a client from endpoint strings.
    pub fn from_urls<I, S>(endpoints: I, config: HttpClientConfig) -> AgentResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls = endpoints
            .into_iter()
            .map(|s| {
                Url::parse(s.as_ref()).map_err(|e| {
                    AgentError::InvalidArgument(format!("Invalid URL {}: {e}", s.as_ref()))
                })
            })
            .collect::<AgentResult<Vec<_>>>()?;
        Self::new(urls, config)
    }

    /// Name used in error messages.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Endpoint balancer.
    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    /// Configuration.
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// `GET path?params`.
    pub async fn get(
        &self,
        path: &str,
        params: &Value,
        options: &CallOptions,
    ) -> AgentResult<Option<Value>> {
        self.request(Verb::Get, path, params, options).await
    }

    /// `POST path` with a JSON body.
    pub async fn post(
        &self,
        path: &str,
        params: &Value,
        options: &CallOptions,
    ) -> AgentResult<Option<Value>> {
        self.request(Verb::Post, path, params, options).await
    }

    /// `PUT path` with a JSON body.
    pub async fn put(
        &self,
        path: &str,
        params: &Value,
        options: &CallOptions,
    ) -> AgentResult<Option<Value>> {
        self.request(Verb::Put, path, params, options).await
    }

    /// `DELETE path?params`.
    pub async fn delete(
        &self,
        path: &str,
        params: &Value,
        options: &CallOptions,
    ) -> AgentResult<Option<Value>> {
        self.request(Verb::Delete, path, params, options).await
    }

    /// Long-poll `GET path?params`; a timeout yields `Ok(None)`.
    pub async fn poll(
        &self,
        path: &str,
        params: &Value,
        options: &CallOptions,
    ) -> AgentResult<Option<Value>> {
        self.request(Verb::Poll, path, params, options).await
    }

    /// Issue a call, failing over between endpoints.
    pub async fn request(
        &self,
        verb: Verb,
        path: &str,
        params: &Value,
        options: &CallOptions,
    ) -> AgentResult<Option<Value>> {
        let uuid = options
            .request_uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let hidden: Vec<String> = self
            .config
            .filter_params
            .iter()
            .chain(&options.filter_params)
            .cloned()
            .collect();
        let shown = filter_params(params, &hidden);
        info!("Requesting {} <{}> {}", verb, uuid, path);
        debug!("Request parameters <{}> {}", uuid, shown);

        let mut last_miss = None;
        for index in self.balancer.order() {
            let Some(endpoint) = self.balancer.endpoint(index) else {
                continue;
            };
            if self.balancer.is_dead(index) {
                if !self.probe(endpoint).await {
                    continue;
                }
                self.balancer.mark_alive(index);
            }

            let started = Instant::now();
            let host = host_label(endpoint);
            match self.send(endpoint, verb, path, params, options, &uuid).await {
                Ok((status, len, result)) => {
                    info!(
                        "Completed <{}> in {}ms | {} [{}{}] | {} bytes",
                        uuid,
                        started.elapsed().as_millis(),
                        status,
                        host,
                        path,
                        len
                    );
                    return Ok(result);
                }
                Err(Attempt::Fatal(err)) => {
                    let code = err
                        .http_status()
                        .map_or_else(|| "nil".to_string(), |c| c.to_string());
                    warn!(
                        "Failed <{}> in {}ms | {} [{}{} {}] | {}",
                        uuid,
                        started.elapsed().as_millis(),
                        code,
                        host,
                        path,
                        shown,
                        err
                    );
                    return Err(err);
                }
                Err(Attempt::Miss(Miss::Timeout(_))) if verb == Verb::Poll => {
                    debug!("Poll <{}> timed out after {}ms", uuid, started.elapsed().as_millis());
                    return Ok(None);
                }
                Err(Attempt::Miss(miss)) => {
                    warn!(
                        "Failed <{}> in {}ms | {} [{}{} {}] | {}",
                        uuid,
                        started.elapsed().as_millis(),
                        miss.code(),
                        host,
                        path,
                        shown,
                        miss.message()
                    );
                    self.balancer.mark_dead(index);
                    last_miss = Some(miss);
                }
            }
        }
        Err(self.no_result(last_miss))
    }

    /// Health-check one endpoint, or every endpoint in order until one
    /// answers when `host` is `None`.
    ///
    /// Credentials are stripped from the probed URL. A 502/503/504 status
    /// or a transport failure fails with [`AgentError::NotResponding`].
    pub async fn check_health(&self, host: Option<&Url>) -> AgentResult<Option<Value>> {
        if let Some(host) = host {
            return self.health_of(host).await;
        }
        let mut last = AgentError::NotResponding(format!("{} not responding", self.server_name));
        for (index, endpoint) in self.balancer.endpoints().iter().enumerate() {
            match self.health_of(endpoint).await {
                Ok(result) => {
                    self.balancer.mark_alive(index);
                    return Ok(result);
                }
                Err(err) => {
                    if matches!(err, AgentError::NotResponding(_)) {
                        self.balancer.mark_dead(index);
                    }
                    last = err;
                }
            }
        }
        Err(last)
    }

    async fn probe(&self, endpoint: &Url) -> bool {
        !matches!(
            self.health_of(endpoint).await,
            Err(AgentError::NotResponding(_))
        )
    }

    async fn health_of(&self, endpoint: &Url) -> AgentResult<Option<Value>> {
        let url = join_path(&strip_credentials(endpoint), &self.config.health_check_path);
        let mut request = self
            .http
            .get(&url)
            .timeout(self.config.health_check_timeout)
            .header(ACCEPT, "application/json");
        if let Some(version) = &self.config.api_version {
            request = request.header(API_VERSION_HEADER, version);
        }

        let not_responding =
            || AgentError::NotResponding(format!("{} not responding", self.server_name));
        let response = request.send().await.map_err(|e| {
            debug!("Health check of {} failed: {}", url, e);
            not_responding()
        })?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|_| not_responding())?;
        match status {
            200..=207 => decode_body(status, None, &body),
            _ => {
                let err = HttpError::new(status, body);
                if err.is_retryable_status() {
                    Err(self.no_result(Some(Miss::Status(err))))
                } else {
                    Err(AgentError::Http(err))
                }
            }
        }
    }

    async fn send(
        &self,
        endpoint: &Url,
        verb: Verb,
        path: &str,
        params: &Value,
        options: &CallOptions,
        uuid: &str,
    ) -> Result<(u16, usize, Option<Value>), Attempt> {
        let mut url = join_path(endpoint, path);
        if verb.uses_query() {
            let query = format_query(params);
            if !query.is_empty() {
                url.push('?');
                url.push_str(&query);
            }
        }

        let timeout = match verb {
            Verb::Poll => options.poll_timeout.or(options.request_timeout),
            _ => options.request_timeout,
        }
        .unwrap_or(self.config.request_timeout);

        let mut request = self
            .http
            .request(verb.method(), &url)
            .timeout(timeout)
            .header(REQUEST_UUID_HEADER, uuid)
            .header(ACCEPT, "application/json");
        if let Some(version) = &self.config.api_version {
            request = request.header(API_VERSION_HEADER, version);
        }
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !verb.uses_query() {
            request = request.json(params);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        match status {
            200..=207 => decode_body(status, location, &body)
                .map(|result| (status, body.len(), result))
                .map_err(Attempt::Fatal),
            _ => {
                let mut err = HttpError::new(status, body);
                if let Some(location) = location {
                    err = err.with_location(location);
                }
                if err.is_retryable_status() {
                    Err(Attempt::Miss(Miss::Status(err)))
                } else {
                    Err(Attempt::Fatal(AgentError::Http(err)))
                }
            }
        }
    }

    fn no_result(&self, miss: Option<Miss>) -> AgentError {
        match miss {
            Some(Miss::Status(e)) if e.status == 504 && !e.body.is_empty() => {
                AgentError::NotResponding(e.body)
            }
            Some(Miss::Timeout(_)) => AgentError::NotResponding("Request timeout".to_string()),
            _ => AgentError::NotResponding(format!("{} not responding", self.server_name)),
        }
    }
}

fn decode_body(status: u16, location: Option<String>, body: &str) -> AgentResult<Option<Value>> {
    if status == 201
        && let Some(location) = location
    {
        return Ok(Some(Value::String(location)));
    }
    if status == 204 || body.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(body)?;
    let empty = match &value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    };
    Ok(if empty { None } else { Some(value) })
}
