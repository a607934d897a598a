//! Authorization collaborator consulted by retry clients.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Kind of server a retry client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// Event router: pushes, requests, notifications and listening
    Router,
    /// Platform API
    Api,
}

impl ServerType {
    /// Name used in error messages when none is configured.
    pub fn default_server_name(self) -> &'static str {
        match self {
            Self::Router => "Router",
            Self::Api => "API",
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Router => f.write_str("router"),
            Self::Api => f.write_str("api"),
        }
    }
}

/// Source of server URLs and request credentials.
///
/// Retry clients notify the provider when the server redirects them or
/// reports that the session expired, and leave the recovery to it.
pub trait AuthProvider: Send + Sync + Debug {
    /// Identity of the agent this provider authorizes.
    fn identity(&self) -> String;

    /// Base URL for a server type, or `None` if the type is not supported.
    fn url_for(&self, server: ServerType) -> Option<Url>;

    /// All endpoints for a server type; defaults to [`AuthProvider::url_for`].
    fn endpoints_for(&self, server: ServerType) -> Option<Vec<Url>> {
        self.url_for(server).map(|url| vec![url])
    }

    /// Headers to attach to every request.
    fn headers(&self) -> HashMap<String, String>;

    /// The server reported that the authorization expired.
    fn expired(&self);

    /// The server redirected the client to `location`.
    fn redirect(&self, location: &str);
}

/// Provider with fixed URLs and headers.
///
/// Records expirations and redirects so callers can react to them.
#[derive(Debug, Default)]
pub struct StaticAuth {
    identity: String,
    endpoints: HashMap<ServerType, Vec<Url>>,
    headers: HashMap<String, String>,
    expirations: AtomicU64,
    redirects: Mutex<Vec<String>>,
}

impl StaticAuth {
    /// Provider for the given agent identity.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    /// Serve `server` from `endpoints`.
    #[must_use]
    pub fn with_endpoints(mut self, server: ServerType, endpoints: Vec<Url>) -> Self {
        self.endpoints.insert(server, endpoints);
        self
    }

    /// Serve `server` from a single URL.
    #[must_use]
    pub fn with_url(self, server: ServerType, url: Url) -> Self {
        self.with_endpoints(server, vec![url])
    }

    /// Attach a header to every request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// How many times the server reported an expired authorization.
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Redirect locations received so far.
    pub fn redirects(&self) -> Vec<String> {
        self.redirects.lock().clone()
    }
}

impl AuthProvider for StaticAuth {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn url_for(&self, server: ServerType) -> Option<Url> {
        self.endpoints.get(&server).and_then(|e| e.first().cloned())
    }

    fn endpoints_for(&self, server: ServerType) -> Option<Vec<Url>> {
        self.endpoints.get(&server).filter(|e| !e.is_empty()).cloned()
    }

    fn headers(&self) -> HashMap<String, String> {
        self.headers.clone()
    }

    fn expired(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    fn redirect(&self, location: &str) {
        self.redirects.lock().push(location.to_string());
    }
}
