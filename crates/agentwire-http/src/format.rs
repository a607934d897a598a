//! Query string formatting and parameter filtering.

use std::fmt;

use serde_json::{Map, Value};
use url::Url;

/// Placeholder substituted for filtered parameter values.
pub const FILTERED_PARAM_VALUE: &str = "<hidden>";

/// HTTP verb understood by [`crate::BalancedHttpClient`].
///
/// `Poll` is a `GET` whose timeout is the caller's poll timeout and whose
/// timeout is reported as "no result" instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// Long-poll GET
    Poll,
}

impl Verb {
    /// Whether parameters travel in the query string rather than the body.
    pub fn uses_query(self) -> bool {
        matches!(self, Self::Get | Self::Delete | Self::Poll)
    }

    /// Method put on the wire.
    pub fn method(self) -> http::Method {
        match self {
            Self::Get | Self::Poll => http::Method::GET,
            Self::Post => http::Method::POST,
            Self::Put => http::Method::PUT,
            Self::Delete => http::Method::DELETE,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
            Self::Poll => write!(f, "POLL"),
        }
    }
}

fn escape(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => escape(s),
        other => escape(&other.to_string()),
    }
}

fn push_pairs(key: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => {
            let key = format!("{key}[]");
            for item in items {
                push_pairs(&key, item, out);
            }
        }
        Value::Object(map) => {
            for (sub, v) in map {
                push_pairs(&format!("{key}[{}]", escape(sub)), v, out);
            }
        }
        other => out.push(format!("{key}={}", scalar(other))),
    }
}

/// Format parameters as a query string such as `a=1&tags[]=x&tags[]=y`.
///
/// Keys and values are form-escaped; the `[]` and `[k]` suffixes that mark
/// arrays and nested objects are kept literal.
pub fn format_query(params: &Value) -> String {
    let mut out = Vec::new();
    if let Value::Object(map) = params {
        for (key, value) in map {
            push_pairs(&escape(key), value, &mut out);
        }
    }
    out.join("&")
}

/// Copy of `params` with filtered keys replaced by [`FILTERED_PARAM_VALUE`].
///
/// Matching is by top-level key name.
pub fn filter_params(params: &Value, filter: &[String]) -> Value {
    match params {
        Value::Object(map) if !filter.is_empty() => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if filter.iter().any(|f| f == k) {
                        (k.clone(), Value::String(FILTERED_PARAM_VALUE.to_string()))
                    } else {
                        (k.clone(), v.clone())
                    }
                })
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

/// Copy of `url` without user or password.
pub fn strip_credentials(url: &Url) -> Url {
    let mut url = url.clone();
    // Only fails for cannot-be-a-base URLs, which carry no credentials
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url
}

/// Join an endpoint and a path, tolerating slashes on either side.
pub fn join_path(endpoint: &Url, path: &str) -> String {
    let base = endpoint.as_str().trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// `host[:port]` of an endpoint, for log lines and default server names.
pub fn host_label(endpoint: &Url) -> String {
    match (endpoint.host_str(), endpoint.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => endpoint.to_string(),
    }
}
