//! # agentwire HTTP
//!
//! Load-balanced JSON HTTP client used by agentwire retry clients.
//!
//! [`BalancedHttpClient`] spreads calls over a fixed endpoint set, skipping
//! endpoints that recently missed until a health check revives them, and
//! turns HTTP responses into `Option<serde_json::Value>` or a typed
//! [`agentwire_protocol::AgentError`].
//!
//! ```rust,no_run
//! use agentwire_http::{BalancedHttpClient, CallOptions, HttpClientConfig};
//! use serde_json::json;
//!
//! # async fn example() -> agentwire_protocol::AgentResult<()> {
//! let client = BalancedHttpClient::from_urls(
//!     ["http://router-1:8080", "http://router-2:8080"],
//!     HttpClientConfig::default().with_api_version("2.0"),
//! )?;
//! let result = client.get("/agents", &json!({"tags": ["a:b=c"]}), &CallOptions::default()).await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

mod balancer;
mod client;
mod config;
mod format;

pub use balancer::Balancer;
pub use client::{
    API_VERSION_HEADER, BalancedHttpClient, CallOptions, EXPIRES_AT_HEADER, REQUEST_UUID_HEADER,
};
pub use config::{
    Balancing, DEFAULT_HEALTH_CHECK_PATH, HttpClientConfig, PROXY_ENVIRONMENT_VARIABLES,
    detect_proxy,
};
pub use format::{
    FILTERED_PARAM_VALUE, Verb, filter_params, format_query, host_label, join_path,
    strip_credentials,
};
