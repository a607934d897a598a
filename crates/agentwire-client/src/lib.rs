//! # agentwire client
//!
//! Agent-side half of agentwire: everything needed to reach a router or
//! broker and keep talking to it through outages.
//!
//! - [`RetryClient`]: connection state machine with health checks,
//!   reconnects and the HTTP error policy on top of a balanced HTTP client
//! - [`RouterClient`]: pushes, requests and notifications through a router,
//!   plus the listen loop that receives events over a WebSocket and falls
//!   back to long-polling
//! - [`Sender`]: envelopes, pending requests, offline queueing and the HTTP
//!   and broker transports
//! - [`RetryableRequest`]: a request resent with backoff until it succeeds
//! - [`AgentContext`]: the above wired together once per process
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentwire_client::{
//!     AgentContext, RetryClientConfig, RouterConfig, SendOptions, SenderConfig, ServerType,
//!     StaticAuth,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> agentwire_protocol::AgentResult<()> {
//! let auth = StaticAuth::new("rs-agent-1-1")
//!     .with_url(ServerType::Router, "http://router:8080".parse().unwrap());
//! let context = AgentContext::http(
//!     Arc::new(auth),
//!     RetryClientConfig::default().with_api_version("2.0"),
//!     RouterConfig::default(),
//!     SenderConfig::default(),
//! )?;
//! let reply = context
//!     .sender()
//!     .request("/foo/bar", json!({"k": "v"}), None, SendOptions::default())
//!     .await?;
//! println!("{}", reply.results);
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

mod auth;
mod config;
mod context;
mod retry_client;
mod retryable;
mod router;
mod sender;

pub use auth::{AuthProvider, ServerType, StaticAuth};
pub use config::{RetryClientConfig, RetryableConfig, RouterConfig, SendMode, SenderConfig};
pub use context::AgentContext;
pub use retry_client::{
    CloseScope, CommunicatedCallback, ConnectionState, EnableUseHook, RequestOptions, RetryClient,
    StatusCallback,
};
pub use retryable::{RetryableOutcome, RetryableRequest};
pub use router::{
    ABNORMAL_CLOSE, EventHandler, ListenMachine, ListenState, NORMAL_CLOSE, PROTOCOL_ERROR_CLOSE,
    RouterClient, SHUTDOWN_CLOSE,
};
pub use sender::{
    Broker, BrokerError, OfflineMode, OfflineQueue, OfflineState, PendingRequest, PendingRequests,
    PublishOptions, QueuedRequest, RequestClient, ResponseHandler, SendError, SendOptions, Sender,
    SenderStats, Transport,
};
