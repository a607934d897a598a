//! # agentwire server
//!
//! Receiving half of agentwire plus the process plumbing every agent needs.
//!
//! - [`Dispatcher`]: routes envelopes to actor actions, rejects expired
//!   envelopes and suppresses duplicate non-idempotent requests
//! - [`ActorRegistry`], [`Actor`], [`FunctionHandler`]: what the
//!   dispatcher routes into
//! - [`DispatchedCache`]: bounded memory of dispatched tokens
//! - [`AgentConfig`]: file and environment configuration
//! - [`LoggingConfig`]: tracing subscriber setup
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentwire_protocol::{Envelope, SystemClock};
//! use agentwire_server::{
//!     Actor, ActorRegistry, DedupConfig, DispatchedCache, Dispatcher, FunctionHandler,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> agentwire_protocol::AgentResult<()> {
//! let registry = Arc::new(ActorRegistry::new());
//! registry.register(
//!     Actor::new("echo").idempotent(FunctionHandler::new("say", |p| async move { Ok(p) })),
//!     None,
//! );
//! let dispatcher = Dispatcher::new(
//!     "rs-agent-1-1",
//!     registry,
//!     Some(DispatchedCache::new("rs-agent-1-1", &DedupConfig::default())),
//!     Arc::new(SystemClock),
//! );
//! let reply = dispatcher
//!     .dispatch(Envelope::request("/echo/say", json!("hi"), "rs-agent-2-2"))
//!     .await?;
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

mod cache;
mod config;
mod dispatcher;
mod logging;
mod registry;

pub use cache::DispatchedCache;
pub use config::{
    AgentConfig, ConfigError, DedupConfig, ENV_PREFIX, LogOutput, LogRotation, LoggingConfig,
};
pub use dispatcher::Dispatcher;
pub use logging::LoggingGuard;
pub use registry::{Action, ActionHandler, Actor, ActorRegistry, FunctionHandler};
