//! # agentwire protocol
//!
//! Shared vocabulary for agentwire clients and dispatchers.
//!
//! This crate defines:
//! - **Envelopes**: [`Envelope`], [`Reply`], [`Event`]
//! - **Results**: [`OperationResult`] and the non-delivery reason constants
//! - **Targets**: [`Target`], [`Selector`], [`Scope`]
//! - **Errors**: [`AgentError`], [`HttpError`], [`AgentResult`]
//! - **Time**: [`Clock`], [`SystemClock`], [`ManualClock`]
//! - **Statistics**: [`ClientStats`], [`AtomicStats`], [`ActivityCounts`]

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

mod clock;
mod error;
mod packet;
mod result;
pub mod secs;
mod stats;
mod target;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{AgentError, AgentResult, HttpError, RETRY_STATUS_CODES};
pub use packet::{
    DEFAULT_ACTION, Envelope, Event, NON_DELIVERY_MIN_VERSION, PROTOCOL_VERSION, PacketKind, Reply,
};
pub use result::{
    NO_ROUTE_TO_TARGET, NO_TARGET, OperationResult, RETRY_TIMEOUT, TARGET_NOT_CONNECTED,
    TTL_EXPIRATION, UNKNOWN_TARGET,
};
pub use stats::{ActivityCounts, AtomicStats, ClientStats};
pub use target::{Scope, Selector, Target};
