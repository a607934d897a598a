//! Requests awaiting a response.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use dashmap::DashMap;
use parking_lot::Mutex;

use agentwire_protocol::{PacketKind, Reply, SharedClock};

/// Callback receiving the response to a push or request.
pub type ResponseHandler = Arc<dyn Fn(Reply) + Send + Sync>;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const MAX_DUMPED: usize = 50;

/// A push or request waiting for its response.
///
/// Retries of a request share the record of the original under their new
/// tokens, with [`PendingRequest::retry_parent_token`] naming the original.
pub struct PendingRequest {
    kind: PacketKind,
    received_at: f64,
    handler: ResponseHandler,
    non_delivery: Mutex<Option<String>>,
    retry_parent_token: Mutex<Option<String>>,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("kind", &self.kind)
            .field("received_at", &self.received_at)
            .field("non_delivery", &*self.non_delivery.lock())
            .field("retry_parent_token", &*self.retry_parent_token.lock())
            .finish_non_exhaustive()
    }
}

impl PendingRequest {
    /// Record for a send made at `received_at` (fractional unix seconds).
    pub fn new(kind: PacketKind, received_at: f64, handler: ResponseHandler) -> Self {
        Self {
            kind,
            received_at,
            handler,
            non_delivery: Mutex::new(None),
            retry_parent_token: Mutex::new(None),
        }
    }

    /// Push or request.
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// When the send was made.
    pub fn received_at(&self) -> f64 {
        self.received_at
    }

    /// Earlier non-delivery reason kept while retrying.
    pub fn non_delivery(&self) -> Option<String> {
        self.non_delivery.lock().clone()
    }

    /// Remember a non-delivery reason.
    pub fn set_non_delivery(&self, reason: impl Into<String>) {
        *self.non_delivery.lock() = Some(reason.into());
    }

    /// Token of the original request when this record is shared by retries.
    pub fn retry_parent_token(&self) -> Option<String> {
        self.retry_parent_token.lock().clone()
    }

    /// Mark the record as shared by retries of `token`.
    pub fn set_retry_parent_token(&self, token: impl Into<String>) {
        *self.retry_parent_token.lock() = Some(token.into());
    }

    pub(crate) fn respond(&self, reply: Reply) {
        (self.handler)(reply);
    }
}

/// Table of [`PendingRequest`]s by token.
///
/// Push records stay after a response since a push may be confirmed more
/// than once. Inserting purges push records older than the maximum push
/// age, at most once a minute.
pub struct PendingRequests {
    requests: DashMap<String, Arc<PendingRequest>>,
    clock: SharedClock,
    max_push_age: Duration,
    last_cleanup: Mutex<f64>,
}

impl fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequests")
            .field("len", &self.requests.len())
            .field("max_push_age", &self.max_push_age)
            .finish()
    }
}

impl PendingRequests {
    /// Empty table.
    pub fn new(clock: SharedClock, max_push_age: Duration) -> Self {
        let now = clock.unix_f64();
        Self {
            requests: DashMap::new(),
            clock,
            max_push_age,
            last_cleanup: Mutex::new(now),
        }
    }

    /// Record under `token`.
    pub fn get(&self, token: &str) -> Option<Arc<PendingRequest>> {
        self.requests.get(token).map(|r| Arc::clone(r.value()))
    }

    /// Whether `token` is pending.
    pub fn contains(&self, token: &str) -> bool {
        self.requests.contains_key(token)
    }

    /// Store a record, purging stale push records first when due.
    pub fn insert(&self, token: impl Into<String>, request: Arc<PendingRequest>) {
        let now = self.clock.unix_f64();
        let due = {
            let mut last = self.last_cleanup.lock();
            if now - *last > CLEANUP_INTERVAL.as_secs_f64() {
                *last = now;
                true
            } else {
                false
            }
        };
        if due {
            let max_age = self.max_push_age.as_secs_f64();
            self.requests
                .retain(|_, r| !(r.kind == PacketKind::Push && now - r.received_at > max_age));
        }
        self.requests.insert(token.into(), request);
    }

    /// Remove one record.
    pub fn remove(&self, token: &str) -> Option<Arc<PendingRequest>> {
        self.requests.remove(token).map(|(_, r)| r)
    }

    /// Remove `parent_token` and every retry that shares its record.
    pub fn remove_retry_chain(&self, parent_token: &str) {
        self.requests.retain(|token, r| {
            token != parent_token && r.retry_parent_token().as_deref() != Some(parent_token)
        });
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no records remain.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Tokens and records of one kind.
    pub fn of_kind(&self, kind: PacketKind) -> Vec<(String, Arc<PendingRequest>)> {
        self.requests
            .iter()
            .filter(|e| e.value().kind == kind)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// Seconds since the most recent record of `kind` was created.
    pub fn youngest_age(&self, kind: PacketKind) -> Option<f64> {
        let now = self.clock.unix_f64();
        self.requests
            .iter()
            .filter(|e| e.value().kind == kind)
            .map(|e| e.value().received_at)
            .reduce(f64::max)
            .map(|youngest| now - youngest)
    }

    /// Unfinished requests as `"<local time> <token>"`, newest first.
    ///
    /// At most 50 entries are listed, followed by `"..."` if more remain.
    pub fn dump(&self) -> Vec<String> {
        let mut requests = self.of_kind(PacketKind::Request);
        requests.sort_by(|a, b| b.1.received_at.total_cmp(&a.1.received_at));
        let truncated = requests.len() > MAX_DUMPED;
        let mut info: Vec<String> = requests
            .into_iter()
            .take(MAX_DUMPED)
            .map(|(token, r)| format!("{} <{}>", local_time(r.received_at), token))
            .collect();
        if truncated {
            info.push("...".to_string());
        }
        info
    }
}

fn local_time(unix: f64) -> String {
    let secs = unix.floor();
    let nanos = ((unix - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos).map_or_else(
        || unix.to_string(),
        |t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %z").to_string(),
    )
}
