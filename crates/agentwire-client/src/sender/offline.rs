//! Queue holding outbound requests while the agent is offline.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use agentwire_protocol::{PacketKind, Target};

use super::pending::ResponseHandler;

/// Lifecycle of the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineState {
    /// Not initialized; nothing is queued
    Created,
    /// Agent starting up; everything is queued until started
    Initializing,
    /// Normal operation
    Running,
    /// Replaying queued requests
    Flushing,
    /// Shut down; queued requests were dropped
    Terminating,
}

/// Connectivity as last reported to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineMode {
    /// Not yet known
    Initializing,
    /// Connected
    Online,
    /// Disconnected; requests are queued
    Offline,
}

/// A send captured while offline, replayed with its original token and expiry.
pub struct QueuedRequest {
    /// Push or request
    pub kind: PacketKind,
    /// Type path
    pub type_: String,
    /// Payload
    pub payload: Value,
    /// Target
    pub target: Option<Target>,
    /// Token assigned when first sent
    pub token: String,
    /// Expiry in unix seconds, 0 for none
    pub expires_at: i64,
    /// Response callback
    pub callback: Option<ResponseHandler>,
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("kind", &self.kind)
            .field("type_", &self.type_)
            .field("token", &self.token)
            .field("expires_at", &self.expires_at)
            .field("callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

/// Bounded FIFO of [`QueuedRequest`]s plus the offline state machine.
///
/// The queue itself sends nothing; [`super::Sender`] drains it and
/// replays the requests when going back online.
#[derive(Debug)]
pub struct OfflineQueue {
    state: OfflineState,
    mode: OfflineMode,
    queue: VecDeque<QueuedRequest>,
    max_queued: usize,
}

impl OfflineQueue {
    /// Empty queue holding at most `max_queued` requests.
    pub fn new(max_queued: usize) -> Self {
        Self {
            state: OfflineState::Created,
            mode: OfflineMode::Initializing,
            queue: VecDeque::new(),
            max_queued,
        }
    }

    /// Lifecycle state.
    pub fn state(&self) -> OfflineState {
        self.state
    }

    /// Connectivity mode.
    pub fn mode(&self) -> OfflineMode {
        self.mode
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Start queueing everything until [`OfflineQueue::start`].
    pub fn init(&mut self) {
        if self.state == OfflineState::Created {
            self.state = OfflineState::Initializing;
        }
    }

    /// Finish initialization.
    ///
    /// Returns the requests to replay unless the agent is offline, in which
    /// case they stay queued.
    pub fn start(&mut self) -> Vec<QueuedRequest> {
        if self.state != OfflineState::Initializing {
            return Vec::new();
        }
        if self.mode == OfflineMode::Offline {
            self.state = OfflineState::Running;
            return Vec::new();
        }
        self.mode = OfflineMode::Online;
        self.drain()
    }

    /// Go offline and queue from now on.
    pub fn enable(&mut self) {
        if self.mode == OfflineMode::Offline || self.state == OfflineState::Terminating {
            return;
        }
        if self.state == OfflineState::Flushing {
            self.state = OfflineState::Running;
        }
        info!("Connection to router lost, queueing requests");
        self.mode = OfflineMode::Offline;
    }

    /// Go back online and return the requests to replay.
    pub fn disable(&mut self) -> Vec<QueuedRequest> {
        if self.mode != OfflineMode::Offline || self.state == OfflineState::Terminating {
            return Vec::new();
        }
        self.mode = OfflineMode::Online;
        if self.state == OfflineState::Initializing {
            return Vec::new();
        }
        info!(
            "Connection to router restored, replaying {} queued requests",
            self.queue.len()
        );
        self.drain()
    }

    /// The replay returned by [`OfflineQueue::start`] or
    /// [`OfflineQueue::disable`] finished.
    pub fn flushed(&mut self) {
        if self.state == OfflineState::Flushing {
            self.state = OfflineState::Running;
        }
    }

    /// Whether new sends should be queued instead of sent.
    pub fn is_queueing(&self) -> bool {
        self.state == OfflineState::Initializing
            || (self.mode == OfflineMode::Offline && self.state != OfflineState::Terminating)
    }

    /// Queue a request.
    ///
    /// A full queue refuses the request and hands it back.
    pub fn queue_request(&mut self, request: QueuedRequest) -> Result<(), QueuedRequest> {
        if self.queue.len() >= self.max_queued {
            error!(
                "Offline request queue full ({}), dropping {} <{}>",
                self.max_queued, request.type_, request.token
            );
            return Err(request);
        }
        self.queue.push_back(request);
        Ok(())
    }

    /// Stop queueing and drop what is queued, returning how many were dropped.
    pub fn terminate(&mut self) -> usize {
        self.state = OfflineState::Terminating;
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    fn drain(&mut self) -> Vec<QueuedRequest> {
        self.state = if self.queue.is_empty() {
            OfflineState::Running
        } else {
            OfflineState::Flushing
        };
        self.queue.drain(..).collect()
    }
}
