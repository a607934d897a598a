//! Outbound pushes and requests.
//!
//! A [`Sender`] turns application sends into envelopes and hands them to
//! a transport:
//!
//! - **HTTP**: through a [`RequestClient`] (usually a router client), with
//!   the router's response or failure turned into a local [`Reply`]
//! - **Broker**: published to a request queue, with requests republished
//!   under fresh tokens until answered or until the retry timeout passes
//!
//! Responses for both transports flow through [`Sender::handle_response`],
//! which matches them to [`PendingRequest`]s by token.

mod broker;
mod offline;
mod pending;

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use agentwire_protocol::{
    ActivityCounts, AgentError, AgentResult, Envelope, OperationResult, PacketKind, RETRY_TIMEOUT,
    Reply, Selector, SharedClock, SystemClock, TARGET_NOT_CONNECTED, Target,
};

use crate::config::{SendMode, SenderConfig};
use crate::retry_client::RequestOptions;

pub use broker::{Broker, BrokerError, PublishOptions, SendError};
pub use offline::{OfflineMode, OfflineQueue, OfflineState, QueuedRequest};
pub use pending::{PendingRequest, PendingRequests, ResponseHandler};

/// Client able to route pushes and requests over HTTP.
#[async_trait]
pub trait RequestClient: Send + Sync + Debug {
    /// Route a push and return the response content.
    async fn push(
        &self,
        type_: &str,
        payload: &Value,
        target: Option<&Target>,
        options: RequestOptions,
    ) -> AgentResult<Option<Value>>;

    /// Route a request and return the response content.
    async fn request(
        &self,
        type_: &str,
        payload: &Value,
        target: Option<&Target>,
        options: RequestOptions,
    ) -> AgentResult<Option<Value>>;

    /// Identity of the agent the client sends for.
    fn identity(&self) -> String;
}

/// Where a [`Sender`] sends envelopes.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Route through a router over HTTP
    Http(Arc<dyn RequestClient>),
    /// Publish to a message broker
    Broker(Arc<dyn Broker>),
}

impl Transport {
    fn mode(&self) -> SendMode {
        match self {
            Self::Http(_) => SendMode::Http,
            Self::Broker(_) => SendMode::Broker,
        }
    }
}

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Token to use instead of a fresh one
    pub token: Option<String>,
    /// Time-to-live; requests fall back to the configured default
    pub time_to_live: Option<Duration>,
    /// Absolute expiry in unix seconds, overriding `time_to_live`
    pub expires_at: Option<i64>,
}

impl SendOptions {
    /// Use the given token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the time-to-live.
    #[must_use]
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// Snapshot of sender activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderStats {
    /// Non-delivery results by reason
    pub non_deliveries: BTreeMap<String, u64>,
    /// Results by status
    pub results: BTreeMap<String, u64>,
    /// Error results by message
    pub result_errors: BTreeMap<String, u64>,
    /// Records awaiting a response
    pub pending: usize,
    /// Requests held in the offline queue
    pub queued: usize,
}

struct SenderInner {
    identity: String,
    config: SenderConfig,
    transport: Transport,
    clock: SharedClock,
    pending: PendingRequests,
    offline: Mutex<OfflineQueue>,
    non_deliveries: ActivityCounts,
    results: ActivityCounts,
    result_errors: ActivityCounts,
}

/// Sends pushes and requests and matches responses to their callbacks.
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

/// Non-owning handle to a [`Sender`], for callbacks owned by its transport.
#[derive(Clone)]
pub(crate) struct WeakSender(Weak<SenderInner>);

impl WeakSender {
    pub(crate) fn upgrade(&self) -> Option<Sender> {
        self.0.upgrade().map(|inner| Sender { inner })
    }
}

impl Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("identity", &self.inner.identity)
            .field("mode", &self.inner.config.mode)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl Sender {
    /// Create a sender for `identity`.
    ///
    /// The transport must match the configured mode.
    pub fn new(
        identity: impl Into<String>,
        transport: Transport,
        config: SenderConfig,
    ) -> AgentResult<Self> {
        Self::with_clock(identity, transport, config, Arc::new(SystemClock))
    }

    /// Create a sender reading time from `clock`.
    pub fn with_clock(
        identity: impl Into<String>,
        transport: Transport,
        config: SenderConfig,
        clock: SharedClock,
    ) -> AgentResult<Self> {
        if transport.mode() != config.mode {
            return Err(AgentError::InvalidArgument(format!(
                "Sender in {:?} mode cannot use a {:?} transport",
                config.mode,
                transport.mode()
            )));
        }
        let pending = PendingRequests::new(clock.clone(), config.max_push_age);
        let offline = Mutex::new(OfflineQueue::new(config.max_queued_requests));
        Ok(Self {
            inner: Arc::new(SenderInner {
                identity: identity.into(),
                config,
                transport,
                clock,
                pending,
                offline,
                non_deliveries: ActivityCounts::new(),
                results: ActivityCounts::new(),
                result_errors: ActivityCounts::new(),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakSender {
        WeakSender(Arc::downgrade(&self.inner))
    }

    /// Identity stamped on outgoing envelopes.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Configuration.
    pub fn config(&self) -> &SenderConfig {
        &self.inner.config
    }

    /// Time source.
    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Records awaiting a response.
    pub fn pending_requests(&self) -> &PendingRequests {
        &self.inner.pending
    }

    /// Offline queue lifecycle state.
    pub fn offline_state(&self) -> OfflineState {
        self.inner.offline.lock().state()
    }

    /// Whether sends are currently being queued.
    pub fn is_queueing(&self) -> bool {
        self.inner.config.offline_queueing && self.inner.offline.lock().is_queueing()
    }

    /// Activity snapshot.
    pub fn stats(&self) -> SenderStats {
        SenderStats {
            non_deliveries: self.inner.non_deliveries.all(),
            results: self.inner.results.all(),
            result_errors: self.inner.result_errors.all(),
            pending: self.inner.pending.len(),
            queued: self.inner.offline.lock().len(),
        }
    }

    /// Reset activity counters.
    pub fn reset_stats(&self) {
        self.inner.non_deliveries.reset();
        self.inner.results.reset();
        self.inner.result_errors.reset();
    }

    // ---- offline queue ----

    /// Queue every send until [`Sender::start_offline_queue`].
    pub fn initialize_offline_queue(&self) {
        if self.inner.config.offline_queueing {
            self.inner.offline.lock().init();
        }
    }

    /// Finish initialization and replay what was queued unless offline.
    pub async fn start_offline_queue(&self) {
        if !self.inner.config.offline_queueing {
            return;
        }
        let requests = self.inner.offline.lock().start();
        self.replay(requests).await;
    }

    /// Start queueing because the router became unreachable.
    pub fn enable_offline_mode(&self) {
        if self.inner.config.offline_queueing {
            self.inner.offline.lock().enable();
        }
    }

    /// Stop queueing and replay what was queued.
    pub async fn disable_offline_mode(&self) {
        if !self.inner.config.offline_queueing {
            return;
        }
        let requests = self.inner.offline.lock().disable();
        self.replay(requests).await;
    }

    async fn replay(&self, requests: Vec<QueuedRequest>) {
        if requests.is_empty() {
            return;
        }
        for request in requests {
            let options = SendOptions {
                token: Some(request.token.clone()),
                time_to_live: None,
                expires_at: Some(request.expires_at),
            };
            let token = request.token;
            if let Err(e) = self
                .build_and_send_packet(
                    request.kind,
                    &request.type_,
                    request.payload,
                    request.target,
                    options,
                    request.callback,
                )
                .await
            {
                error!("Failed replaying queued {} <{}>: {}", request.type_, token, e);
            }
        }
        self.inner.offline.lock().flushed();
    }

    // ---- sending ----

    /// Send a push.
    ///
    /// A callback asks for delivery confirmation; in broker mode it is
    /// called with each confirmation received.
    pub async fn send_push(
        &self,
        type_: &str,
        payload: Value,
        target: Option<Target>,
        options: SendOptions,
        callback: Option<ResponseHandler>,
    ) -> AgentResult<()> {
        self.build_and_send_packet(PacketKind::Push, type_, payload, target, options, callback)
            .await
    }

    /// Send a request to exactly one agent and deliver its response to
    /// `callback`.
    ///
    /// Targets with a fan-out selector are rejected.
    pub async fn send_request(
        &self,
        type_: &str,
        payload: Value,
        target: Option<Target>,
        options: SendOptions,
        callback: ResponseHandler,
    ) -> AgentResult<()> {
        self.build_and_send_packet(
            PacketKind::Request,
            type_,
            payload,
            target,
            options,
            Some(callback),
        )
        .await
    }

    /// Send a request and wait for its response.
    ///
    /// Fails with [`AgentError::Terminating`] if the request is dropped
    /// without a response.
    pub async fn request(
        &self,
        type_: &str,
        payload: Value,
        target: Option<Target>,
        options: SendOptions,
    ) -> AgentResult<Reply> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let callback: ResponseHandler = Arc::new(move |reply| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(reply);
            }
        });
        self.send_request(type_, payload, target, options, callback)
            .await?;
        rx.await
            .map_err(|_| AgentError::Terminating(format!("Request {type_} abandoned")))
    }

    async fn build_and_send_packet(
        &self,
        kind: PacketKind,
        type_: &str,
        payload: Value,
        target: Option<Target>,
        options: SendOptions,
        callback: Option<ResponseHandler>,
    ) -> AgentResult<()> {
        let Some(packet) =
            self.build_packet(kind, type_, payload, target.as_ref(), &options, callback.as_ref())?
        else {
            return Ok(());
        };
        let received_at = self.inner.clock.unix_f64();
        match &self.inner.transport {
            Transport::Http(client) => {
                self.http_send(client.clone(), target, packet, received_at, callback)
                    .await;
            }
            Transport::Broker(broker) => {
                self.amqp_send(broker.clone(), target, packet, received_at, callback)
                    .await;
            }
        }
        Ok(())
    }

    /// Build the envelope, or queue the send and return `None` while
    /// offline.
    fn build_packet(
        &self,
        kind: PacketKind,
        type_: &str,
        payload: Value,
        target: Option<&Target>,
        options: &SendOptions,
        callback: Option<&ResponseHandler>,
    ) -> AgentResult<Option<Envelope>> {
        if let Some(target) = target {
            target.validate(kind == PacketKind::Push)?;
        }
        let identity = self.inner.identity.as_str();
        let (mut packet, ttl) = match kind {
            PacketKind::Push => {
                let mut packet = Envelope::push(type_, payload, identity);
                packet.persistent = true;
                packet.confirm = callback.is_some();
                (packet, options.time_to_live)
            }
            PacketKind::Request => {
                let ttl = options.time_to_live.or(self.inner.config.time_to_live);
                (Envelope::request(type_, payload, identity), ttl)
            }
        };
        if let Some(token) = &options.token {
            packet.token = token.clone();
        }
        packet.expires_at = match options.expires_at {
            Some(at) => at,
            None => ttl.filter(|t| !t.is_zero()).map_or(0, |ttl| {
                (self.inner.clock.unix_f64() + ttl.as_secs_f64()) as i64
            }),
        };
        if let Some(target) = target {
            packet.apply_target(target);
        }
        if kind == PacketKind::Request {
            packet.selector = Selector::Any;
        }

        if self.is_queueing() {
            self.queue(QueuedRequest {
                kind,
                type_: packet.type_,
                payload: packet.payload,
                target: target.cloned(),
                token: packet.token,
                expires_at: packet.expires_at,
                callback: callback.cloned(),
            });
            return Ok(None);
        }
        Ok(Some(packet))
    }

    fn queue(&self, request: QueuedRequest) {
        let refused = self.inner.offline.lock().queue_request(request);
        if let Err(refused) = refused
            && let Some(callback) = refused.callback
        {
            let identity = self.inner.identity.clone();
            callback(Reply::new(
                refused.token,
                Some(identity.clone()),
                OperationResult::retry("offline queue full"),
                identity,
            ));
        }
    }

    fn queued(
        packet: &Envelope,
        target: Option<Target>,
        callback: Option<ResponseHandler>,
    ) -> QueuedRequest {
        QueuedRequest {
            kind: packet.kind,
            type_: packet.type_.clone(),
            payload: packet.payload.clone(),
            target,
            token: packet.token.clone(),
            expires_at: packet.expires_at,
            callback,
        }
    }

    // ---- HTTP transport ----

    async fn http_send(
        &self,
        client: Arc<dyn RequestClient>,
        target: Option<Target>,
        packet: Envelope,
        received_at: f64,
        callback: Option<ResponseHandler>,
    ) {
        if self.inner.config.async_response {
            let sender = self.clone();
            tokio::spawn(async move {
                sender
                    .http_send_once(client.as_ref(), target, packet, received_at, callback)
                    .await;
            });
        } else {
            self.http_send_once(client.as_ref(), target, packet, received_at, callback)
                .await;
        }
    }

    async fn http_send_once(
        &self,
        client: &dyn RequestClient,
        target: Option<Target>,
        packet: Envelope,
        received_at: f64,
        callback: Option<ResponseHandler>,
    ) {
        let mut options = RequestOptions::default().with_request_uuid(packet.token.clone());
        if packet.expires_at > 0 {
            let remaining = packet.expires_at - self.inner.clock.unix();
            options.time_to_live = Some(Duration::from_secs(remaining.max(0) as u64));
        }
        let response = match packet.kind {
            PacketKind::Push => {
                client
                    .push(&packet.type_, &packet.payload, target.as_ref(), options)
                    .await
            }
            PacketKind::Request => {
                client
                    .request(&packet.type_, &packet.payload, target.as_ref(), options)
                    .await
            }
        };
        let result = match response {
            Ok(content) => Some(OperationResult::success(content)),
            Err(e) => self.http_failure_result(e, &packet, target, callback.as_ref()),
        };

        if let Some(result) = result
            && let Some(callback) = callback
        {
            let identity = self.inner.identity.clone();
            let from = packet.target.clone().unwrap_or_default();
            let reply = Reply::new(packet.token.clone(), Some(identity), result, from)
                .with_received_at(received_at);
            self.inner.pending.insert(
                packet.token.clone(),
                Arc::new(PendingRequest::new(packet.kind, received_at, callback)),
            );
            self.handle_response(reply);
        }
    }

    /// Result reported locally for a failed HTTP send, if any.
    fn http_failure_result(
        &self,
        error: AgentError,
        packet: &Envelope,
        target: Option<Target>,
        callback: Option<&ResponseHandler>,
    ) -> Option<OperationResult> {
        match error {
            AgentError::Unauthorized(msg) => Some(OperationResult::error(msg)),
            e if e.is_connectivity() => {
                if self.is_queueing() {
                    self.queue(Self::queued(packet, target, callback.cloned()));
                    None
                } else {
                    Some(OperationResult::retry(e.to_string()))
                }
            }
            AgentError::Retryable(msg) => Some(OperationResult::retry(msg)),
            AgentError::InternalServer { server, .. } => {
                Some(OperationResult::error(format!("{server} internal error")))
            }
            AgentError::Terminating(_) => None,
            AgentError::Http(e) => Some(OperationResult::error(e.to_string())),
            other => {
                error!("Failed to send {} {}: {}", packet.trace(), packet.type_, other);
                Some(OperationResult::error(format!(
                    "{} agent internal error",
                    capitalize(agent_type(&self.inner.identity))
                )))
            }
        }
    }

    // ---- broker transport ----

    async fn amqp_send(
        &self,
        broker: Arc<dyn Broker>,
        target: Option<Target>,
        packet: Envelope,
        received_at: f64,
        callback: Option<ResponseHandler>,
    ) {
        if let Some(callback) = &callback {
            self.inner.pending.insert(
                packet.token.clone(),
                Arc::new(PendingRequest::new(packet.kind, received_at, callback.clone())),
            );
        }
        let sent = match packet.kind {
            PacketKind::Push => self.amqp_send_once(broker.as_ref(), &packet, None).await.map(drop),
            PacketKind::Request => self.amqp_send_retry(broker, packet.clone()).await,
        };
        match sent {
            Ok(()) => {}
            Err(SendError::TemporarilyOffline) if self.inner.config.offline_queueing => {
                if callback.is_some() {
                    self.inner.pending.remove(&packet.token);
                }
                self.queue(Self::queued(&packet, target, callback));
            }
            Err(SendError::TemporarilyOffline) => {
                self.respond_locally(
                    &packet.token,
                    OperationResult::retry("lost broker connectivity"),
                );
            }
            Err(e) => {
                self.respond_locally(&packet.token, OperationResult::non_delivery(e.to_string()))
            }
        }
    }

    async fn amqp_send_once(
        &self,
        broker: &dyn Broker,
        packet: &Envelope,
        broker_ids: Option<Vec<String>>,
    ) -> Result<Vec<String>, SendError> {
        let options = PublishOptions {
            persistent: packet.persistent,
            mandatory: true,
            broker_ids,
        };
        broker
            .publish(&self.inner.config.request_queue, packet, &options)
            .await
            .map_err(|e| {
                error!("Failed to publish request {} {}: {}", packet.trace(), packet.type_, e);
                match e {
                    BrokerError::NoConnectedBrokers => SendError::TemporarilyOffline,
                    _ => SendError::SendFailure,
                }
            })
    }

    /// Publish a request, then republish it on a doubling interval under
    /// fresh tokens until it is answered or the retry timeout passes.
    async fn amqp_send_retry(
        &self,
        broker: Arc<dyn Broker>,
        packet: Envelope,
    ) -> Result<(), SendError> {
        let broker_ids = self.amqp_send_once(broker.as_ref(), &packet, None).await?;
        let (Some(interval), Some(timeout)) =
            (self.inner.config.retry_interval, self.inner.config.retry_timeout)
        else {
            return Ok(());
        };
        if interval.is_zero() || timeout.is_zero() {
            return Ok(());
        }
        let sender = self.clone();
        tokio::spawn(async move {
            sender
                .retry_loop(broker, packet, broker_ids, interval, timeout)
                .await;
        });
        Ok(())
    }

    async fn retry_loop(
        &self,
        broker: Arc<dyn Broker>,
        mut packet: Envelope,
        mut broker_ids: Vec<String>,
        interval: Duration,
        timeout: Duration,
    ) {
        let parent_token = packet.token.clone();
        let mut multiplier = 1u32;
        let mut elapsed = Duration::ZERO;
        let mut count = 0u32;
        loop {
            let wait = (interval * multiplier).min(timeout.saturating_sub(elapsed));
            tokio::time::sleep(wait).await;
            if !self.inner.pending.contains(&parent_token) {
                return;
            }
            count += 1;
            elapsed += wait;

            if elapsed < timeout && !packet.is_expired_at(self.inner.clock.unix()) {
                let Some(record) = self.inner.pending.get(&packet.token) else {
                    return;
                };
                packet.tries.push(packet.token.clone());
                packet.token = uuid::Uuid::new_v4().to_string();
                if record.retry_parent_token().is_none() {
                    record.set_retry_parent_token(parent_token.clone());
                }
                self.inner.pending.insert(packet.token.clone(), record);
                multiplier = multiplier.saturating_mul(2);
                debug!("Retry #{} of {} as {}", count, parent_token, packet.trace());
                match self
                    .amqp_send_once(broker.as_ref(), &packet, Some(broker_ids.clone()))
                    .await
                {
                    Ok(ids) => {
                        for id in ids {
                            if !broker_ids.contains(&id) {
                                broker_ids.push(id);
                            }
                        }
                    }
                    Err(SendError::TemporarilyOffline) => {
                        error!("Failed retry for {} because temporarily offline", packet.trace());
                        return;
                    }
                    Err(_) => {
                        error!("Failed retry for {} because of send failure", packet.trace());
                        return;
                    }
                }
            } else {
                warn!(
                    "RE-SEND TIMEOUT after {} seconds for {} {}",
                    elapsed.as_secs_f64(),
                    packet.trace(),
                    packet.type_
                );
                self.respond_locally(&packet.token, OperationResult::non_delivery(RETRY_TIMEOUT));
                return;
            }
        }
    }

    fn respond_locally(&self, token: &str, result: OperationResult) {
        let identity = self.inner.identity.clone();
        self.handle_response(Reply::new(token, Some(identity.clone()), result, identity));
    }

    // ---- responses ----

    /// Deliver a response to the pending request it answers.
    ///
    /// A request that was not delivered because its target was not
    /// connected stays pending so that retries may still reach it; the
    /// reason is reported if retrying later times out.
    pub fn handle_response(&self, reply: Reply) {
        self.record_result(&reply.results);
        let token = reply.token.clone();
        let Some(pending) = self.inner.pending.get(&token) else {
            if let OperationResult::NonDelivery(reason) = &reply.results {
                info!("Non-delivery of <{}> because {}", token, reason);
            } else {
                debug!("No pending request for response {}", reply);
            }
            return;
        };

        if pending.kind() == PacketKind::Request
            && let OperationResult::NonDelivery(reason) = &reply.results
        {
            if reason == TARGET_NOT_CONNECTED {
                info!("Non-delivery of <{}> because {}", token, reason);
                match pending
                    .retry_parent_token()
                    .and_then(|parent| self.inner.pending.get(&parent))
                {
                    Some(parent) => parent.set_non_delivery(reason.clone()),
                    None => pending.set_non_delivery(reason.clone()),
                }
                return;
            }
            if reason == RETRY_TIMEOUT
                && let Some(earlier) = pending.non_delivery()
            {
                let mut reply = reply;
                reply.results = OperationResult::non_delivery(earlier);
                self.deliver_response(reply, &pending);
                return;
            }
        }
        self.deliver_response(reply, &pending);
    }

    /// [`Sender::handle_response`] for a JSON-encoded reply; malformed
    /// replies are logged and dropped.
    pub fn handle_response_value(&self, value: &Value) {
        match serde_json::from_value::<Reply>(value.clone()) {
            Ok(reply) => self.handle_response(reply),
            Err(e) => warn!("Ignoring malformed response: {}", e),
        }
    }

    fn record_result(&self, result: &OperationResult) {
        match result {
            OperationResult::NonDelivery(reason) => {
                self.inner.non_deliveries.update(reason.clone())
            }
            OperationResult::Error(msg) => self.inner.result_errors.update(msg.clone()),
            _ => {}
        }
        self.inner.results.update(result.status());
    }

    fn deliver_response(&self, reply: Reply, pending: &PendingRequest) {
        if pending.kind() == PacketKind::Request {
            self.inner.pending.remove(&reply.token);
        }
        if let Some(parent) = pending.retry_parent_token() {
            self.inner.pending.remove_retry_chain(&parent);
        }
        pending.respond(reply);
    }

    // ---- shutdown ----

    /// Stop queueing and report the requests still unanswered as their
    /// count and the age in seconds of the youngest.
    pub fn terminate(&self) -> (usize, Option<f64>) {
        let dropped = self.inner.offline.lock().terminate();
        if dropped > 0 {
            warn!("Dropped {} queued requests on termination", dropped);
        }
        let requests = self.inner.pending.of_kind(PacketKind::Request).len();
        (requests, self.inner.pending.youngest_age(PacketKind::Request))
    }

    /// Unfinished requests for diagnostics.
    pub fn dump_requests(&self) -> Vec<String> {
        self.inner.pending.dump()
    }
}

/// Agent type from an identity such as `rs-agent-1-1`.
fn agent_type(identity: &str) -> &str {
    let parts: Vec<&str> = identity.split('-').collect();
    match parts.as_slice() {
        [_, agent_type, _, _] => agent_type,
        _ => identity,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
