//! Listen state machine deciding between WebSocket and long-polling.
//!
//! The machine holds no connections; the router feeds it the outcome of
//! each tick and sleeps for [`ListenMachine::interval`] before the next.

use std::fmt;
use std::time::Duration;

use crate::config::RouterConfig;

/// Close code of a normal WebSocket closure.
pub const NORMAL_CLOSE: u16 = 1000;
/// Close code sent when an endpoint is going away.
pub const SHUTDOWN_CLOSE: u16 = 1001;
/// Close code of a protocol error, including failed upgrades.
pub const PROTOCOL_ERROR_CLOSE: u16 = 1002;

/// What the next listen tick does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    /// Decide between WebSocket and long-polling
    Choose,
    /// Confirm a fresh WebSocket stays up
    Check,
    /// Open a WebSocket
    Connect,
    /// Issue one long-poll
    LongPoll,
    /// A deferred long-poll is outstanding
    Wait,
    /// Stop listening
    Cancel,
}

impl fmt::Display for ListenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Choose => "choose",
            Self::Check => "check",
            Self::Connect => "connect",
            Self::LongPoll => "long_poll",
            Self::Wait => "wait",
            Self::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// Listen state plus the connect and reconnect backoffs.
#[derive(Debug, Clone)]
pub struct ListenMachine {
    config: RouterConfig,
    state: ListenState,
    interval: Duration,
    checks: u32,
    failures: u32,
    connect_interval: Duration,
    reconnect_interval: Duration,
    attempted_connect_at: Option<f64>,
    close_code: Option<u16>,
    close_reason: Option<String>,
}

impl ListenMachine {
    /// Machine in `choose` with base backoffs.
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            config: config.clone(),
            state: ListenState::Choose,
            interval: Duration::ZERO,
            checks: 0,
            failures: 0,
            connect_interval: config.connect_interval,
            reconnect_interval: config.reconnect_interval,
            attempted_connect_at: None,
            close_code: None,
            close_reason: None,
        }
    }

    /// Back to `choose` with base backoffs and no failures.
    pub fn reset(&mut self) {
        self.state = ListenState::Choose;
        self.interval = Duration::ZERO;
        self.checks = 0;
        self.failures = 0;
        self.connect_interval = self.config.connect_interval;
        self.reconnect_interval = self.config.reconnect_interval;
    }

    /// Current state.
    pub fn state(&self) -> ListenState {
        self.state
    }

    /// Wait before the next tick.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current connect backoff.
    pub fn connect_interval(&self) -> Duration {
        self.connect_interval
    }

    /// Current reconnect backoff.
    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    /// Consecutive unexpected failures.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Ticks spent in `check`.
    pub fn checks(&self) -> u32 {
        self.checks
    }

    /// Move to `state` and wait `interval` before the next tick.
    ///
    /// Entering `check` from another state restarts the check count.
    /// Once cancelled the machine stays cancelled until [`Self::reset`].
    pub fn update(&mut self, state: ListenState, interval: Duration) {
        if self.state == ListenState::Cancel {
            return;
        }
        if state == ListenState::Check && self.state != ListenState::Check {
            self.checks = 0;
        }
        self.state = state;
        self.interval = interval;
    }

    /// Pick the listen method.
    ///
    /// Connects immediately when never tried, when the connect backoff has
    /// elapsed, or when the last close suggests the router was only briefly
    /// unreachable; otherwise waits out the rest of the backoff.
    pub fn choose(&mut self, now: f64, websocket_connected: bool) {
        if self.config.long_polling_only {
            self.update(ListenState::LongPoll, Duration::ZERO);
            self.connect_interval = self.config.max_connect_interval;
        } else if websocket_connected {
            self.update(ListenState::Choose, self.connect_interval);
        } else {
            let interval = match self.attempted_connect_at {
                None => Duration::ZERO,
                Some(at) => {
                    let remaining = self.connect_interval.as_secs_f64() - (now - at);
                    if remaining <= 0.0 || self.peer_closed_recoverably() {
                        Duration::ZERO
                    } else {
                        Duration::from_secs_f64(remaining)
                    }
                }
            };
            self.update(ListenState::Connect, interval);
        }
    }

    /// Follow up on a fresh connection.
    pub fn check(&mut self, websocket_connected: bool) {
        if !websocket_connected {
            if self.router_not_responding() {
                let interval = self.backoff_reconnect();
                self.update(ListenState::Connect, interval);
            } else {
                self.backoff_connect();
                self.update(ListenState::LongPoll, Duration::ZERO);
            }
        } else if self.checks >= self.config.check_count {
            self.connect_interval = self.config.connect_interval;
            self.update(ListenState::Choose, self.connect_interval);
        } else {
            self.checks += 1;
        }
    }

    /// Record the time of a connect attempt.
    pub fn connect_attempted(&mut self, now: f64) {
        self.attempted_connect_at = Some(now);
    }

    /// A WebSocket opened.
    pub fn connected(&mut self) {
        self.reconnect_interval = self.config.reconnect_interval;
        self.update(ListenState::Check, Duration::from_secs(1));
    }

    /// The router refused the upgrade with HTTP `status`.
    ///
    /// Recorded as a protocol-error close, then `check` decides between
    /// reconnecting and long-polling.
    pub fn connect_rejected(&mut self, status: u16) {
        self.websocket_closed(
            PROTOCOL_ERROR_CLOSE,
            Some(format!("Unexpected response code: {status}")),
        );
        self.update(ListenState::Check, Duration::ZERO);
    }

    /// Opening a WebSocket failed; long-poll instead.
    pub fn connect_failed(&mut self) {
        self.backoff_connect();
        self.update(ListenState::LongPoll, Duration::ZERO);
    }

    /// A long-poll was handed to a background task.
    pub fn long_poll_deferred(&mut self) {
        self.update(ListenState::Wait, Duration::from_secs(1));
    }

    /// A long-poll returned.
    pub fn long_poll_succeeded(&mut self) {
        self.update(ListenState::Choose, Duration::ZERO);
    }

    /// A long-poll failed.
    pub fn long_poll_failed(&mut self) {
        let interval = self.backoff_reconnect();
        self.update(ListenState::Choose, interval);
    }

    /// A tick completed without an unexpected error.
    pub fn tick_succeeded(&mut self) {
        self.failures = 0;
    }

    /// A tick hit an unexpected error.
    ///
    /// Returns false once the failure limit is exceeded, after moving to
    /// `cancel`.
    pub fn tick_failed(&mut self) -> bool {
        self.failures += 1;
        if self.failures > self.config.max_listen_failures {
            self.update(ListenState::Cancel, Duration::ZERO);
            return false;
        }
        self.update(ListenState::Choose, Duration::ZERO);
        true
    }

    /// Stop listening.
    pub fn cancel(&mut self) {
        self.update(ListenState::Cancel, Duration::ZERO);
    }

    /// Remember how the last WebSocket closed.
    pub fn websocket_closed(&mut self, code: u16, reason: Option<String>) {
        self.close_code = Some(code);
        self.close_reason = reason;
    }

    /// Whether the last close came from a failed upgrade with 502 or 503.
    pub fn router_not_responding(&self) -> bool {
        self.close_code == Some(PROTOCOL_ERROR_CLOSE)
            && self
                .close_reason
                .as_deref()
                .is_some_and(|r| unexpected_response_code(r, &["502", "503"]))
    }

    fn peer_closed_recoverably(&self) -> bool {
        match self.close_code {
            Some(NORMAL_CLOSE | SHUTDOWN_CLOSE) => true,
            Some(PROTOCOL_ERROR_CLOSE) => self
                .close_reason
                .as_deref()
                .is_some_and(|r| unexpected_response_code(r, &["408", "502", "503"])),
            _ => false,
        }
    }

    /// Double the connect backoff up to its cap.
    pub fn backoff_connect(&mut self) -> Duration {
        self.connect_interval = (self.connect_interval * 2).min(self.config.max_connect_interval);
        self.connect_interval
    }

    /// Double the reconnect backoff up to its cap.
    pub fn backoff_reconnect(&mut self) -> Duration {
        self.reconnect_interval =
            (self.reconnect_interval * 2).min(self.config.max_reconnect_interval);
        self.reconnect_interval
    }
}

fn unexpected_response_code(reason: &str, codes: &[&str]) -> bool {
    reason
        .split_once("Unexpected response code: ")
        .is_some_and(|(_, rest)| codes.iter().any(|code| rest.starts_with(code)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NOW: f64 = 1_000_000.0;

    fn machine() -> ListenMachine {
        ListenMachine::new(&RouterConfig::default())
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_first_choice_connects_immediately() {
        let mut m = machine();
        m.choose(NOW, false);
        assert_eq!(m.state(), ListenState::Connect);
        assert_eq!(m.interval(), Duration::ZERO);
    }

    #[test]
    fn test_long_polling_only() {
        let mut m = ListenMachine::new(&RouterConfig::long_polling(secs(60)));
        m.choose(NOW, false);
        assert_eq!(m.state(), ListenState::LongPoll);
        assert_eq!(m.interval(), Duration::ZERO);
        assert_eq!(m.connect_interval(), secs(86_400));
    }

    #[test]
    fn test_connected_delays_choice() {
        let mut m = machine();
        m.choose(NOW, true);
        assert_eq!(m.state(), ListenState::Choose);
        assert_eq!(m.interval(), secs(30));
    }

    #[test]
    fn test_connect_after_backoff_elapsed() {
        let mut m = machine();
        m.connect_attempted(NOW - 30.0);
        m.choose(NOW, false);
        assert_eq!(m.state(), ListenState::Connect);
        assert_eq!(m.interval(), Duration::ZERO);

        m.connect_attempted(NOW - 28.0);
        m.choose(NOW, false);
        assert_eq!(m.state(), ListenState::Connect);
        assert_eq!(m.interval(), secs(2));
    }

    #[test]
    fn test_connect_immediately_after_recoverable_close() {
        for (code, reason) in [
            (NORMAL_CLOSE, None),
            (SHUTDOWN_CLOSE, Some("Going Away")),
            (PROTOCOL_ERROR_CLOSE, Some("Unexpected response code: 408")),
            (PROTOCOL_ERROR_CLOSE, Some("Unexpected response code: 502")),
            (PROTOCOL_ERROR_CLOSE, Some("Unexpected response code: 503")),
        ] {
            let mut m = machine();
            m.connect_attempted(NOW);
            m.websocket_closed(code, reason.map(str::to_string));
            m.choose(NOW, false);
            assert_eq!(m.state(), ListenState::Connect);
            assert_eq!(m.interval(), Duration::ZERO, "close code {code}");
        }

        let mut m = machine();
        m.connect_attempted(NOW);
        m.websocket_closed(PROTOCOL_ERROR_CLOSE, Some("Unexpected response code: 400".into()));
        m.choose(NOW, false);
        assert_eq!(m.interval(), secs(30));
    }

    #[test]
    fn test_check_when_router_not_responding_reconnects() {
        let mut m = machine();
        m.update(ListenState::Check, Duration::ZERO);
        m.websocket_closed(PROTOCOL_ERROR_CLOSE, Some("Unexpected response code: 502".into()));
        m.check(false);
        assert_eq!(m.state(), ListenState::Connect);
        assert_eq!(m.interval(), secs(4));
    }

    #[test]
    fn test_rejected_upgrade_goes_through_check() {
        let mut m = machine();
        m.connect_rejected(502);
        assert!(m.router_not_responding());
        assert_eq!(m.state(), ListenState::Check);
        assert_eq!(m.interval(), Duration::ZERO);
        assert_eq!(m.connect_interval(), secs(30));

        m.check(false);
        assert_eq!(m.state(), ListenState::Connect);
        assert_eq!(m.interval(), secs(4));

        let mut m = machine();
        m.connect_rejected(401);
        assert!(!m.router_not_responding());
        m.check(false);
        assert_eq!(m.state(), ListenState::LongPoll);
        assert_eq!(m.connect_interval(), secs(60));
    }

    #[test]
    fn test_check_when_closed_falls_back_to_long_poll() {
        let mut m = machine();
        m.update(ListenState::Check, Duration::ZERO);
        m.check(false);
        assert_eq!(m.connect_interval(), secs(60));
        assert_eq!(m.state(), ListenState::LongPoll);
        assert_eq!(m.interval(), Duration::ZERO);
    }

    #[test]
    fn test_check_counts_until_healthy() {
        let mut m = machine();
        m.connected();
        assert_eq!(m.state(), ListenState::Check);
        assert_eq!(m.interval(), secs(1));
        for expected in 1..=5 {
            m.check(true);
            assert_eq!(m.state(), ListenState::Check);
            assert_eq!(m.checks(), expected);
        }
        m.check(true);
        assert_eq!(m.state(), ListenState::Choose);
        assert_eq!(m.interval(), secs(30));
    }

    #[test]
    fn test_check_count_restarts_only_on_entry() {
        let mut m = machine();
        m.update(ListenState::Check, Duration::ZERO);
        m.check(true);
        m.update(ListenState::Check, Duration::ZERO);
        assert_eq!(m.checks(), 1);
    }

    #[test]
    fn test_connect_outcomes() {
        let mut m = machine();
        m.backoff_reconnect();
        m.connected();
        assert_eq!(m.reconnect_interval(), secs(2));

        m.connect_failed();
        assert_eq!(m.connect_interval(), secs(60));
        assert_eq!(m.state(), ListenState::LongPoll);
        assert_eq!(m.interval(), Duration::ZERO);
    }

    #[test]
    fn test_long_poll_outcomes() {
        let mut m = machine();
        m.long_poll_deferred();
        assert_eq!(m.state(), ListenState::Wait);
        assert_eq!(m.interval(), secs(1));

        m.long_poll_succeeded();
        assert_eq!(m.state(), ListenState::Choose);
        assert_eq!(m.interval(), Duration::ZERO);

        m.long_poll_failed();
        assert_eq!(m.state(), ListenState::Choose);
        assert_eq!(m.interval(), secs(4));
        assert_eq!(m.connect_interval(), secs(30));
    }

    #[test]
    fn test_backoffs_are_capped() {
        let mut m = machine();
        for _ in 0..12 {
            assert!(m.backoff_connect() <= secs(86_400));
        }
        assert_eq!(m.connect_interval(), secs(86_400));
        for _ in 0..6 {
            m.backoff_reconnect();
        }
        assert_eq!(m.reconnect_interval(), secs(30));
    }

    #[test]
    fn test_repeated_failures_cancel() {
        let mut m = machine();
        for _ in 0..10 {
            assert!(m.tick_failed());
            assert_eq!(m.state(), ListenState::Choose);
        }
        assert!(!m.tick_failed());
        assert_eq!(m.state(), ListenState::Cancel);

        let mut m = machine();
        m.tick_failed();
        m.tick_succeeded();
        assert_eq!(m.failures(), 0);
    }

    #[test]
    fn test_cancel_is_sticky() {
        let mut m = machine();
        m.cancel();
        m.connected();
        m.long_poll_failed();
        assert_eq!(m.state(), ListenState::Cancel);
    }

    #[test]
    fn test_reset() {
        let mut m = machine();
        m.backoff_connect();
        m.backoff_reconnect();
        m.tick_failed();
        m.cancel();
        m.reset();
        assert_eq!(m.state(), ListenState::Choose);
        assert_eq!(m.connect_interval(), secs(30));
        assert_eq!(m.reconnect_interval(), secs(2));
        assert_eq!(m.failures(), 0);
    }
}
