//! Health-aware endpoint selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use url::Url;

use crate::config::Balancing;

#[derive(Debug, Clone, Copy, Default)]
struct EndpointHealth {
    misses: u32,
    dead_since: Option<Instant>,
}

/// Chooses the order in which endpoints are tried for one call.
///
/// Endpoints that missed (transport failure or retryable status) are marked
/// dead and tried only after every live endpoint, and only once a health
/// check has revived them.
#[derive(Debug)]
pub struct Balancer {
    endpoints: Vec<Url>,
    policy: Balancing,
    next: AtomicUsize,
    health: Mutex<Vec<EndpointHealth>>,
}

impl Balancer {
    /// Balance over `endpoints` using `policy`.
    pub fn new(endpoints: Vec<Url>, policy: Balancing) -> Self {
        let health = Mutex::new(vec![EndpointHealth::default(); endpoints.len()]);
        Self {
            endpoints,
            policy,
            next: AtomicUsize::new(0),
            health,
        }
    }

    /// Configured endpoints.
    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Endpoint at `index`.
    pub fn endpoint(&self, index: usize) -> Option<&Url> {
        self.endpoints.get(index)
    }

    /// Indices to try for the next call: live endpoints first, starting
    /// where the policy says, then dead ones.
    pub fn order(&self) -> Vec<usize> {
        let n = self.endpoints.len();
        if n == 0 {
            return Vec::new();
        }
        let start = match self.policy {
            Balancing::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % n,
            Balancing::Random => fastrand::usize(..n),
        };
        let health = self.health.lock();
        let rotated = (0..n).map(|i| (start + i) % n);
        let (live, dead): (Vec<usize>, Vec<usize>) =
            rotated.partition(|&i| health[i].dead_since.is_none());
        live.into_iter().chain(dead).collect()
    }

    /// Whether the endpoint is currently marked dead.
    pub fn is_dead(&self, index: usize) -> bool {
        self.health
            .lock()
            .get(index)
            .is_some_and(|h| h.dead_since.is_some())
    }

    /// Record a miss and mark the endpoint dead.
    pub fn mark_dead(&self, index: usize) {
        if let Some(h) = self.health.lock().get_mut(index) {
            h.misses += 1;
            h.dead_since.get_or_insert_with(Instant::now);
        }
    }

    /// Mark the endpoint healthy again.
    pub fn mark_alive(&self, index: usize) {
        if let Some(h) = self.health.lock().get_mut(index) {
            h.dead_since = None;
        }
    }

    /// Total misses recorded for the endpoint.
    pub fn misses(&self, index: usize) -> u32 {
        self.health.lock().get(index).map_or(0, |h| h.misses)
    }

    /// Number of endpoints not marked dead.
    pub fn live_count(&self) -> usize {
        self.health
            .lock()
            .iter()
            .filter(|h| h.dead_since.is_none())
            .count()
    }
}
