//! Client and sender statistics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A serializable snapshot of a client's request statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStats {
    /// Requests issued, including resends.
    pub requests: u64,

    /// Requests that completed with a 2xx response.
    pub completed: u64,

    /// Requests that raised an error after classification.
    pub failures: u64,

    /// Resends made by the retry policy.
    pub retries: u64,

    /// Reconnect attempts.
    pub reconnects: u64,

    /// State changes observed.
    pub state_changes: u64,

    /// Average request latency in milliseconds.
    pub average_latency_ms: f64,
}

/// Lock-free counters behind [`ClientStats`].
#[derive(Debug, Default)]
pub struct AtomicStats {
    /// Requests issued
    pub requests: AtomicU64,
    /// Successful completions
    pub completed: AtomicU64,
    /// Classified failures
    pub failures: AtomicU64,
    /// Retry-policy resends
    pub retries: AtomicU64,
    /// Reconnect attempts
    pub reconnects: AtomicU64,
    /// State changes
    pub state_changes: AtomicU64,

    avg_latency_us: AtomicU64,
}

impl AtomicStats {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a latency sample into the moving average.
    pub fn record_latency_us(&self, latency_us: u64) {
        let current = self.avg_latency_us.load(Ordering::Relaxed);
        let new_avg = if current == 0 {
            latency_us
        } else {
            // alpha = 0.1
            current.saturating_mul(9).saturating_add(latency_us) / 10
        };
        self.avg_latency_us.store(new_avg, Ordering::Relaxed);
    }

    /// Take a snapshot.
    pub fn snapshot(&self) -> ClientStats {
        ClientStats {
            requests: self.requests.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            average_latency_ms: self.avg_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.completed,
            &self.failures,
            &self.retries,
            &self.reconnects,
            &self.state_changes,
            &self.avg_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Per-label activity counts, such as non-delivery reasons or result kinds.
#[derive(Debug, Default)]
pub struct ActivityCounts {
    counts: DashMap<String, u64>,
}

impl ActivityCounts {
    /// No activity recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence of `label`.
    pub fn update(&self, label: impl Into<String>) {
        *self.counts.entry(label.into()).or_insert(0) += 1;
    }

    /// Occurrences of `label` so far.
    pub fn count(&self, label: &str) -> u64 {
        self.counts.get(label).map_or(0, |c| *c)
    }

    /// Total across all labels.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|e| *e.value()).sum()
    }

    /// Sorted copy of all counts.
    pub fn all(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Forget everything.
    pub fn reset(&self) {
        self.counts.clear();
    }
}
