// src/proxy/backend.rs
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

/// A single backend server, uniquely owned by the [`BackendPool`](crate::proxy::BackendPool).
///
/// Strategies hold shared `Arc<Backend>` references; all mutation goes
/// through atomics or the latency-window mutex so a backend stays safe to
/// read from any number of in-flight request handlers at once.
#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub url: Url,
    pub weight: u32,

    healthy: AtomicBool,
    current_connections: AtomicUsize,
    total_requests: AtomicU64,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    recent_latencies: Mutex<VecDeque<u64>>,
    latency_window_size: usize,
}

/// Backends are equal iff their ids are equal (spec §3, §9).
impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Backend {}

impl std::hash::Hash for Backend {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Backend {
    pub fn new(id: impl Into<String>, url: Url, weight: u32, latency_window_size: usize) -> Self {
        Self {
            id: id.into(),
            url,
            weight: weight.max(1),
            healthy: AtomicBool::new(false),
            current_connections: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            recent_latencies: Mutex::new(VecDeque::with_capacity(latency_window_size)),
            latency_window_size: latency_window_size.max(1),
        }
    }

    pub fn current_connections(&self) -> usize {
        self.current_connections.load(Ordering::SeqCst)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Unconditionally increments the connection count and the lifetime
    /// request counter. Used by strategies that don't need select+increment
    /// to be atomic with respect to each other (RR, WRR, IP-Hash, CH).
    pub fn increment_connections(&self) {
        self.current_connections.fetch_add(1, Ordering::SeqCst);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Compare-and-set increment: only succeeds if the counter still reads
    /// `expected`. Used by Least-Connections so select+increment is
    /// observably atomic without holding a lock across the scan.
    pub fn try_increment_connections(&self, expected: usize) -> bool {
        let ok = self
            .current_connections
            .compare_exchange(expected, expected + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if ok {
            self.total_requests.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Saturating decrement; never goes below zero even under races between
    /// a late decrement and a topology change.
    pub fn decrement_connections(&self) {
        let _ = self
            .current_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(1))
            });
    }

    pub fn record_latency(&self, ms: u64) {
        let mut window = self.recent_latencies.lock().unwrap();
        if window.len() >= self.latency_window_size {
            window.pop_front();
        }
        window.push_back(ms);
    }

    /// Mean of the latency window, or `f64::INFINITY` when no observation
    /// has landed yet (spec §3: "sentinel meaning unknown").
    pub fn average_latency(&self) -> f64 {
        let window = self.recent_latencies.lock().unwrap();
        if window.is_empty() {
            return f64::INFINITY;
        }
        window.iter().sum::<u64>() as f64 / window.len() as f64
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
        if healthy {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.consecutive_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn get_metrics(&self) -> BackendMetrics {
        BackendMetrics {
            current_connections: self.current_connections(),
            total_requests: self.total_requests(),
            average_latency_ms: self.average_latency(),
            healthy: self.is_healthy(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackendMetrics {
    pub current_connections: usize,
    pub total_requests: u64,
    pub average_latency_ms: f64,
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(id: &str) -> Backend {
        Backend::new(id, Url::parse("http://127.0.0.1:9000").unwrap(), 1, 10)
    }

    #[test]
    fn decrement_saturates_at_zero() {
        let b = backend("b1");
        b.decrement_connections();
        b.decrement_connections();
        assert_eq!(b.current_connections(), 0);
    }

    #[test]
    fn increment_then_decrement_nets_to_zero() {
        let b = backend("b1");
        b.increment_connections();
        b.increment_connections();
        assert_eq!(b.current_connections(), 2);
        b.decrement_connections();
        b.decrement_connections();
        assert_eq!(b.current_connections(), 0);
        assert_eq!(b.total_requests(), 2);
    }

    #[test]
    fn try_increment_fails_when_stale() {
        let b = backend("b1");
        b.increment_connections(); // now at 1
        assert!(!b.try_increment_connections(0));
        assert!(b.try_increment_connections(1));
        assert_eq!(b.current_connections(), 2);
    }

    #[test]
    fn latency_window_evicts_oldest_past_ten() {
        let b = backend("b1");
        for ms in 1..=15u64 {
            b.record_latency(ms);
        }
        // Only the last 10 samples (6..=15) should remain.
        let avg = b.average_latency();
        let expected: f64 = (6..=15u64).sum::<u64>() as f64 / 10.0;
        assert!((avg - expected).abs() < 1e-9);
    }

    #[test]
    fn average_latency_is_infinite_when_empty() {
        let b = backend("b1");
        assert!(b.average_latency().is_infinite());
    }

    #[test]
    fn weight_floors_to_one() {
        let b = Backend::new("b1", Url::parse("http://x/").unwrap(), 0, 10);
        assert_eq!(b.weight, 1);
    }
}
