// src/load_balancer/least_response_time.rs
use crate::load_balancer::algorithm::{LbError, LoadBalancer, LoadBalancerAlgorithm};
use crate::proxy::Backend;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

const BOOTSTRAP_MS: f64 = 1000.0;
const FAILURE_PENALTY_MS: f64 = 2000.0; // 2x bootstrap, per spec §4.7.

struct EwmaState {
    avg: f64,
    initialized: bool,
}

/// Per-backend EWMA of response time (`new = alpha*sample + (1-alpha)*old`),
/// combined with the backend's own recent-latency window to pick an
/// argmin. A fastest-converging backend can absorb nearly all traffic —
/// the "snowball effect" — which is a documented property, not a bug
/// (spec §4.7).
pub struct LeastResponseTimeBalancer {
    stats: DashMap<String, EwmaState>,
    alpha: f64,
}

impl LeastResponseTimeBalancer {
    pub fn new(alpha: f64) -> Self {
        Self {
            stats: DashMap::new(),
            alpha,
        }
    }

    fn effective_response_time(&self, backend: &Backend) -> f64 {
        let window_avg = backend.average_latency();
        let window_available = window_avg.is_finite();

        let (ewma_avg, ewma_available) = match self.stats.get(&backend.id) {
            Some(state) if state.initialized => (state.avg, true),
            _ => (BOOTSTRAP_MS, false),
        };

        match (window_available, ewma_available) {
            (true, true) => (window_avg + ewma_avg) / 2.0,
            (true, false) => window_avg,
            (false, true) => ewma_avg,
            (false, false) => BOOTSTRAP_MS,
        }
    }

    fn update_ewma(&self, backend_id: &str, sample_ms: f64) {
        let mut entry = self
            .stats
            .entry(backend_id.to_string())
            .or_insert(EwmaState {
                avg: BOOTSTRAP_MS,
                initialized: false,
            });

        if entry.initialized {
            entry.avg = self.alpha * sample_ms + (1.0 - self.alpha) * entry.avg;
        } else {
            entry.avg = sample_ms;
            entry.initialized = true;
        }
    }
}

impl Default for LeastResponseTimeBalancer {
    fn default() -> Self {
        Self::new(0.3)
    }
}

#[async_trait]
impl LoadBalancer for LeastResponseTimeBalancer {
    async fn select(
        &self,
        healthy: &[Arc<Backend>],
        _client_info: &str,
    ) -> Result<Arc<Backend>, LbError> {
        if healthy.is_empty() {
            return Err(LbError::NoHealthyBackend);
        }

        let chosen = healthy
            .iter()
            .min_by(|a, b| {
                let ta = self.effective_response_time(a);
                let tb = self.effective_response_time(b);
                ta.partial_cmp(&tb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .expect("healthy is non-empty")
            .clone();

        chosen.increment_connections();
        Ok(chosen)
    }

    async fn record(&self, backend: &Arc<Backend>, latency_ms: u64, success: bool) {
        backend.decrement_connections();
        if success {
            backend.record_latency(latency_ms);
            self.update_ewma(&backend.id, latency_ms as f64);
        } else {
            self.update_ewma(&backend.id, FAILURE_PENALTY_MS);
        }
    }

    fn on_remove(&self, backend: &Arc<Backend>) {
        self.stats.remove(&backend.id);
    }

    fn name(&self) -> LoadBalancerAlgorithm {
        LoadBalancerAlgorithm::LeastResponseTime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn backend(id: &str, port: u16) -> Arc<Backend> {
        let b = Backend::new(id, Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(), 1, 10);
        b.set_healthy(true);
        Arc::new(b)
    }

    #[tokio::test]
    async fn picks_fastest_backend_after_observations() {
        let backends = vec![backend("s1", 9001), backend("s2", 9002)];
        let lrt = LeastResponseTimeBalancer::new(0.3);

        lrt.record(&backends[0], 500, true).await;
        lrt.record(&backends[1], 10, true).await;

        // s2 (10ms) should now look faster than s1 (500ms).
        let next = lrt.select(&backends, "").await.unwrap();
        assert_eq!(next.id, "s2");
    }

    #[tokio::test]
    async fn failure_penalty_drifts_traffic_away() {
        let backends = vec![backend("s1", 9001), backend("s2", 9002)];
        let lrt = LeastResponseTimeBalancer::new(0.3);

        // s2 gets one fast, successful observation.
        lrt.record(&backends[1], 20, true).await;

        // s1 only ever fails; its window stays empty so its score is driven
        // purely by the EWMA, which the failure penalty bootstraps straight
        // to 2000ms.
        for _ in 0..3 {
            lrt.record(&backends[0], 0, false).await;
        }

        let next = lrt.select(&backends, "").await.unwrap();
        assert_eq!(next.id, "s2");
    }

    #[tokio::test]
    async fn net_connection_change_is_zero() {
        let backends = vec![backend("s1", 9001)];
        let lrt = LeastResponseTimeBalancer::new(0.3);
        let picked = lrt.select(&backends, "").await.unwrap();
        lrt.record(&picked, 12, true).await;
        assert_eq!(backends[0].current_connections(), 0);
    }
}
