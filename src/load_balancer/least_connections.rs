// src/load_balancer/least_connections.rs
use crate::load_balancer::algorithm::{LbError, LoadBalancer, LoadBalancerAlgorithm};
use crate::proxy::Backend;
use async_trait::async_trait;
use std::sync::Arc;

const MAX_CAS_ATTEMPTS: u32 = 3;

/// Argmin over `(current_connections, id)` with a bounded compare-and-set
/// retry loop, falling back to a plain increment for liveness under
/// pathological contention (spec §4.6).
pub struct LeastConnectionsBalancer;

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self
    }

    fn argmin<'a>(healthy: &'a [Arc<Backend>]) -> &'a Arc<Backend> {
        healthy
            .iter()
            .min_by(|a, b| {
                (a.current_connections(), a.id.as_str()).cmp(&(b.current_connections(), b.id.as_str()))
            })
            .expect("healthy is non-empty")
    }
}

impl Default for LeastConnectionsBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for LeastConnectionsBalancer {
    async fn select(
        &self,
        healthy: &[Arc<Backend>],
        _client_info: &str,
    ) -> Result<Arc<Backend>, LbError> {
        if healthy.is_empty() {
            return Err(LbError::NoHealthyBackend);
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let candidate = Self::argmin(healthy);
            let observed = candidate.current_connections();
            if candidate.try_increment_connections(observed) {
                return Ok(candidate.clone());
            }
            // Another thread incremented the same backend between our read
            // and the CAS; recompute the argmin and try again.
        }

        // Sacrifice strict minimality for liveness after exhausting retries.
        let candidate = Self::argmin(healthy).clone();
        candidate.increment_connections();
        tracing::warn!(backend = %candidate.id, "least-connections CAS retries exhausted, falling back");
        Ok(candidate)
    }

    fn name(&self) -> LoadBalancerAlgorithm {
        LoadBalancerAlgorithm::LeastConnections
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
    async fn picks_the_least_loaded_backend() {
        let backends = vec![backend("s1", 9001), backend("s2", 9002)];
        backends[0].increment_connections();
        backends[0].increment_connections();

        let lc = LeastConnectionsBalancer::new();
        let picked = lc.select(&backends, "").await.unwrap();
        assert_eq!(picked.id, "s2");
    }

    #[tokio::test]
    async fn ties_break_by_id() {
        let backends = vec![backend("s2", 9002), backend("s1", 9001)];
        let lc = LeastConnectionsBalancer::new();
        let picked = lc.select(&backends, "").await.unwrap();
        assert_eq!(picked.id, "s1");
    }

    #[tokio::test]
    async fn net_connection_change_is_zero_after_full_cycle() {
        let backends = vec![backend("s1", 9001), backend("s2", 9002)];
        let lc = LeastConnectionsBalancer::new();

        for _ in 0..40 {
            let picked = lc.select(&backends, "").await.unwrap();
            lc.record(&picked, 5, true).await;
        }

        for b in &backends {
            assert_eq!(b.current_connections(), 0);
        }
    }

    #[tokio::test]
    async fn fair_distribution_under_repeated_single_threaded_dispatch() {
        let backends = vec![backend("s1", 9001), backend("s2", 9002), backend("s3", 9003)];
        let lc = LeastConnectionsBalancer::new();
        let mut counts = [0usize; 3];

        for _ in 0..300 {
            let picked = lc.select(&backends, "").await.unwrap();
            let idx = backends.iter().position(|b| b.id == picked.id).unwrap();
            counts[idx] += 1;
            lc.record(&picked, 5, true).await;
        }

        for c in counts {
            assert_eq!(c, 100);
        }
    }
}
