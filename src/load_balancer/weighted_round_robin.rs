// src/load_balancer/weighted_round_robin.rs
use crate::load_balancer::algorithm::{LbError, LoadBalancer, LoadBalancerAlgorithm};
use crate::proxy::Backend;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Maintains an immutable expansion list (each backend repeated
/// `max(1, weight)` times) behind a copy-on-write `ArcSwap`, so a rebuild
/// never blocks a concurrent reader mid-select (spec §4.5).
pub struct WeightedRoundRobinBalancer {
    expansion: ArcSwap<Vec<Arc<Backend>>>,
    index: AtomicUsize,
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            expansion: ArcSwap::from_pointee(Vec::new()),
            index: AtomicUsize::new(0),
        }
    }

    fn build_expansion(healthy: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
        let mut expansion = Vec::new();
        for backend in healthy {
            for _ in 0..backend.weight.max(1) {
                expansion.push(backend.clone());
            }
        }
        expansion
    }

    /// The expansion's member set differs from the healthy snapshot's set
    /// by id whenever topology or health has shifted since the last build.
    fn needs_rebuild(expansion: &[Arc<Backend>], healthy: &[Arc<Backend>]) -> bool {
        let expansion_ids: HashSet<&str> = expansion.iter().map(|b| b.id.as_str()).collect();
        let healthy_ids: HashSet<&str> = healthy.iter().map(|b| b.id.as_str()).collect();
        expansion_ids != healthy_ids
    }

    fn rebuild(&self, healthy: &[Arc<Backend>]) -> Arc<Vec<Arc<Backend>>> {
        let fresh = Arc::new(Self::build_expansion(healthy));
        self.index.store(0, Ordering::SeqCst);
        self.expansion.store(fresh.clone());
        tracing::info!(len = fresh.len(), "rebuilt weighted round-robin expansion list");
        fresh
    }
}

impl Default for WeightedRoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for WeightedRoundRobinBalancer {
    async fn select(
        &self,
        healthy: &[Arc<Backend>],
        _client_info: &str,
    ) -> Result<Arc<Backend>, LbError> {
        if healthy.is_empty() {
            return Err(LbError::NoHealthyBackend);
        }

        let mut expansion = self.expansion.load_full();
        if Self::needs_rebuild(&expansion, healthy) {
            expansion = self.rebuild(healthy);
        }
        if expansion.is_empty() {
            // Can happen only if every backend somehow carries weight 0 and
            // build_expansion produced nothing; defensive, shouldn't occur
            // since Backend::new floors weight to 1.
            return Err(LbError::NoHealthyBackend);
        }

        let idx = self.index.fetch_add(1, Ordering::Relaxed) % expansion.len();
        let backend = expansion[idx].clone();
        backend.increment_connections();
        Ok(backend)
    }

    fn on_add(&self, _backend: &Arc<Backend>) {
        // Rebuild is detected lazily on the next select via set-equality.
    }

    fn on_remove(&self, _backend: &Arc<Backend>) {
        // Same: lazy rebuild on next select.
    }

    fn name(&self) -> LoadBalancerAlgorithm {
        LoadBalancerAlgorithm::WeightedRoundRobin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn weighted_backend(id: &str, port: u16, weight: u32) -> Arc<Backend> {
        let b = Backend::new(id, Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(), weight, 10);
        b.set_healthy(true);
        Arc::new(b)
    }

    #[tokio::test]
    async fn expansion_length_matches_weight_sum() {
        let backends = vec![
            weighted_backend("s1", 9001, 4),
            weighted_backend("s2", 9002, 3),
            weighted_backend("s3", 9003, 2),
            weighted_backend("s4", 9004, 1),
        ];
        let wrr = WeightedRoundRobinBalancer::new();
        wrr.select(&backends, "").await.unwrap();
        assert_eq!(wrr.expansion.load().len(), 10);
    }

    #[tokio::test]
    async fn ratios_match_weights_within_tolerance() {
        let backends = vec![
            weighted_backend("s1", 9001, 4),
            weighted_backend("s2", 9002, 3),
            weighted_backend("s3", 9003, 2),
            weighted_backend("s4", 9004, 1),
        ];
        let wrr = WeightedRoundRobinBalancer::new();
        let mut counts = [0usize; 4];

        for _ in 0..100 {
            let picked = wrr.select(&backends, "").await.unwrap();
            let idx = backends.iter().position(|b| b.id == picked.id).unwrap();
            counts[idx] += 1;
            wrr.record(&picked, 5, true).await;
        }

        let expected = [40, 30, 20, 10];
        for (got, want) in counts.iter().zip(expected.iter()) {
            assert!((*got as i64 - *want as i64).abs() <= 5, "counts={:?}", counts);
        }
    }

    #[tokio::test]
    async fn zero_weight_backend_is_still_selectable() {
        let backends = vec![weighted_backend("s1", 9001, 0), weighted_backend("s2", 9002, 1)];
        let wrr = WeightedRoundRobinBalancer::new();
        let mut seen = HashSet::new();
        for _ in 0..4 {
            let picked = wrr.select(&backends, "").await.unwrap();
            seen.insert(picked.id.clone());
            wrr.record(&picked, 5, true).await;
        }
        assert!(seen.contains("s1"));
    }
}
