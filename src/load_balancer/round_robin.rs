// src/load_balancer/round_robin.rs
use crate::load_balancer::algorithm::{LbError, LoadBalancer, LoadBalancerAlgorithm};
use crate::proxy::Backend;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// `i = counter.fetch_add(1) mod N`; the counter may drift arbitrarily far
/// past `N` over the process lifetime but wraps harmlessly since the
/// modulo is applied immediately on every read (spec §4.4).
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    async fn select(
        &self,
        healthy: &[Arc<Backend>],
        _client_info: &str,
    ) -> Result<Arc<Backend>, LbError> {
        if healthy.is_empty() {
            return Err(LbError::NoHealthyBackend);
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        let backend = healthy[index].clone();
        backend.increment_connections();
        Ok(backend)
    }

    fn name(&self) -> LoadBalancerAlgorithm {
        LoadBalancerAlgorithm::RoundRobin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn healthy_backends(n: usize) -> Vec<Arc<Backend>> {
        (0..n)
            .map(|i| {
                let b = Backend::new(
                    format!("s{i}"),
                    Url::parse(&format!("http://127.0.0.1:900{i}")).unwrap(),
                    1,
                    10,
                );
                b.set_healthy(true);
                Arc::new(b)
            })
            .collect()
    }

    #[tokio::test]
    async fn distributes_exactly_k_times_each_over_k_times_n_requests() {
        let backends = healthy_backends(4);
        let rr = RoundRobinBalancer::new();
        let mut counts = vec![0usize; 4];

        for _ in 0..3 {
            for i in 0..4 {
                let picked = rr.select(&backends, "").await.unwrap();
                assert_eq!(picked.id, backends[i].id);
                let idx = backends.iter().position(|b| b.id == picked.id).unwrap();
                counts[idx] += 1;
                rr.record(&picked, 5, true).await;
            }
        }

        assert_eq!(counts, vec![3, 3, 3, 3]);
    }

    #[tokio::test]
    async fn empty_snapshot_errors() {
        let rr = RoundRobinBalancer::new();
        assert!(matches!(
            rr.select(&[], "").await,
            Err(LbError::NoHealthyBackend)
        ));
    }
}
