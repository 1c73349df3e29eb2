// src/load_balancer/mod.rs
pub mod algorithm;
mod consistent_hashing;
mod ip_hash;
mod least_connections;
mod least_response_time;
mod round_robin;
mod weighted_round_robin;

pub use algorithm::{LbError, LoadBalancer, LoadBalancerAlgorithm};
pub use consistent_hashing::ConsistentHashingBalancer;
pub use ip_hash::IpHashBalancer;
pub use least_connections::LeastConnectionsBalancer;
pub use least_response_time::LeastResponseTimeBalancer;
pub use round_robin::RoundRobinBalancer;
pub use weighted_round_robin::WeightedRoundRobinBalancer;

use crate::proxy::Backend;
use std::collections::HashMap;
use std::sync::Arc;

pub fn create_load_balancer(
    algorithm: LoadBalancerAlgorithm,
    virtual_nodes_per_backend: usize,
    ewma_alpha: f64,
) -> Arc<dyn LoadBalancer> {
    match algorithm {
        LoadBalancerAlgorithm::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LoadBalancerAlgorithm::WeightedRoundRobin => Arc::new(WeightedRoundRobinBalancer::new()),
        LoadBalancerAlgorithm::LeastConnections => Arc::new(LeastConnectionsBalancer::new()),
        LoadBalancerAlgorithm::LeastResponseTime => {
            Arc::new(LeastResponseTimeBalancer::new(ewma_alpha))
        }
        LoadBalancerAlgorithm::IpHash => Arc::new(IpHashBalancer::new()),
        LoadBalancerAlgorithm::ConsistentHashing => {
            Arc::new(ConsistentHashingBalancer::new(virtual_nodes_per_backend))
        }
    }
}

/// Holds one live instance of every strategy so the dispatcher can pick an
/// algorithm per request (spec §6: "fixed at startup or chosen via a query
/// parameter") while every strategy still observes the same topology
/// changes, regardless of which one is currently selected.
pub struct StrategyRegistry {
    strategies: HashMap<LoadBalancerAlgorithm, Arc<dyn LoadBalancer>>,
    default_algorithm: LoadBalancerAlgorithm,
}

impl StrategyRegistry {
    pub fn new(
        default_algorithm: LoadBalancerAlgorithm,
        virtual_nodes_per_backend: usize,
        ewma_alpha: f64,
    ) -> Self {
        let strategies = LoadBalancerAlgorithm::ALL
            .into_iter()
            .map(|algo| {
                (
                    algo,
                    create_load_balancer(algo, virtual_nodes_per_backend, ewma_alpha),
                )
            })
            .collect();

        Self {
            strategies,
            default_algorithm,
        }
    }

    pub fn default_algorithm(&self) -> LoadBalancerAlgorithm {
        self.default_algorithm
    }

    pub fn get(&self, algorithm: LoadBalancerAlgorithm) -> Arc<dyn LoadBalancer> {
        self.strategies
            .get(&algorithm)
            .expect("every LoadBalancerAlgorithm variant has a registered strategy")
            .clone()
    }

    pub fn init_all(&self, initial: &[Arc<Backend>]) {
        for strategy in self.strategies.values() {
            strategy.on_init(initial);
        }
    }

    pub fn notify_add(&self, backend: &Arc<Backend>) {
        for strategy in self.strategies.values() {
            strategy.on_add(backend);
        }
    }

    pub fn notify_remove(&self, backend: &Arc<Backend>) {
        for strategy in self.strategies.values() {
            strategy.on_remove(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_holds_one_instance_per_algorithm() {
        let registry = StrategyRegistry::new(LoadBalancerAlgorithm::RoundRobin, 150, 0.3);
        for algo in LoadBalancerAlgorithm::ALL {
            assert_eq!(registry.get(algo).name(), algo);
        }
    }
}
