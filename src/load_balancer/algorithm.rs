// src/load_balancer/algorithm.rs
use crate::proxy::Backend;
use async_trait::async_trait;
use std::sync::Arc;

pub use crate::config::LoadBalancerAlgorithm;

/// Errors a strategy can raise while selecting a backend (spec §7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LbError {
    #[error("no healthy backend available")]
    NoHealthyBackend,
}

/// The capability set every selection strategy implements (spec §4.3):
/// `select` + `record` plus optional topology lifecycle hooks.
///
/// `select` must have incremented the chosen backend's connection count by
/// the time it returns successfully; `record` always decrements it again,
/// on every exit path (success, failure, or error), which is the single
/// invariant that keeps `current_connections` accurate end to end.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    async fn select(
        &self,
        healthy: &[Arc<Backend>],
        client_info: &str,
    ) -> Result<Arc<Backend>, LbError>;

    /// Default behavior covers every strategy except Least-Response-Time,
    /// which layers an EWMA update on top of the same decrement-then-record
    /// shape.
    async fn record(&self, backend: &Arc<Backend>, latency_ms: u64, success: bool) {
        backend.decrement_connections();
        if success {
            backend.record_latency(latency_ms);
        }
    }

    fn on_init(&self, _initial: &[Arc<Backend>]) {}
    fn on_add(&self, _backend: &Arc<Backend>) {}
    fn on_remove(&self, _backend: &Arc<Backend>) {}

    fn name(&self) -> LoadBalancerAlgorithm;
}
