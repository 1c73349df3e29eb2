// src/load_balancer/consistent_hashing.rs
use crate::load_balancer::algorithm::{LbError, LoadBalancer, LoadBalancerAlgorithm};
use crate::proxy::Backend;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

/// MD5-keyed hash ring with `virtual_nodes` phantom entries per backend,
/// published copy-on-write behind an `ArcSwap` so readers never block on a
/// rebuild (spec §4.9). `md5::compute` allocates a fresh digest context per
/// call, so there's no shared state to serialize threads on.
pub struct ConsistentHashingBalancer {
    ring: ArcSwap<BTreeMap<u64, Arc<Backend>>>,
    virtual_nodes: usize,
    rebuild_lock: Mutex<()>,
}

impl ConsistentHashingBalancer {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: ArcSwap::from_pointee(BTreeMap::new()),
            virtual_nodes: virtual_nodes.max(1),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// MD5 of `key`; the first 8 bytes read as big-endian, top bit cleared
    /// to normalize sign (spec §4.9 picks one convention and sticks to it).
    fn hash_key(key: &str) -> u64 {
        let digest = md5::compute(key.as_bytes());
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest.0[0..8]);
        u64::from_be_bytes(buf) & !(1u64 << 63)
    }

    fn build_ring(healthy: &[Arc<Backend>], virtual_nodes: usize) -> BTreeMap<u64, Arc<Backend>> {
        let mut ring = BTreeMap::new();
        for backend in healthy {
            for i in 0..virtual_nodes {
                let vnode_key = format!("{}#{}", backend.id, i);
                ring.insert(Self::hash_key(&vnode_key), backend.clone());
            }
        }
        ring
    }

    fn needs_rebuild(ring: &BTreeMap<u64, Arc<Backend>>, healthy: &[Arc<Backend>]) -> bool {
        let ring_ids: HashSet<&str> = ring.values().map(|b| b.id.as_str()).collect();
        let healthy_ids: HashSet<&str> = healthy.iter().map(|b| b.id.as_str()).collect();
        ring_ids != healthy_ids
    }

    /// Rebuilds are serialized with themselves via a `try_lock`: if another
    /// thread is already rebuilding, this call just uses the stale ring —
    /// the next `select` will retry the check.
    fn current_ring(&self, healthy: &[Arc<Backend>]) -> Arc<BTreeMap<u64, Arc<Backend>>> {
        let current = self.ring.load_full();
        if !Self::needs_rebuild(&current, healthy) {
            return current;
        }

        match self.rebuild_lock.try_lock() {
            Ok(_guard) => {
                let current = self.ring.load_full();
                if Self::needs_rebuild(&current, healthy) {
                    let fresh = Arc::new(Self::build_ring(healthy, self.virtual_nodes));
                    self.ring.store(fresh.clone());
                    tracing::info!(size = fresh.len(), "rebuilt consistent-hash ring");
                    fresh
                } else {
                    current
                }
            }
            Err(_) => current,
        }
    }

    fn lookup(ring: &BTreeMap<u64, Arc<Backend>>, hash: u64) -> Option<Arc<Backend>> {
        ring.range(hash..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, backend)| backend.clone())
    }

    /// Same ring lookup as `select` but without the connection-count side
    /// effect; used by tests and "where would X land?" queries (spec §4.9).
    pub fn predict_server(&self, healthy: &[Arc<Backend>], client_info: &str) -> Option<Arc<Backend>> {
        let ring = self.current_ring(healthy);
        Self::lookup(&ring, Self::hash_key(client_info))
    }

    pub fn ring_len(&self) -> usize {
        self.ring.load().len()
    }
}

impl Default for ConsistentHashingBalancer {
    fn default() -> Self {
        Self::new(150)
    }
}

#[async_trait]
impl LoadBalancer for ConsistentHashingBalancer {
    async fn select(
        &self,
        healthy: &[Arc<Backend>],
        client_info: &str,
    ) -> Result<Arc<Backend>, LbError> {
        if healthy.is_empty() {
            return Err(LbError::NoHealthyBackend);
        }

        let ring = self.current_ring(healthy);
        let backend = Self::lookup(&ring, Self::hash_key(client_info)).ok_or(LbError::NoHealthyBackend)?;
        backend.increment_connections();
        Ok(backend)
    }

    fn name(&self) -> LoadBalancerAlgorithm {
        LoadBalancerAlgorithm::ConsistentHashing
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
    async fn ring_size_is_exactly_virtual_nodes_times_backend_count() {
        let backends = vec![
            backend("s1", 9001),
            backend("s2", 9002),
            backend("s3", 9003),
            backend("s4", 9004),
        ];
        let ch = ConsistentHashingBalancer::new(150);
        ch.select(&backends, "anything").await.unwrap();
        assert_eq!(ch.ring_len(), 600);
    }

    #[tokio::test]
    async fn every_ring_entry_is_a_currently_healthy_backend() {
        let backends = vec![backend("s1", 9001), backend("s2", 9002)];
        let ch = ConsistentHashingBalancer::new(20);
        ch.select(&backends, "anything").await.unwrap();
        let ring = ch.ring.load_full();
        for backend in ring.values() {
            assert!(backends.iter().any(|b| b.id == backend.id));
        }
    }

    #[tokio::test]
    async fn unhealthy_backend_never_appears_in_selections() {
        let backends = vec![
            backend("s1", 9001),
            backend("s2", 9002),
            backend("s3", 9003),
        ];
        let healthy_only: Vec<Arc<Backend>> = backends
            .iter()
            .filter(|b| b.id != "s3")
            .cloned()
            .collect();
        let ch = ConsistentHashingBalancer::new(150);

        for client in 0..100 {
            let picked = ch
                .select(&healthy_only, &format!("client-{client}"))
                .await
                .unwrap();
            assert_ne!(picked.id, "s3");
        }
        assert_eq!(ch.ring_len(), 300);
    }

    #[tokio::test]
    async fn predict_server_matches_select_without_incrementing() {
        let backends = vec![backend("s1", 9001), backend("s2", 9002)];
        let ch = ConsistentHashingBalancer::new(150);
        let predicted = ch.predict_server(&backends, "client-a").unwrap();
        assert_eq!(backends[0].current_connections() + backends[1].current_connections(), 0);

        let selected = ch.select(&backends, "client-a").await.unwrap();
        assert_eq!(predicted.id, selected.id);
    }

    #[tokio::test]
    async fn adding_one_backend_remaps_a_bounded_fraction_of_clients() {
        let mut backends = vec![
            backend("s1", 9001),
            backend("s2", 9002),
            backend("s3", 9003),
            backend("s4", 9004),
        ];
        let ch = ConsistentHashingBalancer::new(150);
        let clients: Vec<String> = (0..20).map(|i| format!("client-{i}")).collect();

        let before: Vec<String> = clients
            .iter()
            .map(|c| ch.predict_server(&backends, c).unwrap().id)
            .collect();

        backends.push(backend("s5", 9005));
        let after: Vec<String> = clients
            .iter()
            .map(|c| ch.predict_server(&backends, c).unwrap().id)
            .collect();

        let changed = before.iter().zip(after.iter()).filter(|(a, b)| a != b).count();
        // ≤ |clients| / (N+1) with generous tolerance, per spec §8 scenario 6.
        assert!(changed as f64 <= clients.len() as f64 / 5.0 * 1.5);
    }
}
