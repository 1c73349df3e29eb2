//
// src/proxy/pool.rs
//
// The registry: owns the backend set and publishes an immutable healthy
// snapshot that's safe to iterate while `add`/`remove` run concurrently.
//
use super::backend::Backend;
use crate::config::BackendConfig;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;
use url::Url;

#[derive(Clone)]
pub struct BackendPool {
    backends: Arc<DashMap<String, Arc<Backend>>>,
    healthy: Arc<ArcSwap<Vec<Arc<Backend>>>>,
    latency_window_size: usize,
}

impl BackendPool {
    pub fn new(configs: &[BackendConfig], latency_window_size: usize) -> Self {
        let backends = Arc::new(DashMap::new());

        for config in configs {
            let id = config.resolved_id();
            let backend = Arc::new(Backend::new(
                id.clone(),
                config.url.clone(),
                config.effective_weight(),
                latency_window_size,
            ));
            backends.insert(id, backend);
        }

        Self {
            backends,
            healthy: Arc::new(ArcSwap::from_pointee(Vec::new())),
            latency_window_size,
        }
    }

    /// An immutable, O(N)-constructed sequence of currently-healthy backends
    /// (spec §3 "Healthy snapshot"). Cheap to call repeatedly: it's an
    /// `Arc` clone of the last structure published by `refresh_snapshot`.
    pub fn healthy_snapshot(&self) -> Arc<Vec<Arc<Backend>>> {
        self.healthy.load_full()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.get(id).map(|b| b.clone())
    }

    pub fn all(&self) -> Vec<Arc<Backend>> {
        self.backends.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Rebuilds the healthy snapshot from the current state of every
    /// backend's health flag. Called by the health supervisor after each
    /// probe sweep; cheap copy-on-write swap, never blocks readers.
    pub fn refresh_snapshot(&self) {
        let healthy: Vec<Arc<Backend>> = self
            .backends
            .iter()
            .filter(|entry| entry.value().is_healthy())
            .map(|entry| entry.value().clone())
            .collect();

        let healthy_count = healthy.len();
        let total = self.backends.len();
        self.healthy.store(Arc::new(healthy));

        tracing::debug!(healthy = healthy_count, total, "refreshed healthy snapshot");
    }

    /// Registers a new backend, initially unhealthy until the next probe
    /// succeeds. Returns the new backend so callers (the dispatcher) can
    /// fan the add-event out to every strategy.
    pub fn add_backend(&self, id: String, url: Url, weight: u32) -> Arc<Backend> {
        let backend = Arc::new(Backend::new(id.clone(), url, weight, self.latency_window_size));
        self.backends.insert(id.clone(), backend.clone());
        tracing::info!(backend = %id, "added backend");
        backend
    }

    /// Removes a backend from the registry and the published healthy
    /// snapshot. Returns the removed backend (if it existed) so callers can
    /// fan the remove-event out to every strategy's `on_remove` hook.
    pub fn remove_backend(&self, id: &str) -> Option<Arc<Backend>> {
        let removed = self.backends.remove(id).map(|(_, backend)| backend);
        if removed.is_some() {
            self.refresh_snapshot();
            tracing::info!(backend = %id, "removed backend");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(id: &str, port: u16) -> BackendConfig {
        BackendConfig {
            id: Some(id.to_string()),
            url: Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(),
            weight: 1,
        }
    }

    #[test]
    fn snapshot_excludes_unhealthy_backends() {
        let pool = BackendPool::new(&[cfg("a", 9001), cfg("b", 9002)], 10);
        pool.get("a").unwrap().set_healthy(true);
        pool.refresh_snapshot();

        let snap = pool.healthy_snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, "a");
    }

    #[test]
    fn remove_backend_drops_it_from_snapshot() {
        let pool = BackendPool::new(&[cfg("a", 9001), cfg("b", 9002)], 10);
        for b in pool.all() {
            b.set_healthy(true);
        }
        pool.refresh_snapshot();
        assert_eq!(pool.healthy_snapshot().len(), 2);

        pool.remove_backend("a");
        assert_eq!(pool.healthy_snapshot().len(), 1);
        assert!(pool.get("a").is_none());
    }
}
