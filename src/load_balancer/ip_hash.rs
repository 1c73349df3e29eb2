// src/load_balancer/ip_hash.rs
use crate::load_balancer::algorithm::{LbError, LoadBalancer, LoadBalancerAlgorithm};
use crate::proxy::Backend;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Sticky IP→backend cache with a check-then-select that's atomic per key
/// (spec §4.8): a client whose cached backend is still healthy always lands
/// back on it; otherwise a fresh index is computed and cached.
pub struct IpHashBalancer {
    cache: DashMap<String, String>,
}

impl IpHashBalancer {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// Dotted-quad if `client_info` already parses as one; a synthetic
    /// dotted-quad derived from a non-cryptographic hash otherwise. Blank
    /// input maps to `127.0.0.1` (spec §4.8).
    fn normalize(client_info: &str) -> String {
        let trimmed = client_info.trim();
        if trimmed.is_empty() {
            return "127.0.0.1".to_string();
        }
        Self::parse_dotted_quad(trimmed).unwrap_or_else(|| Self::synthesize_ip(trimmed))
    }

    fn parse_dotted_quad(s: &str) -> Option<String> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return None;
        }
        let mut octets = [0u8; 4];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let n: u32 = part.parse().ok()?;
            if n > 255 {
                return None;
            }
            octets[i] = n as u8;
        }
        Some(format!(
            "{}.{}.{}.{}",
            octets[0], octets[1], octets[2], octets[3]
        ))
    }

    /// Reproduces the source's quirky `(|byte| mod 255) + 1` octet mapping
    /// (spec §9 Open Questions) so synthetic IPs stay hash-compatible.
    fn synthesize_ip(s: &str) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        s.hash(&mut hasher);
        let bytes = (hasher.finish() as u32).to_be_bytes();
        let octets: Vec<u32> = bytes.iter().map(|b| (*b as u32 % 255) + 1).collect();
        format!(
            "{}.{}.{}.{}",
            octets[0], octets[1], octets[2], octets[3]
        )
    }

    /// `Σ octet_i * 256^(3-i)`: the dotted quad read as a big-endian u32.
    fn hash_ip(ip: &str) -> u64 {
        ip.split('.')
            .filter_map(|p| p.parse::<u64>().ok())
            .fold(0u64, |acc, octet| (acc << 8) | octet)
    }

    fn resolve_index(healthy: &[Arc<Backend>], ip: &str) -> usize {
        (Self::hash_ip(ip) as usize) % healthy.len()
    }
}

impl Default for IpHashBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for IpHashBalancer {
    async fn select(
        &self,
        healthy: &[Arc<Backend>],
        client_info: &str,
    ) -> Result<Arc<Backend>, LbError> {
        if healthy.is_empty() {
            return Err(LbError::NoHealthyBackend);
        }

        let ip = Self::normalize(client_info);

        let resolved_id = match self.cache.entry(ip.clone()) {
            Entry::Occupied(mut occupied) => {
                let cached = occupied.get().clone();
                if healthy.iter().any(|b| b.id == cached) {
                    cached
                } else {
                    let fresh = healthy[Self::resolve_index(healthy, &ip)].id.clone();
                    occupied.insert(fresh.clone());
                    fresh
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = healthy[Self::resolve_index(healthy, &ip)].id.clone();
                vacant.insert(fresh.clone());
                fresh
            }
        };

        let backend = match healthy.iter().find(|b| b.id == resolved_id) {
            Some(backend) => backend.clone(),
            None => {
                // Topology raced between cache resolution and lookup.
                tracing::warn!(
                    client_ip = %ip,
                    backend = %resolved_id,
                    "ip-hash cache entry raced with topology change, falling back"
                );
                self.cache.insert(ip, healthy[0].id.clone());
                healthy[0].clone()
            }
        };

        backend.increment_connections();
        Ok(backend)
    }

    fn on_remove(&self, backend: &Arc<Backend>) {
        self.cache.retain(|_, v| v != &backend.id);
    }

    fn name(&self) -> LoadBalancerAlgorithm {
        LoadBalancerAlgorithm::IpHash
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
    async fn same_client_always_lands_on_same_backend() {
        let backends = vec![backend("s1", 9001), backend("s2", 9002), backend("s3", 9003)];
        let ip_hash = IpHashBalancer::new();

        let first = ip_hash.select(&backends, "192.168.1.100").await.unwrap();
        for _ in 0..9 {
            let again = ip_hash.select(&backends, "192.168.1.100").await.unwrap();
            assert_eq!(again.id, first.id);
            ip_hash.record(&again, 5, true).await;
        }
        assert_eq!(ip_hash.cache.len(), 1);
    }

    #[tokio::test]
    async fn blank_client_info_maps_to_loopback_default() {
        let backends = vec![backend("s1", 9001)];
        let ip_hash = IpHashBalancer::new();
        let picked = ip_hash.select(&backends, "   ").await.unwrap();
        assert_eq!(picked.id, "s1");
    }

    #[tokio::test]
    async fn on_remove_purges_cache_entries_for_that_backend() {
        let backends = vec![backend("s1", 9001)];
        let ip_hash = IpHashBalancer::new();
        ip_hash.select(&backends, "10.0.0.1").await.unwrap();
        assert_eq!(ip_hash.cache.len(), 1);

        ip_hash.on_remove(&backends[0]);
        assert_eq!(ip_hash.cache.len(), 0);
    }

    #[tokio::test]
    async fn falls_back_to_first_healthy_when_cached_backend_is_gone() {
        let backends = vec![backend("s1", 9001), backend("s2", 9002)];
        let ip_hash = IpHashBalancer::new();
        let first = ip_hash.select(&backends, "203.0.113.5").await.unwrap();

        // Simulate the cached backend being removed from the snapshot.
        let remaining: Vec<Arc<Backend>> = backends
            .iter()
            .filter(|b| b.id != first.id)
            .cloned()
            .collect();
        if !remaining.is_empty() {
            let picked = ip_hash.select(&remaining, "203.0.113.5").await.unwrap();
            assert!(remaining.iter().any(|b| b.id == picked.id));
        }
    }
}
