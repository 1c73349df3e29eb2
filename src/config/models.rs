// src/config/models.rs
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Top-level configuration, loaded from `config.yaml` / `config.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub default_algorithm: LoadBalancerAlgorithm,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_virtual_nodes_per_backend")]
    pub virtual_nodes_per_backend: usize,

    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,

    #[serde(default = "default_latency_window_size")]
    pub latency_window_size: usize,

    #[serde(default)]
    pub listen_addr: ListenAddr,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Cross-field sanity checks beyond what serde/defaults can express.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(anyhow!("`backends` must contain at least one entry"));
        }

        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            let id = backend.resolved_id();
            if !seen.insert(id.clone()) {
                return Err(anyhow!("duplicate backend id: {id}"));
            }
        }

        if !(0.0..=1.0).contains(&self.ewma_alpha) {
            return Err(anyhow!(
                "ewma_alpha must be in [0.0, 1.0], got {}",
                self.ewma_alpha
            ));
        }

        if self.latency_window_size == 0 {
            return Err(anyhow!("latency_window_size must be positive"));
        }

        if self.virtual_nodes_per_backend == 0 {
            return Err(anyhow!("virtual_nodes_per_backend must be positive"));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_virtual_nodes_per_backend() -> usize {
    150
}

fn default_ewma_alpha() -> f64 {
    0.3
}

fn default_latency_window_size() -> usize {
    10
}

/// Wraps the bind address so it gets a sensible serde default without
/// forcing every config file to spell out `"0.0.0.0:8080"`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ListenAddr(pub String);

impl Default for ListenAddr {
    fn default() -> Self {
        Self("0.0.0.0:8080".to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub url: Url,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl BackendConfig {
    /// Falls back to `host:port` when no explicit id is configured, mirroring
    /// the identity scheme `Backend::new` derives at runtime.
    pub fn resolved_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            format!(
                "{}:{}",
                self.url.host_str().unwrap_or("unknown"),
                self.url.port_or_known_default().unwrap_or(80)
            )
        })
    }

    /// A configured weight of zero or less is floored to 1 (spec §3).
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1)
    }
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            path: default_health_path(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

fn default_health_interval_ms() -> u64 {
    5_000
}

fn default_health_timeout_ms() -> u64 {
    3_000
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_healthy_threshold() -> u32 {
    1
}

fn default_unhealthy_threshold() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_cb_timeout_ms")]
    pub timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_cb_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_cb_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    50
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// The six selection strategies named in the public `algorithm` query
/// parameter. Unknown values are rejected with [`UnknownAlgorithmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalancerAlgorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    IpHash,
    ConsistentHashing,
}

impl Default for LoadBalancerAlgorithm {
    fn default() -> Self {
        LoadBalancerAlgorithm::RoundRobin
    }
}

impl LoadBalancerAlgorithm {
    pub const ALL: [LoadBalancerAlgorithm; 6] = [
        LoadBalancerAlgorithm::RoundRobin,
        LoadBalancerAlgorithm::WeightedRoundRobin,
        LoadBalancerAlgorithm::LeastConnections,
        LoadBalancerAlgorithm::LeastResponseTime,
        LoadBalancerAlgorithm::IpHash,
        LoadBalancerAlgorithm::ConsistentHashing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerAlgorithm::RoundRobin => "roundRobin",
            LoadBalancerAlgorithm::WeightedRoundRobin => "weightedRoundRobin",
            LoadBalancerAlgorithm::LeastConnections => "leastConnections",
            LoadBalancerAlgorithm::LeastResponseTime => "leastResponseTime",
            LoadBalancerAlgorithm::IpHash => "ipHash",
            LoadBalancerAlgorithm::ConsistentHashing => "consistentHashing",
        }
    }
}

impl fmt::Display for LoadBalancerAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a client requests an `algorithm` query value that
/// doesn't name one of the six known strategies (spec §7 `UnknownAlgorithm`).
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown load balancing algorithm: {0}")]
pub struct UnknownAlgorithmError(pub String);

impl FromStr for LoadBalancerAlgorithm {
    type Err = UnknownAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "roundRobin" => Ok(LoadBalancerAlgorithm::RoundRobin),
            "weightedRoundRobin" => Ok(LoadBalancerAlgorithm::WeightedRoundRobin),
            "leastConnections" => Ok(LoadBalancerAlgorithm::LeastConnections),
            "leastResponseTime" => Ok(LoadBalancerAlgorithm::LeastResponseTime),
            "ipHash" => Ok(LoadBalancerAlgorithm::IpHash),
            "consistentHashing" => Ok(LoadBalancerAlgorithm::ConsistentHashing),
            other => Err(UnknownAlgorithmError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_round_trips_through_its_query_string_form() {
        for algo in LoadBalancerAlgorithm::ALL {
            assert_eq!(algo.as_str().parse::<LoadBalancerAlgorithm>().unwrap(), algo);
        }
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!("fastest".parse::<LoadBalancerAlgorithm>().is_err());
    }

    #[test]
    fn empty_backend_list_fails_validation() {
        let config = Config {
            backends: vec![],
            default_algorithm: LoadBalancerAlgorithm::RoundRobin,
            request_timeout_ms: 10_000,
            virtual_nodes_per_backend: 150,
            ewma_alpha: 0.3,
            latency_window_size: 10,
            listen_addr: ListenAddr::default(),
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            metrics: MetricsConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
