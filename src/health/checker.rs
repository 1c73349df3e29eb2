// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::proxy::{Backend, BackendPool};
use reqwest::Client;
use std::sync::Arc;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

/// Periodic probe loop over every registered backend (spec §4.11). This is
/// the canonical 5s blocking variant per spec §9: probes run synchronously
/// per sweep, in parallel across backends, and the health flag flip is the
/// only signal strategies need — they detect and rebuild lazily on their
/// next `select`.
pub struct HealthChecker {
    config: HealthCheckConfig,
    pool: Arc<BackendPool>,
    client: Client,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub backend_id: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, pool: Arc<BackendPool>) -> Self {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .expect("failed to build health-check HTTP client");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Self {
            config,
            pool,
            client,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub async fn start(self: Arc<Self>) {
        let mut tick = interval(self.config.interval());
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(interval = ?self.config.interval(), "starting health checker");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.check_all_backends().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn check_all_backends(&self) {
        let backends = self.pool.all();
        let mut tasks = Vec::with_capacity(backends.len());

        for backend in backends {
            let ctx = self.probe_context();
            tasks.push(tokio::spawn(async move { ctx.probe(backend).await }));
        }

        let results = futures::future::join_all(tasks).await;

        let mut healthy_count = 0;
        let mut unhealthy_count = 0;
        for result in results {
            match result {
                Ok(check) => {
                    if check.healthy {
                        healthy_count += 1;
                        debug!(backend = %check.backend_id, "backend healthy");
                    } else {
                        unhealthy_count += 1;
                        warn!(backend = %check.backend_id, error = ?check.error, "backend unhealthy");
                    }
                }
                Err(e) => {
                    error!(error = %e, "health probe task panicked");
                    unhealthy_count += 1;
                }
            }
        }

        self.pool.refresh_snapshot();
        info!(healthy_count, unhealthy_count, "health check sweep complete");
    }

    fn probe_context(&self) -> ProbeContext {
        ProbeContext {
            client: self.client.clone(),
            path: self.config.path.clone(),
            timeout: self.config.timeout(),
            healthy_threshold: self.config.healthy_threshold,
            unhealthy_threshold: self.config.unhealthy_threshold,
        }
    }
}

/// Cheaply-cloneable bundle of what a single probe needs, so each spawned
/// task doesn't have to hold an `Arc<HealthChecker>`.
struct ProbeContext {
    client: Client,
    path: String,
    timeout: std::time::Duration,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl ProbeContext {
    async fn probe(&self, backend: Arc<Backend>) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let url = match backend.url.join(&self.path) {
            Ok(url) => url,
            Err(e) => {
                backend.set_healthy(false);
                return HealthCheckResult {
                    backend_id: backend.id.clone(),
                    healthy: false,
                    response_time_ms: 0,
                    error: Some(e.to_string()),
                };
            }
        };

        let result = timeout(self.timeout, self.client.get(url).send()).await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let (healthy, error) = match result {
            Ok(Ok(response)) if response.status().is_success() => (true, None),
            Ok(Ok(response)) => (false, Some(format!("HTTP {}", response.status()))),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("health probe timed out".to_string())),
        };

        backend.set_healthy(healthy);
        self.log_threshold_crossing(&backend, healthy);

        HealthCheckResult {
            backend_id: backend.id.clone(),
            healthy,
            response_time_ms,
            error,
        }
    }

    fn log_threshold_crossing(&self, backend: &Backend, healthy: bool) {
        if healthy && backend.consecutive_successes() == self.healthy_threshold {
            info!(backend = %backend.id, "backend reached healthy threshold");
        } else if !healthy && backend.consecutive_failures() == self.unhealthy_threshold {
            warn!(backend = %backend.id, "backend reached unhealthy threshold");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use url::Url;

    fn pool(port: u16) -> Arc<BackendPool> {
        Arc::new(BackendPool::new(
            &[BackendConfig {
                id: Some("s1".to_string()),
                url: Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(),
                weight: 1,
            }],
            10,
        ))
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let checker = Arc::new(HealthChecker::new(
            HealthCheckConfig {
                interval_ms: 5,
                ..Default::default()
            },
            pool(19999),
        ));
        let handle = tokio::spawn(checker.clone().start());
        checker.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("health checker task should exit promptly after shutdown")
            .unwrap();
    }
}
