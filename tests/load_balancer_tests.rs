// tests/load_balancer_tests.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use strata_lb::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use strata_lb::config::{BackendConfig, CircuitBreakerConfig, HealthCheckConfig};
use strata_lb::health::HealthChecker;
use strata_lb::load_balancer::{LoadBalancer, RoundRobinBalancer};
use strata_lb::proxy::BackendPool;
use url::Url;

fn backend_config(id: &str, port: u16) -> BackendConfig {
    BackendConfig {
        id: Some(id.to_string()),
        url: Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(),
        weight: 1,
    }
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let pool = BackendPool::new(
        &[
            backend_config("a", 9101),
            backend_config("b", 9102),
            backend_config("c", 9103),
        ],
        10,
    );
    for backend in pool.all() {
        backend.set_healthy(true);
    }
    pool.refresh_snapshot();
    let snapshot = pool.healthy_snapshot();

    let lb = RoundRobinBalancer::new();
    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..30 {
        let backend = lb.select(&snapshot, "").await.unwrap();
        *counts.entry(backend.id.clone()).or_insert(0) += 1;
        lb.record(&backend, 1, true).await;
    }

    assert_eq!(counts.len(), 3);
    for count in counts.values() {
        assert_eq!(*count, 10);
    }
}

#[tokio::test]
async fn test_circuit_breaker_opens_on_failures() {
    let config = CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout_ms: 30_000,
    };
    let breaker = CircuitBreaker::new(config);

    assert!(breaker.call_permitted().await);
    for _ in 0..3 {
        breaker.record_failure().await;
    }

    assert_eq!(breaker.get_state().await, CircuitBreakerState::Open);
    assert!(!breaker.call_permitted().await);
}

#[tokio::test]
async fn test_health_check_removes_unhealthy_backends() {
    let mut healthy_server = mockito::Server::new_async().await;
    let _healthy_mock = healthy_server
        .mock("GET", "/health")
        .with_status(200)
        .create_async()
        .await;

    let mut unhealthy_server = mockito::Server::new_async().await;
    let _unhealthy_mock = unhealthy_server
        .mock("GET", "/health")
        .with_status(500)
        .create_async()
        .await;

    let pool = Arc::new(BackendPool::new(
        &[
            BackendConfig {
                id: Some("healthy".to_string()),
                url: Url::parse(&healthy_server.url()).unwrap(),
                weight: 1,
            },
            BackendConfig {
                id: Some("unhealthy".to_string()),
                url: Url::parse(&unhealthy_server.url()).unwrap(),
                weight: 1,
            },
        ],
        10,
    ));

    let checker = Arc::new(HealthChecker::new(
        HealthCheckConfig {
            interval_ms: 10,
            timeout_ms: 200,
            path: "/health".to_string(),
            healthy_threshold: 1,
            unhealthy_threshold: 1,
        },
        pool.clone(),
    ));

    let handle = tokio::spawn(checker.clone().start());
    tokio::time::sleep(Duration::from_millis(100)).await;
    checker.shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("health checker should stop promptly after shutdown")
        .unwrap();

    let snapshot = pool.healthy_snapshot();
    let ids: Vec<&str> = snapshot.iter().map(|b| b.id.as_str()).collect();
    assert!(ids.contains(&"healthy"));
    assert!(!ids.contains(&"unhealthy"));
}
