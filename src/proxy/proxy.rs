// ────────────────────────────────
// src/proxy/proxy.rs
// Dispatcher: select a backend, forward the request, record the outcome.
// ────────────────────────────────

use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::{Config, LoadBalancerAlgorithm, UnknownAlgorithmError};
use crate::health::HealthChecker;
use crate::load_balancer::{LbError, StrategyRegistry};
use crate::metrics::{MetricsCollector, Timer};
use crate::proxy::{Backend, BackendPool};
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HOST};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

/// One request body is forwarded at a time and it's capped at 1 MiB so a
/// slow or hostile client can't force the dispatcher to buffer without
/// bound (spec §1 Non-goals: no streaming beyond a single pass-through body).
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Backend TCP connect timeout. The overall per-request deadline is
/// `Config::request_timeout` (default 10s); this bounds how long we wait
/// just to open the socket.
const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Proxy {
    config: Config,
    pool: Arc<BackendPool>,
    registry: StrategyRegistry,
    metrics: Arc<MetricsCollector>,
    circuit_breakers: CircuitBreakerManager,
    client: Client<HttpConnector>,
    health_checker: Arc<HealthChecker>,
}

impl Proxy {
    pub fn new(config: Config, pool: Arc<BackendPool>, metrics: Arc<MetricsCollector>) -> Self {
        let registry = StrategyRegistry::new(
            config.default_algorithm,
            config.virtual_nodes_per_backend,
            config.ewma_alpha,
        );
        registry.init_all(&pool.all());

        let circuit_breakers = CircuitBreakerManager::new(config.circuit_breaker.clone());
        let health_checker = Arc::new(HealthChecker::new(config.health_check.clone(), pool.clone()));

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(BACKEND_CONNECT_TIMEOUT));
        connector.enforce_http(true);
        let client = Client::builder().build(connector);

        Self {
            config,
            pool,
            registry,
            metrics,
            circuit_breakers,
            client,
            health_checker,
        }
    }

    /// Spawns the periodic health-probe loop. Safe to call once, after the
    /// `Proxy` has been wrapped in an `Arc`.
    pub fn start_health_checker(self: &Arc<Self>) {
        let checker = self.health_checker.clone();
        tokio::spawn(checker.start());
    }

    /// Signals the health checker to stop its periodic sweep.
    pub fn shutdown(&self) {
        self.health_checker.shutdown();
    }

    /// Registers a backend and notifies every strategy, so a later `select`
    /// call (regardless of which algorithm is active) sees it immediately.
    pub fn add_backend(&self, id: String, url: Url, weight: u32) {
        let backend = self.pool.add_backend(id, url, weight);
        self.pool.refresh_snapshot();
        self.registry.notify_add(&backend);
    }

    pub fn remove_backend(&self, id: &str) {
        if let Some(backend) = self.pool.remove_backend(id) {
            self.circuit_breakers.remove(id);
            self.registry.notify_remove(&backend);
        }
    }

    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let timer = Timer::new();
        let method = req.method().clone();
        let peer = req
            .extensions()
            .get::<crate::server::ConnectInfo>()
            .copied()
            .map(|c| c.0)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        let algorithm = self.resolve_algorithm(req.uri().query())?;
        let client_info = extract_client_info(req.headers(), peer);

        let snapshot = self.pool.healthy_snapshot();
        if snapshot.is_empty() {
            warn!("rejecting request: healthy snapshot is empty");
            return Err(ProxyError::NoHealthyBackend);
        }

        let eligible = self.breaker_eligible(&snapshot).await;
        if eligible.is_empty() {
            warn!("rejecting request: every healthy backend has an open circuit breaker");
            return Err(ProxyError::NoHealthyBackend);
        }

        let strategy = self.registry.get(algorithm);
        let backend = strategy.select(&eligible, &client_info).await?;
        self.metrics.record_selection(algorithm.as_str(), &backend.id);

        let (parts, body) = req.into_parts();
        let body_bytes = match read_capped_body(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(err) => {
                strategy.record(&backend, 0, false).await;
                return Err(err);
            }
        };

        let outbound = match build_outbound_request(
            &backend.url,
            &parts.method,
            &parts.uri,
            &parts.headers,
            peer,
            body_bytes,
        ) {
            Ok(req) => req,
            Err(err) => {
                strategy.record(&backend, 0, false).await;
                return Err(err);
            }
        };

        let breaker = self.circuit_breakers.get_or_create(&backend.id);
        let call_timer = Timer::new();
        let outcome = tokio::time::timeout(self.config.request_timeout(), self.client.request(outbound)).await;
        let latency_ms = call_timer.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(response)) => {
                let success = response.status().is_success();
                Ok((response, success))
            }
            Ok(Err(err)) => {
                error!(backend = %backend.id, error = %err, "backend request failed");
                Err(ProxyError::BackendHttpError(err.to_string()))
            }
            Err(_) => {
                warn!(backend = %backend.id, "backend request timed out");
                Err(ProxyError::BackendTimeout)
            }
        };

        let success = matches!(&result, Ok((_, true)));
        strategy.record(&backend, latency_ms, success).await;
        if success {
            breaker.record_success().await;
        } else {
            breaker.record_failure().await;
        }
        self.metrics.record_backend_request(
            &backend.id,
            success,
            Duration::from_millis(latency_ms),
        );
        self.metrics
            .update_backend_connections(&backend.id, backend.current_connections() as i64);

        let status_for_metrics = match &result {
            Ok((response, _)) => response.status().as_u16(),
            Err(ProxyError::BackendTimeout) => 504,
            Err(_) => 502,
        };
        self.metrics
            .record_request(method.as_str(), status_for_metrics, &backend.id, timer.elapsed());

        result.map(|(response, _)| response)
    }

    fn resolve_algorithm(&self, query: Option<&str>) -> Result<LoadBalancerAlgorithm, ProxyError> {
        let Some(query) = query else {
            return Ok(self.registry.default_algorithm());
        };

        let requested = url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "algorithm")
            .map(|(_, value)| value.into_owned());

        match requested {
            None => Ok(self.registry.default_algorithm()),
            Some(value) => value
                .parse::<LoadBalancerAlgorithm>()
                .map_err(ProxyError::UnknownAlgorithm),
        }
    }

    async fn breaker_eligible(&self, snapshot: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
        let mut eligible = Vec::with_capacity(snapshot.len());
        for backend in snapshot {
            let breaker = self.circuit_breakers.get_or_create(&backend.id);
            if breaker.call_permitted().await {
                eligible.push(backend.clone());
            } else {
                info!(backend = %backend.id, "excluding backend: circuit breaker open");
            }
        }
        eligible
    }
}

/// Reads the request body into memory, bailing out as soon as the running
/// total would exceed `cap` rather than buffering the whole thing first.
async fn read_capped_body(mut body: Body, cap: usize) -> Result<Vec<u8>, ProxyError> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| ProxyError::BackendHttpError(e.to_string()))?;
        if buf.len() + chunk.len() > cap {
            return Err(ProxyError::InvariantViolation(
                "request body exceeds the 1 MiB forwarding cap".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Client identity for IP-Hash/Consistent-Hashing stickiness: `X-Forwarded-For`
/// (first hop), then `X-Real-IP`, then the raw TCP peer address.
fn extract_client_info(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = value.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    if let Some(value) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    peer.ip().to_string()
}

/// Rewrites the backend's base URL with the inbound path and query, dropping
/// the internal `algorithm` selector so it never leaks to the backend.
fn build_backend_uri(backend_base: &Url, req_uri: &Uri) -> Result<Uri, ProxyError> {
    let mut target = backend_base.clone();
    target.set_path(req_uri.path());

    let filtered: Vec<(String, String)> = req_uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .filter(|(key, _)| key != "algorithm")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    if filtered.is_empty() {
        target.set_query(None);
    } else {
        let qs = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&filtered)
            .finish();
        target.set_query(Some(&qs));
    }

    target
        .as_str()
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvariantViolation(e.to_string()))
}

fn build_outbound_request(
    backend_base: &Url,
    method: &hyper::Method,
    req_uri: &Uri,
    headers: &HeaderMap,
    peer: SocketAddr,
    body: Vec<u8>,
) -> Result<Request<Body>, ProxyError> {
    let uri = build_backend_uri(backend_base, req_uri)?;

    let mut builder = Request::builder().method(method.clone()).uri(uri);
    for (name, value) in headers.iter() {
        if name == HOST {
            continue;
        }
        builder = builder.header(name, value);
    }

    if let Some(host) = backend_base.host_str() {
        builder = builder.header(HOST, host);
    }

    let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {}", peer.ip()),
        None => peer.ip().to_string(),
    };
    builder = builder.header("x-forwarded-for", forwarded);

    builder
        .body(Body::from(body))
        .map_err(|e| ProxyError::InvariantViolation(e.to_string()))
}

/// Dispatcher-level error taxonomy (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no healthy backend available")]
    NoHealthyBackend,

    #[error("unknown load balancing algorithm: {0}")]
    UnknownAlgorithm(#[from] UnknownAlgorithmError),

    #[error("backend request failed: {0}")]
    BackendHttpError(String),

    #[error("backend request timed out")]
    BackendTimeout,

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

impl From<LbError> for ProxyError {
    fn from(err: LbError) -> Self {
        match err {
            LbError::NoHealthyBackend => ProxyError::NoHealthyBackend,
        }
    }
}

impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let status = match err {
            ProxyError::NoHealthyBackend => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UnknownAlgorithm(_) => StatusCode::BAD_REQUEST,
            ProxyError::BackendHttpError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BackendTimeout => StatusCode::BAD_GATEWAY,
            ProxyError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = err.to_string();

        Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap()
    }
}
