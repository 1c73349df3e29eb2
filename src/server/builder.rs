// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::server::listener::bind_tcp;
use anyhow::Result;
use hyper::{server::conn::Http, Body, Request, Response};
use std::net::SocketAddr;
use std::task::{Context, Poll};
use tower::Service;

/// Carries the TCP peer address into request extensions so downstream
/// handlers (the dispatcher's client_info extraction) can read it without
/// hyper exposing it on `Request` directly.
#[derive(Debug, Clone, Copy)]
pub struct ConnectInfo(pub SocketAddr);

/// Builder pattern so `main.rs` can inject its Proxy (or any handler).
pub struct ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    addr: SocketAddr,
    handler: Option<H>,
    shutdown: Option<tokio::sync::watch::Receiver<bool>>,
}

impl<H> ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handler: None,
            shutdown: None,
        }
    }

    /// Inject your request handler (usually wraps `proxy::Proxy`).
    pub fn with_handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Stop accepting new connections once `rx` observes `true`.
    pub fn with_graceful_shutdown(mut self, rx: tokio::sync::watch::Receiver<bool>) -> Self {
        self.shutdown = Some(rx);
        self
    }

    /// Consume the builder, boot the TCP listener, spawn Hyper tasks.
    pub async fn serve(self) -> Result<()> {
        let handler = self.handler.expect("handler must be set via with_handler()");

        let listener = bind_tcp(self.addr).await?;
        tracing::info!("HTTP server listening on {}", self.addr);

        let mut shutdown = self.shutdown;

        loop {
            let accepted = match shutdown.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        res = listener.accept() => Some(res),
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                tracing::info!("server shutting down, no longer accepting connections");
                                None
                            } else {
                                continue;
                            }
                        }
                    }
                }
                None => Some(listener.accept().await),
            };

            let (stream, peer) = match accepted {
                Some(Ok(pair)) => pair,
                Some(Err(err)) => {
                    tracing::warn!(%err, "accept error");
                    continue;
                }
                None => break,
            };

            let svc = ConnectInfoService {
                peer,
                inner: handler.clone(),
            };

            tokio::spawn(async move {
                let http = Http::new();
                if let Err(err) = http.serve_connection(stream, svc).await {
                    tracing::warn!(%peer, %err, "connection error");
                }
            });
        }

        Ok(())
    }
}

#[derive(Clone)]
struct ConnectInfoService<H> {
    peer: SocketAddr,
    inner: H,
}

impl<H> Service<Request<Body>> for ConnectInfoService<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    H::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = H::Error;
    type Future = H::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        req.extensions_mut().insert(ConnectInfo(self.peer));
        self.inner.call(req)
    }
}
