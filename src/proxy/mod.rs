//
// src/proxy/mod.rs
//
mod proxy;
mod backend;
mod pool;

pub use backend::{Backend, BackendMetrics};
pub use pool::BackendPool;
pub use proxy::{Proxy, ProxyError};
