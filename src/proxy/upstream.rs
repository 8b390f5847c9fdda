//! Backend selection and dialing
//!
//! Each new client connection takes one value from a shared rotation counter.
//! That value fixes the first candidate; the remaining backends are tried in
//! list order after it, wrapping around, until one accepts a TCP connection.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::ProxyError;
use crate::proxy::backend::{BackendLease, BackendRegistry};
use crate::server::socket::apply_keep_alive;

/// How long a single backend dial may take before the next candidate is tried.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Round-robin backend selector with sequential failover.
#[derive(Debug)]
pub struct Upstream {
    registry: Arc<BackendRegistry>,
    rotation: AtomicU64,
    dial_timeout: Duration,
    keep_alive: Option<Duration>,
}

impl Upstream {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            rotation: AtomicU64::new(0),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keep_alive: None,
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Enable TCP keep-alive with the given period on dialed backend sockets.
    pub fn with_keep_alive(mut self, period: Option<Duration>) -> Self {
        self.keep_alive = period;
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Keep-alive period applied to dialed sockets, if enabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    /// Index of the first candidate for the next connection.
    ///
    /// Advances the rotation counter exactly once. Concurrent callers always
    /// observe distinct counter values.
    pub fn next_start(&self) -> Option<usize> {
        let len = self.registry.len();
        if len == 0 {
            return None;
        }
        let ticket = self.rotation.fetch_add(1, Ordering::Relaxed);
        Some((ticket % len as u64) as usize)
    }

    /// Dial a backend for a new client connection.
    ///
    /// On success the returned lease holds one count for the chosen backend
    /// until it is dropped.
    pub async fn select_backend(&self) -> Result<(TcpStream, BackendLease), ProxyError> {
        let start = self.next_start().ok_or(ProxyError::NoBackendsConfigured)?;
        self.connect_from(start).await
    }

    /// Try every backend once, beginning at `start` (taken modulo the
    /// number of backends) and wrapping around.
    pub async fn connect_from(&self, start: usize) -> Result<(TcpStream, BackendLease), ProxyError> {
        let backends = self.registry.backends();
        if backends.is_empty() {
            return Err(ProxyError::NoBackendsConfigured);
        }

        let start = start % backends.len();
        for i in 0..backends.len() {
            let backend = &backends[(start + i) % backends.len()];

            if !self.registry.capacity(backend) {
                continue;
            }

            tracing::debug!("Attempting to connect to backend {}", backend);
            match self.dial(backend).await {
                Ok(stream) => {
                    let lease = BackendLease::acquire(Arc::clone(&self.registry), backend);
                    return Ok((stream, lease));
                }
                Err(e) => {
                    tracing::error!("Failed to connect to backend {}: {}", backend, e);
                }
            }
        }

        Err(ProxyError::AllBackendsUnavailable)
    }

    async fn dial(&self, backend: &str) -> io::Result<TcpStream> {
        let stream = within(self.dial_timeout, TcpStream::connect(backend)).await?;

        if let Some(period) = self.keep_alive {
            if let Err(e) = apply_keep_alive(&stream, period) {
                tracing::debug!("Failed to set keep-alive on backend {}: {}", backend, e);
            }
        }

        Ok(stream)
    }
}

/// Run a connect attempt, failing with `TimedOut` once `limit` elapses.
async fn within<T>(limit: Duration, attempt: impl Future<Output = io::Result<T>>) -> io::Result<T> {
    match timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    }
}
