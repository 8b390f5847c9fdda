//! Backend registry
//!
//! Holds the static, ordered list of backend addresses and a live count of
//! forwarded connections per backend. The list never changes after
//! construction; the counts are guarded by a single mutex that is only held
//! for one increment, decrement or read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Static backend list plus per-backend active connection counts.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<String>,
    connections: Mutex<HashMap<String, usize>>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<String>) -> Self {
        Self {
            backends,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Backends in round-robin order.
    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Admission hook consulted before dialing a backend.
    ///
    /// No connection limit is configured, so every backend is admitted.
    pub fn capacity(&self, _backend: &str) -> bool {
        true
    }

    pub fn increment(&self, backend: &str) {
        let mut connections = self.lock();
        let count = connections.entry(backend.to_string()).or_insert(0);
        *count += 1;
        tracing::debug!(
            "New connection to backend {}, active connections: {}",
            backend,
            count
        );
    }

    /// Must be paired with exactly one earlier [`increment`](Self::increment).
    pub fn decrement(&self, backend: &str) {
        let mut connections = self.lock();
        match connections.get_mut(backend) {
            Some(count) if *count > 0 => {
                *count -= 1;
                tracing::debug!(
                    "Closed connection to backend {}, active connections: {}",
                    backend,
                    count
                );
            }
            _ => tracing::warn!("Unbalanced release for backend {}", backend),
        }
    }

    /// Currently open forwarded connections to `backend`.
    pub fn active_connections(&self, backend: &str) -> usize {
        self.lock().get(backend).copied().unwrap_or(0)
    }

    /// Copy of the count map. Backends that were never dialed are reported
    /// with a zero count.
    pub fn snapshot(&self) -> HashMap<String, usize> {
        let connections = self.lock();
        self.backends
            .iter()
            .map(|b| (b.clone(), connections.get(b).copied().unwrap_or(0)))
            .collect()
    }

    // The map only holds integers, so a panic elsewhere cannot leave it in a
    // state worth refusing to read.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One counted connection to a backend.
///
/// Created after a successful dial; dropping it releases the count.
#[derive(Debug)]
pub struct BackendLease {
    registry: Arc<BackendRegistry>,
    backend: String,
}

impl BackendLease {
    pub fn acquire(registry: Arc<BackendRegistry>, backend: &str) -> Self {
        registry.increment(backend);
        Self {
            registry,
            backend: backend.to_string(),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.registry.decrement(&self.backend);
    }
}
