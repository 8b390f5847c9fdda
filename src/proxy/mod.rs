//! TCP proxy engine
//!
//! - **`backend`**: the static backend list and per-backend connection counts
//! - **`upstream`**: round-robin backend selection with failover
//! - **`pipe`**: bidirectional forwarding with half-close propagation

pub mod backend;
pub mod pipe;
pub mod upstream;

pub use backend::{BackendLease, BackendRegistry};
pub use pipe::{HalfClose, PipeStats, pipe};
pub use upstream::{DEFAULT_DIAL_TIMEOUT, Upstream};
