//! tcp-multi - TCP reverse proxy
//!
//! Accepts client connections on one address and forwards each to one of
//! several backends, chosen round-robin with sequential failover.

pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod server;

pub use config::Config;
pub use error::ProxyError;
pub use server::Proxy;
