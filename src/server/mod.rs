//! Listening socket, accept loop and per-connection handling.

pub mod listener;
pub mod socket;

pub use listener::Proxy;
