//! Errors surfaced by the proxy engine.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The backend list is empty.
    #[error("no backends available")]
    NoBackendsConfigured,

    /// Every candidate was skipped or failed to dial.
    #[error("all backends are unavailable or at maximum capacity")]
    AllBackendsUnavailable,

    #[error("failed to start listener on {addr}: {source}")]
    ListenFailed {
        addr: String,
        #[source]
        source: io::Error,
    },
}
