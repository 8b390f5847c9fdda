//! Bidirectional byte forwarding between a client and its backend
//!
//! Two copy loops run concurrently, one per direction. When a side reaches
//! end-of-stream the write half of the opposite socket is shut down, so the
//! peer sees "no more data" while the other direction keeps flowing. The pipe
//! finishes only after both loops have ended.

use std::fmt;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Whether an endpoint can shut down its write half independently of its
/// read half.
pub trait HalfClose {
    fn supports_half_close(&self) -> bool {
        true
    }
}

impl HalfClose for tokio::net::TcpStream {}

impl HalfClose for tokio::io::DuplexStream {}

#[cfg(unix)]
impl HalfClose for tokio::net::UnixStream {}

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client -> backend"),
            Direction::BackendToClient => f.write_str("backend -> client"),
        }
    }
}

/// Forward bytes between `client` and `backend` until both directions end.
///
/// Copy errors are logged at debug level and stop only the direction they
/// occurred on. `buffer_size` is the per-direction read chunk size.
pub async fn pipe<C, B>(client: &mut C, backend: &mut B, buffer_size: usize) -> PipeStats
where
    C: AsyncRead + AsyncWrite + HalfClose + Unpin,
    B: AsyncRead + AsyncWrite + HalfClose + Unpin,
{
    let client_half_close = client.supports_half_close();
    let backend_half_close = backend.supports_half_close();

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = forward(
        &mut client_read,
        &mut backend_write,
        buffer_size,
        backend_half_close,
        Direction::ClientToBackend,
    );
    let downstream = forward(
        &mut backend_read,
        &mut client_write,
        buffer_size,
        client_half_close,
        Direction::BackendToClient,
    );

    let (client_to_backend, backend_to_client) = tokio::join!(upstream, downstream);

    PipeStats {
        client_to_backend,
        backend_to_client,
    }
}

async fn forward<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    half_close: bool,
    direction: Direction,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::zeroed(buffer_size.max(1));
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Error copying {}: {}", direction, e);
                break;
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            tracing::debug!("Error copying {}: {}", direction, e);
            break;
        }
        total += n as u64;
    }

    if half_close {
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Error closing write side {}: {}", direction, e);
        }
    } else if let Err(e) = writer.flush().await {
        tracing::debug!("Error flushing {}: {}", direction, e);
    }

    total
}
