use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::ProxyError;
use crate::proxy::backend::BackendRegistry;
use crate::proxy::pipe::pipe;
use crate::proxy::upstream::Upstream;
use crate::server::socket::apply_keep_alive;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A TCP proxy: one listening socket fanned out to the configured backends.
pub struct Proxy {
    listen_addr: String,
    buffer_size: usize,
    keep_alive: Option<Duration>,
    upstream: Arc<Upstream>,
    shutdown: watch::Sender<bool>,
}

impl Proxy {
    pub fn new(cfg: &Config) -> Self {
        let registry = Arc::new(BackendRegistry::new(cfg.proxy.backends.clone()));
        let upstream = Upstream::new(registry).with_keep_alive(keep_alive_period(cfg));

        Self::with_upstream(cfg, upstream)
    }

    /// Build a proxy around an already configured selector.
    ///
    /// Client sockets get the same keep-alive period as the selector applies
    /// to backend sockets; `cfg.connection.keep_alive` is not consulted here.
    pub fn with_upstream(cfg: &Config, upstream: Upstream) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            listen_addr: cfg.listen_addr(),
            buffer_size: cfg.connection.buffer_size,
            keep_alive: upstream.keep_alive(),
            upstream: Arc::new(upstream),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        self.upstream.registry()
    }

    /// Keep-alive period applied to both client and backend sockets.
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    /// Bind the configured address and run the accept loop until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<(), ProxyError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ProxyError::ListenFailed {
                addr: self.listen_addr.clone(),
                source,
            })
    }

    /// Accept connections on `listener` until [`stop`](Self::stop) is called.
    ///
    /// Each connection is handled on its own task. Failed accepts are logged
    /// and do not end the loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        let mut shutdown = self.shutdown.subscribe();

        match listener.local_addr() {
            Ok(addr) => info!("TCP proxy started on {}", addr),
            Err(_) => info!("TCP proxy started on {}", self.listen_addr),
        }

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => self.dispatch(socket, peer),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        debug!("Listener closed");
        Ok(())
    }

    /// Close the listening socket. Connections already being forwarded keep
    /// running until their peers close them.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    fn dispatch(&self, socket: TcpStream, peer: SocketAddr) {
        debug!("Accepted connection from {}", peer);

        if let Some(period) = self.keep_alive {
            if let Err(e) = apply_keep_alive(&socket, period) {
                debug!("Failed to set keep-alive for {}: {}", peer, e);
            }
        }

        let upstream = Arc::clone(&self.upstream);
        let buffer_size = self.buffer_size;
        tokio::spawn(async move {
            handle_connection(upstream, socket, peer, buffer_size).await;
        });
    }
}

fn keep_alive_period(cfg: &Config) -> Option<Duration> {
    cfg.connection
        .keep_alive
        .then_some(cfg.connection.keep_alive_period)
}

async fn handle_connection(
    upstream: Arc<Upstream>,
    mut client: TcpStream,
    peer: SocketAddr,
    buffer_size: usize,
) {
    let (mut backend, lease) = match upstream.select_backend().await {
        Ok(selected) => selected,
        Err(e) => {
            error!("Failed to connect to any backend: {}", e);
            return;
        }
    };

    debug!("Connected to backend {} for {}", lease.backend(), peer);

    let stats = pipe(&mut client, &mut backend, buffer_size).await;

    drop(backend);
    drop(client);
    drop(lease);

    debug!(
        "Connection from {} closed ({} bytes to backend, {} bytes to client)",
        peer, stats.client_to_backend, stats.backend_to_client
    );
}
