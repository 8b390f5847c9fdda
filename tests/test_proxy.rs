//! End-to-end tests: client -> proxy -> backend over loopback sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tcp_multi::config::Config;
use tcp_multi::proxy::backend::BackendRegistry;
use tcp_multi::proxy::upstream::Upstream;
use tcp_multi::server::Proxy;
use tcp_multi::server::socket::apply_keep_alive;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Backend that greets with `tag` and then echoes until the client
/// half-closes.
async fn spawn_backend(tag: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                if writer.write_all(tag.as_bytes()).await.is_err() {
                    return;
                }
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

async fn dead_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

fn config(backends: Vec<String>) -> Config {
    let mut cfg = Config::default();
    cfg.server.host = "127.0.0.1".to_string();
    cfg.server.port = 0;
    cfg.connection.buffer_size = 4096;
    cfg.proxy.backends = backends;
    cfg
}

async fn start_proxy(cfg: Config) -> (Arc<Proxy>, SocketAddr, JoinHandle<()>) {
    let proxy = Arc::new(Proxy::new(&cfg));
    let listener = proxy.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serving = Arc::clone(&proxy);
    let handle = tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    (proxy, addr, handle)
}

/// Send `msg`, half-close, and collect everything until the proxy closes.
async fn exchange(addr: SocketAddr, msg: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let (mut reader, mut writer) = stream.split();

    let send = async {
        writer.write_all(msg.as_bytes()).await.unwrap();
        writer.shutdown().await.unwrap();
    };
    let recv = async {
        let mut reply = Vec::new();
        reader.read_to_end(&mut reply).await.unwrap();
        reply
    };

    let ((), reply) = tokio::join!(send, recv);
    String::from_utf8(reply).unwrap()
}

/// Connect and expect the proxy to close the connection without sending
/// anything.
async fn assert_rejected(addr: SocketAddr) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut reply = Vec::new();
    // A reset instead of a clean close is also a rejection.
    let _ = stream.read_to_end(&mut reply).await;
    assert!(reply.is_empty());
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_proxy_forwards_and_echoes() {
    let backend = spawn_backend("A:").await;
    let (_proxy, addr, _handle) = start_proxy(config(vec![backend])).await;

    assert_eq!(exchange(addr, "hello").await, "A:hello");
}

#[tokio::test]
async fn test_proxy_round_robin() {
    let a = spawn_backend("A:").await;
    let b = spawn_backend("B:").await;
    let c = spawn_backend("C:").await;
    let (_proxy, addr, _handle) = start_proxy(config(vec![a, b, c])).await;

    let mut replies = Vec::new();
    for i in 0..6 {
        replies.push(exchange(addr, &i.to_string()).await);
    }

    assert_eq!(replies, ["A:0", "B:1", "C:2", "A:3", "B:4", "C:5"]);
}

#[tokio::test]
async fn test_proxy_failover() {
    let dead = dead_backend().await;
    let live = spawn_backend("L:").await;
    let (_proxy, addr, _handle) = start_proxy(config(vec![dead, live])).await;

    for _ in 0..4 {
        assert_eq!(exchange(addr, "x").await, "L:x");
    }
}

#[tokio::test]
async fn test_proxy_all_backends_unavailable() {
    let (_proxy, addr, _handle) =
        start_proxy(config(vec![dead_backend().await, dead_backend().await])).await;

    // Closed without any data, and the proxy keeps accepting.
    assert_rejected(addr).await;
    assert_rejected(addr).await;
}

#[tokio::test]
async fn test_proxy_without_backends() {
    let (proxy, addr, _handle) = start_proxy(config(vec![])).await;

    assert_rejected(addr).await;
    assert!(proxy.registry().snapshot().is_empty());
}

#[tokio::test]
async fn test_proxy_large_payload() {
    let backend = spawn_backend("").await;
    let (_proxy, addr, _handle) = start_proxy(config(vec![backend])).await;

    let payload: String = (0..200_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let reply = exchange(addr, &payload).await;

    assert_eq!(reply.len(), payload.len());
    assert!(reply == payload);
}

#[tokio::test]
async fn test_proxy_counts_return_to_zero() {
    let a = spawn_backend("A").await;
    let b = spawn_backend("B").await;
    let (proxy, addr, _handle) = start_proxy(config(vec![a.clone(), b.clone()])).await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut tag = [0u8; 1];
        stream.read_exact(&mut tag).await.unwrap();
        clients.push(stream);
    }

    let registry = Arc::clone(proxy.registry());
    wait_until(|| registry.active_connections(&a) == 3 && registry.active_connections(&b) == 2)
        .await;

    drop(clients);

    wait_until(|| registry.snapshot().values().all(|&count| count == 0)).await;
}

#[tokio::test]
async fn test_proxy_stop_closes_listener() {
    let backend = spawn_backend("A:").await;
    let (proxy, addr, handle) = start_proxy(config(vec![backend])).await;

    assert_eq!(exchange(addr, "before").await, "A:before");

    proxy.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("accept loop did not exit")
        .unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_proxy_stop_leaves_open_connections() {
    let backend = spawn_backend("A:").await;
    let (proxy, addr, handle) = start_proxy(config(vec![backend])).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await.unwrap();

    proxy.stop();
    handle.await.unwrap();

    stream.write_all(b"still here").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"still here");
}

#[tokio::test]
async fn test_proxy_with_keep_alive() {
    let backend = spawn_backend("K:").await;
    let mut cfg = config(vec![backend]);
    cfg.connection.keep_alive = true;
    cfg.connection.keep_alive_period = Duration::from_secs(15);
    let (_proxy, addr, _handle) = start_proxy(cfg).await;

    assert_eq!(exchange(addr, "alive").await, "K:alive");
}

#[test]
fn test_keep_alive_shared_by_client_and_backend_sockets() {
    let mut cfg = config(vec![]);
    cfg.connection.keep_alive = true;
    cfg.connection.keep_alive_period = Duration::from_secs(15);
    assert_eq!(Proxy::new(&cfg).keep_alive(), Some(Duration::from_secs(15)));

    // The selector's setting wins over the connection section.
    let registry = Arc::new(BackendRegistry::new(vec![]));
    let upstream = Upstream::new(registry).with_keep_alive(Some(Duration::from_secs(40)));
    let proxy = Proxy::with_upstream(&cfg, upstream);
    assert_eq!(proxy.keep_alive(), Some(Duration::from_secs(40)));

    let upstream = Upstream::new(Arc::new(BackendRegistry::new(vec![])));
    assert_eq!(Proxy::with_upstream(&cfg, upstream).keep_alive(), None);
}

#[tokio::test]
async fn test_apply_keep_alive_sets_socket_option() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();

    apply_keep_alive(&stream, Duration::from_secs(20)).unwrap();

    let sock = socket2::SockRef::from(&stream);
    assert!(sock.keepalive().unwrap());
    #[cfg(target_os = "linux")]
    assert_eq!(sock.keepalive_time().unwrap(), Duration::from_secs(20));
}

#[tokio::test]
async fn test_start_reports_bind_failure() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let mut cfg = config(vec![]);
    cfg.server.port = port;
    let proxy = Proxy::new(&cfg);

    let err = proxy.start().await.unwrap_err();
    assert!(matches!(err, tcp_multi::ProxyError::ListenFailed { .. }));
}
