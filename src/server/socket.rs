use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Turn on TCP keep-alive, probing after `period` of idleness and every
/// `period` thereafter.
pub fn apply_keep_alive(stream: &TcpStream, period: Duration) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        windows
    ))]
    let keepalive = keepalive.with_interval(period);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
