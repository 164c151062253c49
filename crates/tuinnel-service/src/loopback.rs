//! Loopback address resolution
//!
//! Some dev servers bind only the IPv6 loopback. Probe 127.0.0.1 first,
//! then [::1]; when neither answers, fall back to 127.0.0.1 anyway and let
//! the connector surface the connection errors.

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

pub const IPV4_LOOPBACK: &str = "127.0.0.1";
pub const IPV6_LOOPBACK: &str = "[::1]";

async fn answers(addr: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(format!("{addr}:{port}"))).await,
        Ok(Ok(_))
    )
}

/// Does anything answer on either loopback? Used by the port health prober.
pub async fn port_answers(port: u16) -> bool {
    answers(IPV4_LOOPBACK, port).await || answers(IPV6_LOOPBACK, port).await
}

/// The loopback host the origin service actually listens on
pub async fn resolve_loopback(port: u16) -> &'static str {
    if answers(IPV4_LOOPBACK, port).await {
        return IPV4_LOOPBACK;
    }
    if answers(IPV6_LOOPBACK, port).await {
        debug!("port {} answers only on the IPv6 loopback", port);
        return IPV6_LOOPBACK;
    }
    debug!("port {} refused on both loopbacks, assuming IPv4", port);
    IPV4_LOOPBACK
}
