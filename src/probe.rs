//! TCP reachability probing.
//!
//! A provider may report an instance as running before its service port
//! accepts connections, so convergence checks pair the status with a
//! direct probe.

use std::time::Duration;
use tokio::net::TcpStream;

/// Default per-attempt connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempt a TCP connection to `host:port`. Never fails: timeouts,
/// refusals and resolution errors all mean "not yet connectable".
pub async fn tcp_probe(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
