//! Outbound TCP dialing with the socket options every relay connection gets.

use std::time::Duration;

use tokio::net::TcpStream;

use super::error::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Connect to `addr` ("host:port") and apply keep-alive and TCP_NODELAY.
pub async fn dial(addr: &str) -> Result<TcpStream, Error> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::DialFailed(format!("connect timeout to {addr}")))?
        .map_err(|e| Error::DialFailed(format!("{addr}: {e}")))?;

    let sock_ref = socket2::SockRef::from(&stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    sock_ref.set_tcp_keepalive(&keepalive)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
