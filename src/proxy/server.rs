//! Per-tenant listener pair and lifecycle.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::common::{Error, Result};
use crate::crypto::{self, CipherKind};

use super::{tcp, udp, ServerContext};

/// One tenant: a TCP/UDP listener pair on a single port, its key material and
/// its counters. Both sockets are bound with SO_REUSEPORT so a replacement
/// tenant can bind the same port before this one is shut down.
pub struct Tenant {
    name: String,
    cipher_name: String,
    kind: CipherKind,
    password: String,
    port: u16,
    master_key: Vec<u8>,
    traffic: AtomicU64,
    used_time_ms: AtomicI64,
    cancel: CancellationToken,
}

impl Tenant {
    /// Validate the cipher, bind both sockets and start the accept loops.
    /// If either bind fails the whole construction fails and the other
    /// socket is released.
    pub fn spawn(
        name: &str,
        cipher: &str,
        password: &str,
        port: u16,
        ctx: Arc<ServerContext>,
    ) -> Result<Arc<Self>> {
        let kind = CipherKind::parse(cipher)?;
        let master_key = crypto::evp_bytes_to_key(password.as_bytes(), kind.key_len());

        let tcp_listener = bind_tcp(port).map_err(|source| Error::BindFailed { port, source })?;
        let bound_port = tcp_listener
            .local_addr()
            .map_err(|source| Error::BindFailed { port, source })?
            .port();
        let udp_socket = bind_udp(bound_port).map_err(|source| Error::BindFailed {
            port: bound_port,
            source,
        })?;

        let tenant = Arc::new(Self {
            name: name.to_string(),
            cipher_name: cipher.to_string(),
            kind,
            password: password.to_string(),
            port: bound_port,
            master_key,
            traffic: AtomicU64::new(0),
            used_time_ms: AtomicI64::new(0),
            cancel: CancellationToken::new(),
        });

        let tcp_task = tokio::spawn(tcp::serve(
            tenant.clone(),
            ctx.clone(),
            tcp_listener,
            tenant.cancel.clone(),
        ));
        let udp_task = tokio::spawn(udp::serve(
            tenant.clone(),
            ctx,
            udp_socket,
            tenant.cancel.clone(),
        ));

        // A panic in one loop is logged and terminates only that loop; the
        // sibling loop and every other tenant keep running.
        for (which, handle) in [("tcp", tcp_task), ("udp", udp_task)] {
            let name = tenant.name.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!(user = name.as_str(), which, error = %e, "accept loop panicked");
                    }
                }
            });
        }

        info!(
            user = name,
            port = bound_port,
            cipher = kind.canonical_name(),
            "user server started"
        );
        Ok(tenant)
    }

    /// Stop both accept loops. In-flight relays finish on their own.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn cipher_name(&self) -> &str {
        &self.cipher_name
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    pub fn add_traffic(&self, bytes: u64) {
        self.traffic.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Wall-clock accounting; non-positive values are dropped so the counter
    /// stays monotonic.
    pub fn add_time_ms(&self, ms: i64) {
        if ms > 0 {
            self.used_time_ms.fetch_add(ms, Ordering::Relaxed);
        }
    }

    pub fn counters(&self) -> (u64, i64) {
        (
            self.traffic.load(Ordering::Relaxed),
            self.used_time_ms.load(Ordering::Relaxed),
        )
    }

    pub fn set_counters(&self, traffic: u64, used_time_ms: i64) {
        self.traffic.store(traffic, Ordering::Relaxed);
        self.used_time_ms.store(used_time_ms, Ordering::Relaxed);
    }

    pub fn reset_counters(&self) {
        self.set_counters(0, 0);
    }
}

fn bind_tcp(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

fn bind_udp(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
