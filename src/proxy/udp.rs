//! UDP relay: decrypt each datagram, apply policy, forward the payload from
//! a per-client ephemeral socket, and feed encapsulated replies back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::Address;
use crate::crypto;

use super::nat::NatMap;
use super::server::Tenant;
use super::ServerContext;

const UDP_BUF_SIZE: usize = 64 * 1024;
const NAT_TIMEOUT: Duration = Duration::from_secs(300);

pub(crate) async fn serve(
    tenant: Arc<Tenant>,
    ctx: Arc<ServerContext>,
    socket: UdpSocket,
    cancel: CancellationToken,
) {
    let socket = Arc::new(socket);
    let nat = Arc::new(NatMap::new());
    let mut buf = vec![0u8; UDP_BUF_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, peer)) => {
                    handle_datagram(&tenant, &ctx, &socket, &nat, &buf[..n], peer, &cancel).await;
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    debug!(user = tenant.name(), error = %e, "udp read failed");
                }
            },
            _ = cancel.cancelled() => break,
        }
    }
    debug!(user = tenant.name(), "udp loop exiting");
}

async fn handle_datagram(
    tenant: &Arc<Tenant>,
    ctx: &Arc<ServerContext>,
    socket: &Arc<UdpSocket>,
    nat: &Arc<NatMap>,
    datagram: &[u8],
    peer: SocketAddr,
    cancel: &CancellationToken,
) {
    let plain = match crypto::open_packet(tenant.kind(), tenant.master_key(), datagram) {
        Ok(p) => p,
        Err(e) => {
            debug!(user = tenant.name(), peer = %peer, error = %e, "packet open failed");
            return;
        }
    };

    let (target, consumed) = match Address::split(&plain) {
        Ok(v) => v,
        Err(e) => {
            debug!(user = tenant.name(), peer = %peer, error = %e, "bad packet address");
            return;
        }
    };

    match &target {
        Address::Ip(sa) if sa.is_ipv4() => {
            if ctx.policy.is_rejected(sa.ip()) {
                debug!(user = tenant.name(), target = %target, "private destination dropped");
                return;
            }
        }
        Address::Ip(_) => {}
        Address::Domain(domain, _) => {
            if ctx.filter.contains(domain) {
                debug!(user = tenant.name(), domain = domain.as_str(), "blocked domain dropped");
                return;
            }
        }
    }

    let started = Instant::now();
    let dest = match tokio::net::lookup_host(target.to_string())
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
    {
        Some(d) => d,
        None => {
            debug!(user = tenant.name(), target = %target, "udp resolve failed");
            return;
        }
    };

    let payload = &plain[consumed..];

    let upstream = match nat.get(&peer) {
        Some(s) => s,
        None => {
            let s = match UdpSocket::bind(("0.0.0.0", 0)).await {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    debug!(user = tenant.name(), error = %e, "ephemeral bind failed");
                    return;
                }
            };
            nat.insert(peer, s.clone());
            tokio::spawn(relay_replies(
                tenant.clone(),
                socket.clone(),
                nat.clone(),
                peer,
                s.clone(),
                NAT_TIMEOUT,
                cancel.clone(),
            ));
            s
        }
    };

    if let Err(e) = upstream.send_to(payload, dest).await {
        debug!(user = tenant.name(), dest = %dest, error = %e, "udp forward failed");
        return;
    }
    tenant.add_traffic(payload.len() as u64);
    tenant.add_time_ms(started.elapsed().as_millis() as i64);
}

/// Copy replies from the upstream socket back to the client until the idle
/// timeout expires or the tenant shuts down, then tear the NAT entry down.
/// Each reply is prefixed with the address it came from and sealed as one
/// datagram.
async fn relay_replies(
    tenant: Arc<Tenant>,
    client: Arc<UdpSocket>,
    nat: Arc<NatMap>,
    peer: SocketAddr,
    upstream: Arc<UdpSocket>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let received = tokio::select! {
            r = timeout(idle_timeout, upstream.recv_from(&mut buf)) => r,
            _ = cancel.cancelled() => break,
        };
        let (n, from) = match received {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                debug!(user = tenant.name(), peer = %peer, error = %e, "upstream read failed");
                break;
            }
            Err(_) => {
                debug!(user = tenant.name(), peer = %peer, "nat entry idle, expiring");
                break;
            }
        };

        let mut packet = BytesMut::with_capacity(19 + n);
        Address::from_socket_addr(from).write_to(&mut packet);
        packet.extend_from_slice(&buf[..n]);

        let sealed = match crypto::seal_packet(tenant.kind(), tenant.master_key(), &packet) {
            Ok(s) => s,
            Err(e) => {
                debug!(user = tenant.name(), error = %e, "reply seal failed");
                break;
            }
        };
        if let Err(e) = client.send_to(&sealed, peer).await {
            debug!(user = tenant.name(), peer = %peer, error = %e, "reply send failed");
            break;
        }
        tenant.add_traffic(n as u64);
    }
    nat.remove(&peer);
    // Dropping the last Arc closes the upstream socket.
}
