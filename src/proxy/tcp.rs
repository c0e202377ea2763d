//! TCP accept loop and per-connection handling: decrypt, resolve, apply
//! policy, dial, relay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{dialer, Address, Error};
use crate::dns::Lookup;

use super::cork::CorkedStream;
use super::relay::relay;
use super::server::Tenant;
use super::stream::AeadStream;
use super::ServerContext;

const CORK_DELAY: Duration = Duration::from_millis(10);

pub(crate) async fn serve(
    tenant: Arc<Tenant>,
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let tenant = tenant.clone();
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        debug!(user = tenant.name(), peer = %peer, "tcp connection accepted");
                        handle_conn(tenant, ctx, stream).await;
                    });
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    debug!(user = tenant.name(), error = %e, "accept failed");
                }
            },
            _ = cancel.cancelled() => break,
        }
    }
    debug!(user = tenant.name(), "tcp accept loop exiting");
}

async fn handle_conn(tenant: Arc<Tenant>, ctx: Arc<ServerContext>, stream: TcpStream) {
    let mut shadowed = match AeadStream::new(stream, tenant.kind(), tenant.master_key().to_vec()) {
        Ok(s) => s,
        Err(e) => {
            debug!(user = tenant.name(), error = %e, "cipher setup failed");
            return;
        }
    };

    let target = match Address::read(&mut shadowed).await {
        Ok(t) => t,
        Err(e) => {
            debug!(user = tenant.name(), error = %e, "bad address header, draining");
            drain(shadowed.into_inner()).await;
            return;
        }
    };

    let remote_addr = match resolve_target(&ctx, &target).await {
        Ok(Resolved::Addr(addr)) => addr,
        Ok(Resolved::Hijack) => {
            hijack(&ctx, &tenant, shadowed).await;
            return;
        }
        Err(e) => {
            debug!(user = tenant.name(), target = %target, error = %e, "target refused");
            return;
        }
    };

    let started = Instant::now();
    let upstream = match dialer::dial(&remote_addr).await {
        Ok(s) => s,
        Err(e) => {
            debug!(user = tenant.name(), addr = remote_addr.as_str(), error = %e, "dial failed");
            return;
        }
    };
    let upstream = CorkedStream::new(upstream, CORK_DELAY);

    match relay(shadowed, upstream).await {
        Ok((up, down)) => tenant.add_traffic(up + down),
        Err(e) => debug!(user = tenant.name(), error = %e, "relay ended with error"),
    }
    tenant.add_time_ms(started.elapsed().as_millis() as i64);
}

enum Resolved {
    Addr(String),
    Hijack,
}

async fn resolve_target(ctx: &ServerContext, target: &Address) -> Result<Resolved, Error> {
    match target {
        Address::Ip(sa) if sa.is_ipv4() => {
            if ctx.policy.is_rejected(sa.ip()) {
                return Err(Error::Blocked);
            }
            Ok(Resolved::Addr(sa.to_string()))
        }
        // IPv6 literals pass through unchecked.
        Address::Ip(sa) => Ok(Resolved::Addr(sa.to_string())),
        Address::Domain(domain, port) => match ctx.resolver.resolve(domain).await? {
            Lookup::Blocked => Ok(Resolved::Hijack),
            Lookup::Ip(ip) => Ok(Resolved::Addr(format!("{}:{}", ip, port))),
        },
    }
}

/// Redirect a blocked session to the configured target, masking the block
/// from the client.
async fn hijack(ctx: &ServerContext, tenant: &Arc<Tenant>, client: AeadStream<TcpStream>) {
    let Some(redirect) = ctx.hijack.as_deref() else {
        debug!(user = tenant.name(), "blocked target and no hijack address configured");
        return;
    };
    let started = Instant::now();
    match dialer::dial(redirect).await {
        Ok(upstream) => {
            let upstream = CorkedStream::new(upstream, CORK_DELAY);
            match relay(client, upstream).await {
                Ok((up, down)) => tenant.add_traffic(up + down),
                Err(e) => debug!(user = tenant.name(), error = %e, "hijack relay ended with error"),
            }
            tenant.add_time_ms(started.elapsed().as_millis() as i64);
        }
        Err(e) => debug!(user = tenant.name(), error = %e, "hijack dial failed"),
    }
}

/// Read the raw socket to EOF without ever answering, so active probes see
/// the same behavior whatever bytes they send.
async fn drain(mut stream: TcpStream) {
    let _ = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await;
}
