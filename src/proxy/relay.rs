//! Bidirectional copy with a bounded half-close linger.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const HALF_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Copy both directions until EOF or error. When one direction finishes, the
/// other gets a bounded grace period to drain; running past the grace is not
/// an error. Returns (client→remote, remote→client) byte counts.
pub async fn relay<A, B>(client: A, remote: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    relay_with_grace(client, remote, HALF_CLOSE_GRACE).await
}

pub(crate) async fn relay_with_grace<A, B>(
    client: A,
    remote: B,
    grace: Duration,
) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);

    let upload = async {
        let n = tokio::io::copy(&mut client_rd, &mut remote_wr).await;
        let _ = remote_wr.shutdown().await;
        n
    };
    let download = async {
        let n = tokio::io::copy(&mut remote_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
        n
    };
    tokio::pin!(upload);
    tokio::pin!(download);

    let (up, down) = tokio::select! {
        up = &mut upload => {
            let down = timeout(grace, &mut download).await.unwrap_or(Ok(0));
            (up, down)
        }
        down = &mut download => {
            let up = timeout(grace, &mut upload).await.unwrap_or(Ok(0));
            (up, down)
        }
    };

    Ok((up?, down?))
}
