//! CONNECT tunnelling: dial the authority, take over the client connection
//! and splice the two together.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tracing::debug;

use super::error::{ProxyError, ProxyResult};
use super::http::{ClientExchange, RequestHead};
use super::relay::relay;
use crate::dial::{Dial, Network};

/// Written verbatim once both legs are up.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

pub async fn handle_connect(
    head: &RequestHead,
    exchange: &mut dyn ClientExchange,
    dialer: &dyn Dial,
) -> ProxyResult<()> {
    let target = head.target.as_str();

    let dest = {
        let client = exchange.request_body()?;
        tokio::select! {
            dialed = dialer.dial(Network::Tcp, target) => {
                dialed.map_err(|source| ProxyError::DialFailed {
                    target: target.to_string(),
                    source,
                })?
            }
            () = client_gone(client) => {
                debug!(target = ?target, "http_connect_client_gone_during_dial");
                return Err(ProxyError::ClientClosed);
            }
        }
    };

    // `dest` is dropped, and closed, on every early return below.
    let Some(hijacker) = exchange.hijacker() else {
        return Err(ProxyError::HijackUnsupported);
    };
    let mut client = hijacker.hijack().map_err(ProxyError::HijackFailed)?;

    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;

    let stats = relay(client, dest).await;
    debug!(
        target = ?target,
        client_to_dest = ?stats.a_to_b,
        dest_to_client = ?stats.b_to_a,
        "http_connect_tunnel_closed"
    );
    Ok(())
}

/// Resolves once the client has closed or errored. Early tunnel bytes from
/// the client are left buffered and stop the watch.
async fn client_gone(client: &mut (dyn AsyncBufRead + Send + Unpin)) {
    match client.fill_buf().await {
        Ok(buf) if !buf.is_empty() => std::future::pending::<()>().await,
        _ => {}
    }
}
