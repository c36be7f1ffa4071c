//! Listener and per-connection request loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::auth::{Credential, PROXY_AUTHORIZATION};
use super::connect::handle_connect;
use super::error::{ProxyError, ProxyResult};
use super::forward::handle_forward;
use super::http::{read_request_head, respond_error, ClientExchange, Http1Exchange, RequestHead};
use super::tls::upstream_connector;
use crate::config::ProxyConfig;
use crate::dial::Dial;
use crate::error::{AppError, Result};

/// Immutable state shared by every connection of one server.
pub struct ProxyState {
    dialer: Arc<dyn Dial>,
    tls: TlsConnector,
    credential: Credential,
    access_log: bool,
}

impl ProxyState {
    pub fn new(
        dialer: Arc<dyn Dial>,
        tls: TlsConnector,
        credential: Credential,
        access_log: bool,
    ) -> Self {
        Self {
            dialer,
            tls,
            credential,
            access_log,
        }
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub async fn bind(config: &ProxyConfig, dialer: Arc<dyn Dial>) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| AppError::Bind { addr, source })?;
        Ok(Self::from_listener(listener, config, dialer, upstream_connector()?))
    }

    /// Serve on an already bound listener. `tls` wraps the dialed stream for
    /// `https://` forward targets.
    pub fn from_listener(
        listener: TcpListener,
        config: &ProxyConfig,
        dialer: Arc<dyn Dial>,
        tls: TlsConnector,
    ) -> Self {
        Self {
            listener,
            state: Arc::new(ProxyState::new(
                dialer,
                tls,
                config.credential.clone(),
                config.access_log,
            )),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the process exits.
    pub async fn run(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Sessions already
    /// running are left to finish on their own.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("HTTP proxy shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => handle_accept(accepted, &self.state),
            }
        }
    }
}

fn handle_accept(accepted: io::Result<(TcpStream, SocketAddr)>, state: &Arc<ProxyState>) {
    match accepted {
        Ok((stream, addr)) => {
            debug!("HTTP connection from {}", addr);
            let _ = stream.set_nodelay(true);
            let state = Arc::clone(state);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, Some(addr), state).await {
                    debug!("HTTP handler error: {}", e);
                }
            });
        }
        Err(e) => {
            warn!("HTTP accept error: {}", e);
        }
    }
}

/// Serve requests from one client connection until it closes, a request asks
/// for close, a response cannot be framed for reuse, or the connection is
/// taken over by a tunnel.
pub async fn serve_connection<S>(
    stream: S,
    peer_addr: Option<SocketAddr>,
    state: Arc<ProxyState>,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = Some(BufReader::new(stream));

    loop {
        let Some(reader) = conn.as_mut() else {
            return Ok(());
        };
        let head = match read_request_head(reader).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(err) => {
                let mut exchange = Http1Exchange::new(&mut conn);
                let _ = respond_error(&mut exchange, &err).await;
                drop(exchange);
                close(&mut conn).await;
                return Err(err);
            }
        };

        if state.access_log {
            info!(
                peer_addr = ?peer_addr,
                method = ?head.method,
                target = ?head.target,
                "proxy_http_access"
            );
        }

        let mut exchange = Http1Exchange::new(&mut conn);
        if head.wants_close() {
            exchange.close_after();
        }

        let keep_alive = match dispatch(&head, &mut exchange, &state).await {
            Ok(()) => !exchange.wants_close(),
            Err(err) => {
                debug!(
                    method = ?head.method,
                    target = ?head.target,
                    error = ?err.to_string(),
                    "proxy_http_request_failed"
                );
                if let Err(e) = respond_error(&mut exchange, &err).await {
                    debug!(error = ?e.to_string(), "proxy_http_error_response_failed");
                }
                false
            }
        };
        drop(exchange);

        if !keep_alive {
            close(&mut conn).await;
            return Ok(());
        }
    }
}

async fn close<S>(conn: &mut Option<BufReader<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(mut conn) = conn.take() {
        let _ = conn.get_mut().shutdown().await;
    }
}

/// Gate the request on credentials, then route it by method.
pub async fn dispatch(
    head: &RequestHead,
    exchange: &mut dyn ClientExchange,
    state: &ProxyState,
) -> ProxyResult<()> {
    if !state.credential.authenticate(head.header(PROXY_AUTHORIZATION)) {
        debug!(method = ?head.method, target = ?head.target, "proxy_auth_rejected");
        return Err(ProxyError::AuthRequired);
    }

    if head.is_connect() {
        handle_connect(head, exchange, state.dialer.as_ref()).await
    } else {
        handle_forward(head, exchange, state.dialer.as_ref(), &state.tls).await
    }
}
