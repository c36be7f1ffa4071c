//! In-process dialer and response sink used by the proxy tests.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    Chain, DuplexStream, ReadBuf,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::http::{copy_body, parse_request_head, ClientExchange, Header, Hijacker};
use super::tls::connector_with_roots;
use crate::dial::{BoxedStream, Dial, Network};

pub(crate) enum Route {
    /// Destination echoes every byte back.
    Echo,
    /// Dial fails with `ConnectionRefused`.
    Refuse,
    /// Destination reads one request, answers with these bytes and closes.
    Http(Vec<u8>),
    /// Like `Http`, behind a TLS handshake.
    Https(TlsAcceptor, Vec<u8>),
    /// Dial never completes.
    Hang,
}

#[derive(Default)]
struct Counters {
    dials: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    cancelled: AtomicUsize,
}

pub(crate) struct StubDialer {
    routes: HashMap<String, Route>,
    counters: Arc<Counters>,
    dialed: Mutex<Vec<(Network, String)>>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl StubDialer {
    pub(crate) fn new() -> Self {
        Self {
            routes: HashMap::new(),
            counters: Arc::new(Counters::default()),
            dialed: Mutex::new(Vec::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn route(mut self, address: &str, route: Route) -> Self {
        self.routes.insert(address.to_string(), route);
        self
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.counters.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled(&self) -> usize {
        self.counters.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn dialed(&self) -> Vec<(Network, String)> {
        self.dialed.lock().unwrap().clone()
    }

    /// Raw bytes of every request an `Http` destination received.
    pub(crate) fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dial for StubDialer {
    async fn dial(&self, network: Network, address: &str) -> io::Result<BoxedStream> {
        self.counters.dials.fetch_add(1, Ordering::SeqCst);
        self.dialed
            .lock()
            .unwrap()
            .push((network, address.to_string()));

        match self.routes.get(address) {
            Some(Route::Echo) => {
                let (near, far) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    let (mut r, mut w) = tokio::io::split(far);
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
                Ok(Box::new(CountingStream::new(near, self.counters.clone())))
            }
            Some(Route::Http(response)) => {
                let (near, far) = tokio::io::duplex(64 * 1024);
                tokio::spawn(serve_one_request(
                    far,
                    response.clone(),
                    self.requests.clone(),
                ));
                Ok(Box::new(CountingStream::new(near, self.counters.clone())))
            }
            Some(Route::Https(acceptor, response)) => {
                let (near, far) = tokio::io::duplex(64 * 1024);
                let acceptor = acceptor.clone();
                let response = response.clone();
                let requests = self.requests.clone();
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(far).await {
                        serve_one_request(tls, response, requests).await;
                    }
                });
                Ok(Box::new(CountingStream::new(near, self.counters.clone())))
            }
            Some(Route::Hang) => {
                let _guard = CancelGuard(self.counters.clone());
                std::future::pending::<()>().await;
                Err(io::Error::other("hanging dial resolved"))
            }
            Some(Route::Refuse) | None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("connection refused: {address}"),
            )),
        }
    }
}

async fn serve_one_request<S>(stream: S, response: Vec<u8>, requests: Arc<Mutex<Vec<Vec<u8>>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    loop {
        let start = raw.len();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if &raw[start..] == b"\r\n" {
            break;
        }
    }

    let Ok(head) = parse_request_head(&raw) else {
        return;
    };
    if copy_body(&mut reader, &mut raw, head.body_mode()).await.is_err() {
        return;
    }
    requests.lock().unwrap().push(raw);

    let stream = reader.get_mut();
    let _ = stream.write_all(&response).await;
    let _ = stream.shutdown().await;
}

/// Server acceptor with a fresh self-signed certificate for `host`, and a
/// client connector that trusts only that certificate.
pub(crate) fn tls_pair(host: &str) -> (TlsAcceptor, TlsConnector) {
    let certified = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let server = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.clone()], key)
    .unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert).unwrap();
    (
        TlsAcceptor::from(Arc::new(server)),
        connector_with_roots(roots).unwrap(),
    )
}

/// Connector for tests that never reach a TLS upstream.
pub(crate) fn plain_connector() -> TlsConnector {
    connector_with_roots(RootCertStore::empty()).unwrap()
}

struct CancelGuard(Arc<Counters>);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Stream that counts how many destination connections are open.
struct CountingStream {
    inner: DuplexStream,
    counters: Arc<Counters>,
}

impl CountingStream {
    fn new(inner: DuplexStream, counters: Arc<Counters>) -> Self {
        counters.opened.fetch_add(1, Ordering::SeqCst);
        Self { inner, counters }
    }
}

impl Drop for CountingStream {
    fn drop(&mut self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Response sink that records what a handler wrote. It cannot hand out the
/// connection: `hijacker()` is `None`, or with [`RecordingExchange::failing_hijack`]
/// a hijacker whose `hijack()` fails.
///
/// The request body is the given bytes followed by a stream that never ends,
/// so the client looks connected for the whole test.
pub(crate) struct RecordingExchange {
    body: BufReader<Chain<Cursor<Vec<u8>>, DuplexStream>>,
    _client: DuplexStream,
    pub(crate) status: Option<u16>,
    pub(crate) reason: String,
    pub(crate) headers: Vec<Header>,
    pub(crate) written: Vec<u8>,
    pub(crate) continued: bool,
    pub(crate) closing: bool,
    hijack_fails: bool,
}

impl RecordingExchange {
    pub(crate) fn new() -> Self {
        Self::with_body(Vec::new())
    }

    pub(crate) fn with_body(body: impl Into<Vec<u8>>) -> Self {
        let (client, open) = tokio::io::duplex(64);
        Self {
            body: BufReader::new(Cursor::new(body.into()).chain(open)),
            _client: client,
            status: None,
            reason: String::new(),
            headers: Vec::new(),
            written: Vec::new(),
            continued: false,
            closing: false,
            hijack_fails: false,
        }
    }

    pub(crate) fn failing_hijack() -> Self {
        Self {
            hijack_fails: true,
            ..Self::new()
        }
    }
}

impl Hijacker for RecordingExchange {
    fn hijack(&mut self) -> io::Result<BoxedStream> {
        Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection already gone",
        ))
    }
}

#[async_trait]
impl ClientExchange for RecordingExchange {
    fn request_body(&mut self) -> io::Result<&mut (dyn AsyncBufRead + Send + Unpin)> {
        Ok(&mut self.body)
    }

    async fn write_continue(&mut self) -> io::Result<()> {
        self.continued = true;
        Ok(())
    }

    async fn write_head(
        &mut self,
        status: u16,
        reason: &str,
        headers: &[Header],
    ) -> io::Result<()> {
        if self.status.is_some() {
            return Err(io::Error::other("response head already written"));
        }
        self.status = Some(status);
        self.reason = reason.to_string();
        self.headers = headers.to_vec();
        Ok(())
    }

    fn response_body(&mut self) -> io::Result<&mut (dyn AsyncWrite + Send + Unpin)> {
        Ok(&mut self.written)
    }

    fn is_committed(&self) -> bool {
        self.status.is_some()
    }

    fn close_after(&mut self) {
        self.closing = true;
    }

    fn hijacker(&mut self) -> Option<&mut dyn Hijacker> {
        if self.hijack_fails {
            Some(self)
        } else {
            None
        }
    }
}
