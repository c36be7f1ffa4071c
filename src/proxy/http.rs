//! HTTP/1.x wire handling for the proxy: request/response heads, body
//! framing, and the client-facing exchange a handler writes its response to.

use std::io;

use anyhow::Context as _;
use async_trait::async_trait;
use http::StatusCode;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use super::auth::PROXY_AUTHENTICATE_CHALLENGE;
use super::error::{ProxyError, ProxyResult};
use crate::dial::BoxedStream;

const MAX_HEAD_BYTES: usize = 32 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as sent: absolute URL, authority or path.
    pub target: String,
    pub minor_version: u8,
    pub headers: Vec<Header>,
}

impl RequestHead {
    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    #[must_use]
    pub fn version(&self) -> &'static str {
        if self.minor_version == 0 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        header_value(&self.headers, name)
    }

    #[must_use]
    pub fn body_mode(&self) -> BodyMode {
        request_body_mode(&self.headers)
    }

    /// Whether the client asked for the connection to end after this request.
    #[must_use]
    pub fn wants_close(&self) -> bool {
        if header_contains_token(&self.headers, "connection", "close")
            || header_contains_token(&self.headers, "proxy-connection", "close")
        {
            return true;
        }
        self.minor_version == 0
            && !header_contains_token(&self.headers, "connection", "keep-alive")
            && !header_contains_token(&self.headers, "proxy-connection", "keep-alive")
    }

    #[must_use]
    pub fn expects_continue(&self) -> bool {
        header_contains_token(&self.headers, "expect", "100-continue")
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    /// Body runs until the sender closes the connection.
    CloseDelimited,
}

/// Read the next request head. `Ok(None)` means the client closed cleanly
/// between requests.
pub async fn read_request_head<R>(reader: &mut R) -> ProxyResult<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let bytes = match read_head_bytes(reader).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            return Err(ProxyError::MalformedRequest(e.to_string()))
        }
        Err(e) => return Err(ProxyError::Io(e)),
    };
    parse_request_head(&bytes).map(Some)
}

pub fn parse_request_head(bytes: &[u8]) -> ProxyResult<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(bytes) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::MalformedRequest("incomplete request head".into()))
        }
        Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
    }

    let method = req
        .method
        .ok_or_else(|| ProxyError::MalformedRequest("missing method".into()))?;
    let target = req
        .path
        .ok_or_else(|| ProxyError::MalformedRequest("missing request target".into()))?;
    let minor_version = req
        .version
        .ok_or_else(|| ProxyError::MalformedRequest("missing HTTP version".into()))?;

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        minor_version,
        headers: req
            .headers
            .iter()
            .map(|h| Header::new(h.name, h.value))
            .collect(),
    })
}

pub async fn read_response_head<R>(reader: &mut R) -> io::Result<ResponseHead>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let bytes = read_head_bytes(reader).await?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "upstream closed before sending a response",
        )
    })?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(&bytes) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "incomplete response head",
            ))
        }
        Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }

    Ok(ResponseHead {
        status: resp.code.unwrap_or(0),
        reason: resp.reason.unwrap_or_default().to_string(),
        headers: resp
            .headers
            .iter()
            .map(|h| Header::new(h.name, h.value))
            .collect(),
    })
}

/// Collect one head up to and including the blank line. Leading blank lines
/// are skipped.
async fn read_head_bytes<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let remaining = MAX_HEAD_BYTES.saturating_sub(head.len());
        if remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "HTTP head too large"));
        }

        let start = head.len();
        let mut limited = (&mut *reader).take(remaining as u64);
        let read = limited.read_until(b'\n', &mut head).await?;
        if read == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF while reading headers",
            ));
        }

        let line = &head[start..];
        if !line.ends_with(b"\n") {
            continue;
        }
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
    }
}

#[must_use]
pub fn request_body_mode(headers: &[Header]) -> BodyMode {
    if header_contains_token(headers, "transfer-encoding", "chunked") {
        BodyMode::Chunked
    } else if let Some(len) = parse_content_length(headers) {
        BodyMode::ContentLength(len)
    } else {
        BodyMode::None
    }
}

#[must_use]
pub fn response_body_mode(status: u16, request_method: &str, headers: &[Header]) -> BodyMode {
    let no_body = request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304;

    if no_body {
        BodyMode::None
    } else if header_contains_token(headers, "transfer-encoding", "chunked") {
        BodyMode::Chunked
    } else if let Some(len) = parse_content_length(headers) {
        BodyMode::ContentLength(len)
    } else {
        BodyMode::CloseDelimited
    }
}

fn parse_content_length(headers: &[Header]) -> Option<u64> {
    header_value(headers, "content-length")
        .and_then(|value| std::str::from_utf8(value).ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

#[must_use]
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_slice())
}

#[must_use]
pub fn header_contains_token(headers: &[Header], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case(name))
        .filter_map(|h| std::str::from_utf8(&h.value).ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Copy one message body from `reader` to `writer`, keeping its framing.
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, mode: BodyMode) -> anyhow::Result<u64>
where
    R: AsyncBufRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    match mode {
        BodyMode::None => Ok(0),
        BodyMode::ContentLength(len) => copy_exact_bytes(reader, writer, len).await,
        BodyMode::Chunked => copy_chunked_body(reader, writer).await,
        BodyMode::CloseDelimited => Ok(tokio::io::copy(reader, writer).await?),
    }
}

async fn copy_exact_bytes<R, W>(reader: &mut R, writer: &mut W, len: u64) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut limited = (&mut *reader).take(len);
    let copied = tokio::io::copy(&mut limited, writer).await?;
    if copied != len {
        anyhow::bail!("incomplete body forwarding: expected {len} bytes, copied {copied}");
    }
    Ok(copied)
}

/// Chunked bodies are copied frame by frame: size line, data, CRLF, until the
/// zero-size chunk and its trailer section.
async fn copy_chunked_body<R, W>(reader: &mut R, writer: &mut W) -> anyhow::Result<u64>
where
    R: AsyncBufRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    let mut line = Vec::new();
    loop {
        read_line_limited(reader, &mut line)
            .await
            .context("reading chunk size")?;
        writer.write_all(&line).await?;
        let size = parse_chunk_size(&line)?;

        if size == 0 {
            break;
        }
        total += copy_exact_bytes(reader, writer, size).await?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            anyhow::bail!("chunk data not followed by CRLF");
        }
        writer.write_all(&crlf).await?;
    }

    // Trailer section, ended by an empty line.
    loop {
        read_line_limited(reader, &mut line)
            .await
            .context("reading chunk trailers")?;
        writer.write_all(&line).await?;
        if line == b"\r\n" || line == b"\n" {
            return Ok(total);
        }
    }
}

/// Replace `line` with the next LF-terminated line, refusing lines longer
/// than a request head may be.
async fn read_line_limited<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    line.clear();
    let read = (&mut *reader)
        .take(MAX_HEAD_BYTES as u64)
        .read_until(b'\n', line)
        .await?;
    match line.last() {
        Some(b'\n') => Ok(()),
        _ if read == 0 => Err(io::ErrorKind::UnexpectedEof.into()),
        _ if read >= MAX_HEAD_BYTES => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "chunked framing line too long",
        )),
        _ => Err(io::ErrorKind::UnexpectedEof.into()),
    }
}

fn parse_chunk_size(line: &[u8]) -> anyhow::Result<u64> {
    let digits = line
        .split(|&b| b == b';' || b == b'\r' || b == b'\n')
        .next()
        .unwrap_or_default();
    let digits = std::str::from_utf8(digits)
        .map(str::trim)
        .with_context(|| format!("non-ASCII chunk size {:?}", String::from_utf8_lossy(line)))?;
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid chunk size {digits:?}"))
}

/// Client-facing half of one proxied request: the request body comes in
/// through it and the response goes out through it.
///
/// Sinks that sit on a real connection can also give that connection away as
/// a raw byte stream; [`ClientExchange::hijacker`] reports whether this one can.
#[async_trait]
pub trait ClientExchange: Send {
    /// Client bytes following the request head.
    fn request_body(&mut self) -> io::Result<&mut (dyn AsyncBufRead + Send + Unpin)>;

    /// Interim `100 Continue`; does not commit the response.
    async fn write_continue(&mut self) -> io::Result<()>;

    /// Commit status line and headers. Only the first call may succeed.
    async fn write_head(&mut self, status: u16, reason: &str, headers: &[Header])
        -> io::Result<()>;

    fn response_body(&mut self) -> io::Result<&mut (dyn AsyncWrite + Send + Unpin)>;

    fn is_committed(&self) -> bool;

    /// End the client connection once this exchange is done.
    fn close_after(&mut self);

    fn hijacker(&mut self) -> Option<&mut dyn Hijacker>;
}

pub trait Hijacker: Send {
    /// Take over the client connection. Bytes already buffered from the
    /// client stay readable on the returned stream.
    fn hijack(&mut self) -> io::Result<BoxedStream>;
}

/// Exchange over a live HTTP/1.x client connection.
pub struct Http1Exchange<'c, S> {
    conn: &'c mut Option<BufReader<S>>,
    committed: bool,
    close: bool,
}

impl<'c, S> Http1Exchange<'c, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(conn: &'c mut Option<BufReader<S>>) -> Self {
        Self {
            conn,
            committed: false,
            close: false,
        }
    }

    /// The session must stop reading requests after this exchange.
    #[must_use]
    pub fn wants_close(&self) -> bool {
        self.close || self.conn.is_none()
    }

    fn conn_mut(&mut self) -> io::Result<&mut BufReader<S>> {
        self.conn.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "client connection was hijacked")
        })
    }
}

#[async_trait]
impl<'c, S> ClientExchange for Http1Exchange<'c, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn request_body(&mut self) -> io::Result<&mut (dyn AsyncBufRead + Send + Unpin)> {
        Ok(self.conn_mut()?)
    }

    async fn write_continue(&mut self) -> io::Result<()> {
        if self.committed {
            return Ok(());
        }
        let conn = self.conn_mut()?;
        conn.get_mut()
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .await?;
        conn.get_mut().flush().await
    }

    async fn write_head(
        &mut self,
        status: u16,
        reason: &str,
        headers: &[Header],
    ) -> io::Result<()> {
        if self.committed {
            return Err(io::Error::other("response head already written"));
        }
        self.committed = true;

        let reason = if reason.is_empty() {
            StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("")
        } else {
            reason
        };

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
        for header in headers {
            head.extend_from_slice(header.name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(&header.value);
            head.extend_from_slice(b"\r\n");
        }
        if self.close && !header_contains_token(headers, "connection", "close") {
            head.extend_from_slice(b"Connection: close\r\n");
        }
        head.extend_from_slice(b"\r\n");

        self.conn_mut()?.get_mut().write_all(&head).await
    }

    fn response_body(&mut self) -> io::Result<&mut (dyn AsyncWrite + Send + Unpin)> {
        Ok(self.conn_mut()?.get_mut())
    }

    fn is_committed(&self) -> bool {
        self.committed
    }

    fn close_after(&mut self) {
        self.close = true;
    }

    fn hijacker(&mut self) -> Option<&mut dyn Hijacker> {
        Some(self)
    }
}

impl<'c, S> Hijacker for Http1Exchange<'c, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn hijack(&mut self) -> io::Result<BoxedStream> {
        if self.committed {
            return Err(io::Error::other("response already committed"));
        }
        let conn = self.conn.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "client connection already hijacked")
        })?;
        self.committed = true;
        Ok(Box::new(conn))
    }
}

/// Answer `err` with its status and a plain-text body. Returns `false` when
/// nothing was written (no status for this error, or response already
/// committed).
pub async fn respond_error(
    exchange: &mut dyn ClientExchange,
    err: &ProxyError,
) -> io::Result<bool> {
    let Some(status) = err.status() else {
        return Ok(false);
    };
    if exchange.is_committed() {
        return Ok(false);
    }

    let body = format!("{}\n", err.public_message());
    let mut headers = Vec::with_capacity(4);
    if matches!(err, ProxyError::AuthRequired) {
        headers.push(Header::new("Proxy-Authenticate", PROXY_AUTHENTICATE_CHALLENGE));
    }
    headers.push(Header::new("Content-Type", "text/plain; charset=utf-8"));
    headers.push(Header::new("X-Content-Type-Options", "nosniff"));
    headers.push(Header::new("Content-Length", body.len().to_string()));

    exchange.close_after();
    exchange
        .write_head(status.as_u16(), status.canonical_reason().unwrap_or(""), &headers)
        .await?;
    let writer = exchange.response_body()?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(true)
}
