//! Forwarding of absolute-form `http://` and `https://` requests.

use std::io;

use http::Uri;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::error::{ProxyError, ProxyResult};
use super::http::{
    copy_body, header_contains_token, read_response_head, response_body_mode, BodyMode,
    ClientExchange, RequestHead,
};
use super::tls::server_name;
use crate::config::join_host_port;
use crate::dial::{BoxedStream, Dial, Network};

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_HTTPS_PORT: u16 = 443;

/// Where an absolute-form request goes and how it is written upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Upstream speaks TLS (`https://`).
    pub tls: bool,
    /// Host without brackets; the TLS server name.
    pub host: String,
    /// `host:port` handed to the dialer.
    pub dial_address: String,
    /// Authority as it appeared in the URL, without userinfo.
    pub host_header: String,
    /// Origin-form target for the upstream request line.
    pub path_and_query: String,
}

impl ForwardTarget {
    pub fn parse(target: &str) -> ProxyResult<Self> {
        let uri: Uri = target
            .parse()
            .map_err(|e| ProxyError::MalformedRequest(format!("invalid request target: {e}")))?;

        let tls = match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => false,
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => true,
            Some(scheme) => {
                return Err(ProxyError::MalformedRequest(format!(
                    "unsupported scheme {scheme:?}"
                )))
            }
            None => {
                return Err(ProxyError::MalformedRequest(
                    "request target is not an absolute URL".to_string(),
                ))
            }
        };

        let authority = uri
            .authority()
            .ok_or_else(|| ProxyError::MalformedRequest("missing authority".to_string()))?;
        let host = authority.host();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(ProxyError::MalformedRequest("empty host".to_string()));
        }
        let port = authority.port_u16().unwrap_or(if tls {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        });

        let host_header = authority
            .as_str()
            .rsplit('@')
            .next()
            .unwrap_or(authority.as_str())
            .to_string();
        let path_and_query = match uri.path_and_query().map(|p| p.as_str()) {
            Some(p) if !p.is_empty() && p != "*" => p.to_string(),
            _ => "/".to_string(),
        };

        Ok(Self {
            tls,
            host: host.to_string(),
            dial_address: join_host_port(host, port),
            host_header,
            path_and_query,
        })
    }
}

/// Request head as sent upstream: origin-form target, `Host` taken from the
/// URL authority, every other client header verbatim and in order.
fn upstream_request_head(head: &RequestHead, target: &ForwardTarget) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(
        format!("{} {} {}\r\n", head.method, target.path_and_query, head.version()).as_bytes(),
    );
    out.extend_from_slice(format!("Host: {}\r\n", target.host_header).as_bytes());
    for header in head.headers.iter().filter(|h| !h.name.eq_ignore_ascii_case("host")) {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(&header.value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub async fn handle_forward(
    head: &RequestHead,
    exchange: &mut dyn ClientExchange,
    dialer: &dyn Dial,
    tls: &TlsConnector,
) -> ProxyResult<()> {
    let target = ForwardTarget::parse(&head.target)?;
    let upstream_err = |source: io::Error| ProxyError::UpstreamUnreachable {
        target: target.dial_address.clone(),
        source,
    };

    let upstream = dialer
        .dial(Network::Tcp, &target.dial_address)
        .await
        .map_err(upstream_err)?;
    let upstream: BoxedStream = if target.tls {
        let name = server_name(&target.host).map_err(upstream_err)?;
        Box::new(tls.connect(name, upstream).await.map_err(upstream_err)?)
    } else {
        upstream
    };
    let mut upstream = BufReader::new(upstream);

    upstream
        .get_mut()
        .write_all(&upstream_request_head(head, &target))
        .await
        .map_err(upstream_err)?;

    let request_body = head.body_mode();
    if request_body != BodyMode::None {
        if head.expects_continue() {
            exchange.write_continue().await?;
        }
        let client = exchange.request_body()?;
        copy_body(client, upstream.get_mut(), request_body)
            .await
            .map_err(|e| upstream_err(io::Error::other(format!("{e:#}"))))?;
    }
    upstream.get_mut().flush().await.map_err(upstream_err)?;

    let response = loop {
        let response = read_response_head(&mut upstream).await.map_err(upstream_err)?;
        if (100..200).contains(&response.status) && response.status != 101 {
            continue;
        }
        break response;
    };

    let response_body = response_body_mode(response.status, &head.method, &response.headers);
    if response_body == BodyMode::CloseDelimited
        || response.status == 101
        || header_contains_token(&response.headers, "connection", "close")
        || head.wants_close()
    {
        exchange.close_after();
    }

    exchange
        .write_head(response.status, &response.reason, &response.headers)
        .await?;
    let writer = exchange.response_body()?;
    let copied = copy_body(&mut upstream, writer, response_body)
        .await
        .map_err(|e| ProxyError::Io(io::Error::other(format!("{e:#}"))))?;
    writer.flush().await?;

    debug!(
        target = ?target.dial_address,
        status = response.status,
        body_bytes = copied,
        "http_forward_complete"
    );
    Ok(())
}
