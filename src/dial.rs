//! Outbound dial capability.
//!
//! The proxy never opens destination sockets on its own. Every connection is
//! requested from a [`Dial`] implementation handed in at construction time: a
//! tunnel crate implements it over its virtual network stack, and
//! [`DirectDialer`] implements it over the host stack using the tunnel's DNS
//! and address-family settings.
//!
//! Cancellation is the caller dropping the future returned by [`Dial::dial`].

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::TunnelConfig;

/// A duplex byte stream handed out by a dialer or taken over from a client.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Network argument of a dial, mirroring `tcp`, `tcp4` and `tcp6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }

    #[must_use]
    pub fn accepts(self, ip: &IpAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => ip.is_ipv4(),
            Network::Tcp6 => ip.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens connections to `host:port` addresses.
///
/// Implementations must be safe to call concurrently from any number of
/// sessions; each call is independent.
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, network: Network, address: &str) -> io::Result<BoxedStream>;
}

/// Dials over the host network stack.
///
/// Names are resolved with the configured DNS servers when there are any,
/// otherwise with the system resolver. Addresses of a disabled family are
/// never dialed and IPv4 is tried first.
pub struct DirectDialer {
    resolver: Option<TokioAsyncResolver>,
    allow_ipv4: bool,
    allow_ipv6: bool,
}

impl DirectDialer {
    #[must_use]
    pub fn system() -> Self {
        Self {
            resolver: None,
            allow_ipv4: true,
            allow_ipv6: true,
        }
    }

    #[must_use]
    pub fn with_dns_servers(dns_servers: &[IpAddr]) -> Self {
        let resolver = if dns_servers.is_empty() {
            None
        } else {
            let nameservers = NameServerConfigGroup::from_ips_clear(dns_servers, 53, true);
            let config = ResolverConfig::from_parts(None, vec![], nameservers);
            Some(TokioAsyncResolver::tokio(config, ResolverOpts::default()))
        };
        Self {
            resolver,
            allow_ipv4: true,
            allow_ipv6: true,
        }
    }

    #[must_use]
    pub fn from_config(cfg: &TunnelConfig) -> Self {
        let mut dialer = Self::with_dns_servers(&cfg.dns_servers);
        dialer.allow_ipv4 = cfg.tunnel_ipv4;
        dialer.allow_ipv6 = cfg.tunnel_ipv6;
        dialer
    }

    fn family_allowed(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => self.allow_ipv4,
            IpAddr::V6(_) => self.allow_ipv6,
        }
    }

    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs: Vec<SocketAddr> = match &self.resolver {
            Some(resolver) => resolver
                .lookup_ip(host)
                .await
                .map_err(|e| io::Error::other(format!("DNS lookup failed for {host}: {e}")))?
                .into_iter()
                .map(|ip| SocketAddr::new(ip, port))
                .collect(),
            None => tokio::net::lookup_host((host, port)).await?.collect(),
        };
        Ok(addrs)
    }
}

#[async_trait]
impl Dial for DirectDialer {
    async fn dial(&self, network: Network, address: &str) -> io::Result<BoxedStream> {
        let (host, port) = split_host_port(address)?;
        let mut candidates: Vec<SocketAddr> = self
            .resolve(host, port)
            .await?
            .into_iter()
            .filter(|addr| network.accepts(&addr.ip()) && self.family_allowed(&addr.ip()))
            .collect();
        // Stable sort keeps resolver order within each family.
        candidates.sort_by_key(|addr| addr.is_ipv6());

        if candidates.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no usable {network} address for {address}"),
            ));
        }

        let mut last_error = None;
        for addr in candidates {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(address = ?address, resolved = ?addr, "direct_dial_connected");
                    return Ok(Box::new(stream));
                }
                Err(error) => {
                    debug!(
                        address = ?address,
                        resolved = ?addr,
                        error = ?error.to_string(),
                        "direct_dial_attempt_failed"
                    );
                    last_error = Some(error);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no address dialed")))
    }
}

/// Split `host:port` or `[v6]:port`. The port is mandatory.
pub fn split_host_port(address: &str) -> io::Result<(&str, u16)> {
    let invalid = |reason: &str| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid address {address:?}: {reason}"),
        )
    };

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| invalid("missing ']'"))?;
        let port = after.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
        (host, port)
    } else {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.contains(':') {
            return Err(invalid("IPv6 hosts must be bracketed"));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
    Ok((host, port))
}
