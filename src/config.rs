//! Plain configuration values derived from the command line.
//!
//! `ProxyConfig` is consumed by the proxy core. `TunnelConfig` is carried
//! through to the tunnel collaborator; the core never interprets it.

use std::net::IpAddr;
use std::time::Duration;

use crate::cli::HttpProxyArgs;
use crate::error::{AppError, Result};
use crate::proxy::auth::Credential;

/// The only MTU the tunnel transport is known to work with.
pub const SUPPORTED_MTU: u32 = 1280;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind: String,
    pub port: u16,
    pub credential: Credential,
    pub access_log: bool,
}

impl ProxyConfig {
    #[must_use]
    pub fn from_args(args: &HttpProxyArgs) -> Self {
        Self {
            bind: args.bind.clone(),
            port: args.port,
            credential: Credential::basic(&args.username, &args.password),
            access_log: args.access_log,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        join_host_port(&self.bind, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Reach the tunnel endpoint over IPv6 instead of IPv4.
    pub endpoint_ipv6: bool,
    pub connect_port: u16,
    pub sni_address: String,
    pub tunnel_ipv4: bool,
    pub tunnel_ipv6: bool,
    pub dns_servers: Vec<IpAddr>,
    pub mtu: u32,
    pub keepalive_period: Duration,
    pub initial_packet_size: u16,
    pub reconnect_delay: Duration,
}

impl TunnelConfig {
    #[must_use]
    pub fn from_args(args: &HttpProxyArgs) -> Self {
        Self {
            endpoint_ipv6: args.ipv6,
            connect_port: args.connect_port,
            sni_address: args.sni_address.clone(),
            tunnel_ipv4: !args.no_tunnel_ipv4,
            tunnel_ipv6: !args.no_tunnel_ipv6,
            dns_servers: args.dns.clone(),
            mtu: args.mtu,
            keepalive_period: args.keepalive_period,
            initial_packet_size: args.initial_packet_size,
            reconnect_delay: args.reconnect_delay,
        }
    }

    /// MTU values other than [`SUPPORTED_MTU`] are accepted but unsupported.
    #[must_use]
    pub fn mtu_supported(&self) -> bool {
        self.mtu == SUPPORTED_MTU
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tunnel_ipv4 && !self.tunnel_ipv6 {
            return Err(AppError::Config(
                "IPv4 and IPv6 are both disabled inside the tunnel".to_string(),
            ));
        }
        if self.mtu == 0 {
            return Err(AppError::Config("MTU must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[must_use]
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
