use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "tunproxy",
    about = "Forward proxy that dials through a tunnel's virtual network stack",
    version = env!("TUNPROXY_BUILD_VERSION")
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum TopCommand {
    /// Expose the tunnel as an HTTP proxy with CONNECT support
    ///
    /// Dual-stack HTTP proxy with CONNECT support. Doesn't require elevated privileges.
    HttpProxy(HttpProxyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HttpProxyArgs {
    /// Address to bind the HTTP proxy to
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on for HTTP proxy
    #[arg(short, long, default_value_t = 8000)]
    pub port: u16,

    /// Username for proxy authentication (specify both username and password to enable)
    #[arg(short, long, default_value = "")]
    pub username: String,

    /// Password for proxy authentication (specify both username and password to enable)
    #[arg(short = 'w', long, default_value = "")]
    pub password: String,

    /// Port of the tunnel endpoint
    #[arg(short = 'P', long, default_value_t = 443)]
    pub connect_port: u16,

    /// DNS servers to use inside the tunnel
    #[arg(
        short,
        long,
        default_values_t = default_dns_servers()
    )]
    pub dns: Vec<IpAddr>,

    /// Use IPv6 to reach the tunnel endpoint
    #[arg(short = '6', long)]
    pub ipv6: bool,

    /// Disable IPv4 inside the tunnel
    #[arg(short = 'F', long)]
    pub no_tunnel_ipv4: bool,

    /// Disable IPv6 inside the tunnel
    #[arg(short = 'S', long)]
    pub no_tunnel_ipv6: bool,

    /// SNI address to use for the tunnel connection
    #[arg(short, long, default_value = DEFAULT_SNI)]
    pub sni_address: String,

    /// Keepalive period for the tunnel connection (e.g. 30s, 1m)
    #[arg(short, long, default_value = "30s", value_parser = parse_duration)]
    pub keepalive_period: Duration,

    /// MTU for the tunnel connection
    #[arg(short, long, default_value_t = 1280)]
    pub mtu: u32,

    /// Initial packet size for the tunnel connection
    #[arg(short, long, default_value_t = 1242)]
    pub initial_packet_size: u16,

    /// Delay between reconnect attempts (e.g. 1s, 500ms)
    #[arg(short, long, default_value = "1s", value_parser = parse_duration)]
    pub reconnect_delay: Duration,

    /// Log every proxied request
    #[arg(long)]
    pub access_log: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

pub const DEFAULT_SNI: &str = "consumer-masque.cloudflareclient.com";

fn default_dns_servers() -> Vec<IpAddr> {
    [
        IpAddr::from([9, 9, 9, 9]),
        IpAddr::from([149, 112, 112, 112]),
        IpAddr::from([0x2620, 0xfe, 0, 0, 0, 0, 0, 0xfe]),
        IpAddr::from([0x2620, 0xfe, 0, 0, 0, 0, 0, 0x9]),
    ]
    .to_vec()
}

/// Parse `1h30m`, `30s`, `250ms` style durations.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }
    if value == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {value:?}"))?;
        if digits == 0 {
            return Err(format!("invalid duration {value:?}"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration {value:?}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            other => return Err(format!("unknown duration unit {other:?} in {value:?}")),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }
    Ok(total)
}
