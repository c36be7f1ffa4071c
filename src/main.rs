use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use tunproxy::cli::{Cli, HttpProxyArgs, TopCommand};
use tunproxy::config::{ProxyConfig, TunnelConfig};
use tunproxy::dial::{Dial, DirectDialer};
use tunproxy::logging;
use tunproxy::proxy::ProxyServer;

fn main() {
    let cli = Cli::parse();

    match cli.command {
        TopCommand::HttpProxy(args) => {
            init_logging(&args, cli.verbose);

            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to build tokio runtime: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(run_http_proxy(args)) {
                error!(command = ?"http-proxy", error = ?e.to_string(), "command_failed");
                std::process::exit(1);
            }
        }
    }
}

fn init_logging(args: &HttpProxyArgs, verbose: bool) {
    match &args.log_file {
        Some(path) => {
            if let Err(e) = logging::init_file(path, verbose) {
                eprintln!("failed to open log file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
        None => logging::init_terminal(verbose),
    }
}

async fn run_http_proxy(args: HttpProxyArgs) -> anyhow::Result<()> {
    let proxy_config = ProxyConfig::from_args(&args);
    let tunnel_config = TunnelConfig::from_args(&args);
    tunnel_config.validate()?;

    if !tunnel_config.mtu_supported() {
        warn!("MTU is not the default 1280. This is not supported. Packet loss and other issues may occur.");
    }
    info!(
        endpoint_ipv6 = tunnel_config.endpoint_ipv6,
        connect_port = tunnel_config.connect_port,
        sni = ?tunnel_config.sni_address,
        tunnel_ipv4 = tunnel_config.tunnel_ipv4,
        tunnel_ipv6 = tunnel_config.tunnel_ipv6,
        dns = ?tunnel_config.dns_servers,
        mtu = tunnel_config.mtu,
        keepalive = ?tunnel_config.keepalive_period,
        initial_packet_size = tunnel_config.initial_packet_size,
        reconnect_delay = ?tunnel_config.reconnect_delay,
        "tunnel_settings"
    );
    if proxy_config.credential.is_enabled() {
        info!("Proxy authentication enabled");
    }

    let dialer: Arc<dyn Dial> = Arc::new(DirectDialer::from_config(&tunnel_config));
    let server = ProxyServer::bind(&proxy_config, dialer).await?;
    info!("HTTP proxy listening on {}", server.local_addr()?);

    server
        .serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
