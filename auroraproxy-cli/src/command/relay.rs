use std::net::SocketAddr;

use anyhow::{Context, Result};
use auroraproxy::proxy::{Connector, PlainConnector, TlsConnector};
use auroraproxy::ProxyServer;
use tracing::{info, warn};

use crate::config::ProfileConfig;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Address the local WebSocket relay listens on
    #[arg(long)]
    relay_listen: Option<SocketAddr>,

    /// Port of the upstream WebSocket endpoint
    #[arg(long)]
    upstream_port: Option<u16>,

    /// Resource requested in the upstream handshake
    #[arg(long)]
    ws_path: Option<String>,

    /// Connect to the upstream over plain TCP instead of TLS
    #[arg(long)]
    plain_upstream: bool,
}

impl Args {
    pub fn apply(&self, profile: &mut ProfileConfig) {
        if let Some(addr) = self.relay_listen {
            profile.relay_listen = addr;
        }
        if let Some(port) = self.upstream_port {
            profile.upstream_port = port;
        }
        if let Some(path) = &self.ws_path {
            profile.ws_path = path.clone();
        }
    }
}

pub async fn execute(args: &Args, mut profile: ProfileConfig) -> Result<()> {
    args.apply(&mut profile);

    tokio::select! {
        result = run(args, &profile) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down relay...");
            Ok(())
        }
    }
}

/// Runs the relay until its listener fails.
pub async fn run(args: &Args, profile: &ProfileConfig) -> Result<()> {
    let host = profile.origin_host.as_str();
    let port = profile.upstream_port;

    if args.plain_upstream {
        warn!("Upstream TLS disabled, connecting to {}:{} in plain text", host, port);
        listen(profile, PlainConnector::new(host, port)).await
    } else {
        let connector = TlsConnector::new(host, port).context("Failed to set up TLS")?;
        listen(profile, connector).await
    }
}

async fn listen<C: Connector>(profile: &ProfileConfig, connector: C) -> Result<()> {
    info!(
        "Relaying to wss://{}:{}{}",
        profile.origin_host, profile.upstream_port, profile.ws_path
    );
    let server = ProxyServer::bind(profile.relay_listen, profile.session_config(), connector)
        .await
        .with_context(|| format!("Failed to bind relay on {}", profile.relay_listen))?;
    server.run().await.context("WebSocket relay stopped")
}
