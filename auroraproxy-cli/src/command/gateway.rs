use std::net::SocketAddr;

use anyhow::Result;
use tracing::info;

use crate::config::ProfileConfig;
use crate::gateway::Gateway;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Address the page gateway listens on
    #[arg(long)]
    gateway_listen: Option<SocketAddr>,
}

impl Args {
    pub fn apply(&self, profile: &mut ProfileConfig) {
        if let Some(addr) = self.gateway_listen {
            profile.gateway_listen = addr;
        }
    }
}

pub async fn execute(args: &Args, mut profile: ProfileConfig) -> Result<()> {
    args.apply(&mut profile);

    tokio::select! {
        result = run(&profile) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down gateway...");
            Ok(())
        }
    }
}

/// Serves rewritten origin pages until the listener fails.
pub async fn run(profile: &ProfileConfig) -> Result<()> {
    info!("Serving pages from https://{}", profile.origin_host);
    Gateway::new(profile)?.bind(profile.gateway_listen).await
}
