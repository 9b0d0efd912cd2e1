use anyhow::Result;
use tracing::info;

use super::{gateway, relay};
use crate::config::ProfileConfig;

#[derive(Debug, clap::Args)]
pub struct Args {
    #[command(flatten)]
    relay: relay::Args,

    #[command(flatten)]
    gateway: gateway::Args,
}

pub async fn execute(args: &Args, mut profile: ProfileConfig) -> Result<()> {
    args.relay.apply(&mut profile);
    args.gateway.apply(&mut profile);

    info!(
        "Open http://{} in the browser to start",
        profile.gateway_listen
    );

    tokio::select! {
        result = relay::run(&args.relay, &profile) => result,
        result = gateway::run(&profile) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    }
}
