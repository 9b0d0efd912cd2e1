use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

mod command;
mod config;
mod gateway;

#[derive(Debug, clap::Parser)]
#[command(name = "auroraproxy", version)]
#[command(about = "Intercept a web application's WebSocket traffic through a local relay.", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    verbose: Verbosity<InfoLevel>,

    /// Profile to read settings from
    #[arg(long, default_value = "default", global = true)]
    profile: String,

    /// Configuration file to use instead of the user config
    #[arg(long, global = true, env = "AURORAPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Host serving the pages and the WebSocket endpoint
    #[arg(long, global = true)]
    origin: Option<String>,

    #[command(subcommand)]
    command: command::Command,
}

fn init_logger_env(verbosity: &Verbosity<InfoLevel>) {
    use tracing::level_filters::LevelFilter;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("AURORAPROXY_LOG")
        .from_env_lossy();

    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(match (verbosity.is_present(), verbosity.is_silent()) {
            (false, _) => env_filter,
            (true, true) => env_filter.add_directive(LevelFilter::OFF.into()),
            (true, false) => {
                let level_filter = match verbosity.log_level_filter() {
                    clap_verbosity_flag::LevelFilter::Off => LevelFilter::OFF,
                    clap_verbosity_flag::LevelFilter::Error => LevelFilter::ERROR,
                    clap_verbosity_flag::LevelFilter::Warn => LevelFilter::WARN,
                    clap_verbosity_flag::LevelFilter::Info => LevelFilter::INFO,
                    clap_verbosity_flag::LevelFilter::Debug => LevelFilter::DEBUG,
                    clap_verbosity_flag::LevelFilter::Trace => LevelFilter::TRACE,
                };
                env_filter.add_directive(level_filter.into())
            }
        })
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger_env(&cli.verbose);

    let config = config::Config::load(cli.config.as_deref())?;
    let mut profile = config.get_profile(&cli.profile);
    if let Some(origin) = &cli.origin {
        profile.origin_host = origin.clone();
    }

    match &cli.command {
        command::Command::Relay(args) => {
            command::relay::execute(args, profile).await?;
        }
        command::Command::Gateway(args) => {
            command::gateway::execute(args, profile).await?;
        }
        command::Command::Serve(args) => {
            command::serve::execute(args, profile).await?;
        }
    }

    Ok(())
}
