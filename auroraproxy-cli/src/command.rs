pub mod gateway;
pub mod relay;
pub mod serve;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the WebSocket relay between the local client and the origin
    Relay(relay::Args),

    /// Run the HTTP gateway that serves rewritten origin pages
    Gateway(gateway::Args),

    /// Run the gateway and the relay together
    Serve(serve::Args),
}
