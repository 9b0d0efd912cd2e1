use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, error, info, warn};

use super::session::{Session, SessionConfig};
use super::upstream::Connector;

/// Downstream listener. Clients are served one at a time: the next
/// connection is accepted only after the current session has closed.
pub struct ProxyServer<C: Connector> {
    listener: TcpListener,
    config: Arc<SessionConfig>,
    connector: Arc<C>,
}

impl<C: Connector> ProxyServer<C> {
    pub async fn bind(addr: impl ToSocketAddrs, config: SessionConfig, connector: C) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, config, connector))
    }

    pub fn from_listener(listener: TcpListener, config: SessionConfig, connector: C) -> Self {
        Self {
            listener,
            config: Arc::new(config),
            connector: Arc::new(connector),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves clients until the task is dropped. Session failures are logged
    /// and the listener is re-armed.
    pub async fn run(self) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!("WebSocket relay listening on ws://{}", local_addr);

        loop {
            debug!("Awaiting client on {}", local_addr);
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept client: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            info!("Client {} connected", peer);
            let session = Session::new(self.config.clone(), self.connector.clone());
            match session.run(stream).await {
                Ok(()) => info!("Session with {} closed", peer),
                Err(e) => warn!("Session with {} failed: {}", peer, e),
            }
        }
    }
}
