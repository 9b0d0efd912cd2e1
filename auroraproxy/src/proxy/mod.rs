pub mod handshake;
pub mod server;
pub mod session;
pub mod upstream;

pub use server::ProxyServer;
pub use session::{Leg, Phase, Readiness, ReadyFlags, Session, SessionConfig, SessionError};
pub use upstream::{ConnectError, Connector, PlainConnector, TlsConnector};
