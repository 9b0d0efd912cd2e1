//! WebSocket relay core: an RFC 6455 frame codec and a proxy session that
//! pairs a local plaintext client with a TLS upstream endpoint.

pub mod proxy;
pub mod transport;

pub use proxy::{ProxyServer, Session, SessionConfig, SessionError};
pub use transport::{Frame, FrameCodec, FrameError, Opcode};
