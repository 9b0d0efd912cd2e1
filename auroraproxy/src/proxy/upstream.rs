use std::future::Future;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_native_tls::{native_tls, TlsStream};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to connect to {addr}: {source}")]
    Io { addr: String, source: io::Error },

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        source: native_tls::Error,
    },
}

/// Opens the transport to the upstream WebSocket endpoint.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Stream, ConnectError>> + Send;
}

/// TCP + TLS connector.
///
/// Certificate and hostname validation are disabled: the upstream endpoint is
/// accepted whatever chain it presents.
#[derive(Clone)]
pub struct TlsConnector {
    host: String,
    port: u16,
    inner: tokio_native_tls::TlsConnector,
}

impl TlsConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConnectError> {
        let host = host.into();
        let inner = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|source| ConnectError::Tls {
                host: host.clone(),
                source,
            })?;

        Ok(Self {
            host,
            port,
            inner: inner.into(),
        })
    }
}

impl Connector for TlsConnector {
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self) -> Result<Self::Stream, ConnectError> {
        let tcp = connect_tcp(&self.host, self.port).await?;
        debug!("TLS handshake with {}", self.host);
        self.inner
            .connect(&self.host, tcp)
            .await
            .map_err(|source| ConnectError::Tls {
                host: self.host.clone(),
                source,
            })
    }
}

/// Plain TCP connector for upstream servers that do not speak TLS.
#[derive(Debug, Clone)]
pub struct PlainConnector {
    host: String,
    port: u16,
}

impl PlainConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connector for PlainConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<Self::Stream, ConnectError> {
        connect_tcp(&self.host, self.port).await
    }
}

async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, ConnectError> {
    let addr = format!("{host}:{port}");
    debug!("Connecting to {}", addr);
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| ConnectError::Io {
            addr: addr.clone(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
    }
    Ok(stream)
}
