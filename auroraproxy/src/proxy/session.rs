//! One downstream client paired with one upstream connection.
//!
//! Each leg runs in its own task: it performs its opening handshake, marks
//! itself ready and then blocks on the shared [`Readiness`] barrier. Only
//! when both legs are ready do the relay loops start reading frames, so no
//! payload can cross the proxy before both handshakes have completed.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::handshake::{
    build_downstream_response, build_upstream_request, is_handshake_request, read_http_head,
    validate_upstream_response, HandshakeError,
};
use super::upstream::{ConnectError, Connector};
use crate::transport::codec::{FrameCodec, MAX_MESSAGE_LEN};
use crate::transport::frame::{Frame, FrameError, Opcode};

const READ_BUFFER_LEN: usize = 16 * 1024;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upstream host, sent as `Host` and used to derive `Origin`.
    pub host: String,
    /// Resource requested in the upstream upgrade request.
    pub path: String,
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Bound on each leg's opening handshake.
    pub handshake_timeout: Duration,
    /// A session with no traffic in either direction for longer than this
    /// is closed.
    pub idle_timeout: Option<Duration>,
    /// Ceiling on a reassembled fragmented message.
    pub max_message_len: usize,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: "/".to_string(),
            user_agent: concat!("auroraproxy/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    AwaitingClient,
    ClientHandshaking,
    ConnectingUpstream,
    UpstreamHandshaking,
    Relaying,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    Downstream,
    Upstream,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Downstream => f.write_str("downstream"),
            Leg::Upstream => f.write_str("upstream"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Client handshake failed: {0}")]
    ClientHandshake(HandshakeError),

    #[error("Upstream handshake failed: {0}")]
    UpstreamHandshake(HandshakeError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("No traffic in either direction within the idle timeout")]
    Idle,

    #[error("Framing error on the {leg} connection: {source}")]
    Framing { leg: Leg, source: FrameError },

    #[error("I/O error on the {leg} connection: {source}")]
    Io { leg: Leg, source: io::Error },

    #[error("Relay task failed")]
    Task(#[from] tokio::task::JoinError),
}

/// Readiness flags of both legs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadyFlags {
    pub downstream: bool,
    pub upstream: bool,
}

impl ReadyFlags {
    pub fn both(&self) -> bool {
        self.downstream && self.upstream
    }
}

/// Rendezvous between the two legs of a session.
///
/// Backed by a watch channel: [`Readiness::wait`] checks the current flags
/// before sleeping, so a leg marked ready before the other starts waiting is
/// never missed.
#[derive(Debug, Clone)]
pub struct Readiness {
    tx: Arc<watch::Sender<ReadyFlags>>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ReadyFlags::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn mark(&self, leg: Leg) {
        self.tx.send_modify(|flags| match leg {
            Leg::Downstream => flags.downstream = true,
            Leg::Upstream => flags.upstream = true,
        });
    }

    pub fn flags(&self) -> ReadyFlags {
        *self.tx.borrow()
    }

    /// Resolves once both legs are marked ready.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(ReadyFlags::both).await;
    }
}

/// Monotonic phase publisher; a phase never moves backwards.
#[derive(Debug, Clone)]
struct PhaseTracker {
    tx: Arc<watch::Sender<Phase>>,
}

impl PhaseTracker {
    fn advance(&self, next: Phase) {
        self.tx.send_if_modified(|phase| {
            if next > *phase {
                debug!("Session phase {:?} -> {:?}", phase, next);
                *phase = next;
                true
            } else {
                false
            }
        });
    }
}

/// Write side of one leg.
///
/// Empty until the leg has finished its handshake. A failed write detaches
/// the writer, so later writes report the destination as gone without
/// touching the socket again.
struct LegWriter<W> {
    leg: Leg,
    inner: Mutex<Option<W>>,
}

impl<W: AsyncWrite + Unpin> LegWriter<W> {
    fn new(leg: Leg) -> Self {
        Self {
            leg,
            inner: Mutex::new(None),
        }
    }

    async fn attach(&self, writer: W) {
        *self.inner.lock().await = Some(writer);
    }

    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} connection is not writable", self.leg),
            ));
        };

        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if result.is_err() {
            *guard = None;
        }
        result
    }

    /// Writes `bytes`, logging instead of failing when the destination is
    /// gone. Returns whether the bytes were written.
    async fn forward(&self, bytes: &[u8]) -> bool {
        match self.write(bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropped {} bytes for the {} connection: {}", bytes.len(), self.leg, e);
                false
            }
        }
    }

    async fn shutdown(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// State shared by both legs of a running session.
struct Relay<DW, UW> {
    config: Arc<SessionConfig>,
    phase: PhaseTracker,
    readiness: Readiness,
    /// Time of the last read on either leg.
    activity: watch::Sender<Instant>,
    downstream: LegWriter<DW>,
    upstream: LegWriter<UW>,
}

impl<DW, UW> Relay<DW, UW>
where
    DW: AsyncWrite + Unpin,
    UW: AsyncWrite + Unpin,
{
    async fn enter_relaying(&self, leg: Leg) {
        self.readiness.mark(leg);
        debug!("{} leg ready, waiting for the other leg", leg);
        self.readiness.wait().await;
        self.activity.send_replace(Instant::now());
        self.phase.advance(Phase::Relaying);
    }

    /// Reads more bytes from `leg`. The idle deadline is shared by both
    /// legs: traffic in either direction keeps the session alive.
    async fn read_some<R>(&self, leg: Leg, reader: &mut R, buf: &mut BytesMut) -> Result<usize, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        buf.reserve(READ_BUFFER_LEN);
        let read = reader.read_buf(buf);
        tokio::pin!(read);

        let result = match self.config.idle_timeout {
            None => read.await,
            Some(idle) => loop {
                let deadline = *self.activity.borrow() + idle;
                tokio::select! {
                    result = &mut read => break result,
                    _ = sleep_until(deadline) => {
                        if *self.activity.borrow() + idle <= Instant::now() {
                            return Err(SessionError::Idle);
                        }
                    }
                }
            },
        };

        let n = result.map_err(|source| SessionError::Io { leg, source })?;
        self.activity.send_replace(Instant::now());
        Ok(n)
    }

    /// Client -> upstream: TEXT messages are re-masked and forwarded, the
    /// rest is logged only.
    async fn relay_downstream<R>(&self, mut reader: R, mut buf: BytesMut) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut codec = FrameCodec::new().with_max_message_len(self.config.max_message_len);
        loop {
            if !buf.is_empty() {
                let frames = codec.decode(&buf).map_err(|source| SessionError::Framing {
                    leg: Leg::Downstream,
                    source,
                })?;
                buf.clear();
                self.handle_client_frames(&mut codec, &frames)
                    .await
                    .map_err(|source| SessionError::Framing {
                        leg: Leg::Downstream,
                        source,
                    })?;
            }

            if self.read_some(Leg::Downstream, &mut reader, &mut buf).await? == 0 {
                info!("Client disconnected");
                return Ok(());
            }
        }
    }

    /// Handles `frames` in wire order; a message is forwarded when its final
    /// fragment arrives.
    async fn handle_client_frames(&self, codec: &mut FrameCodec, frames: &[Frame]) -> Result<(), FrameError> {
        for frame in frames {
            match frame.opcode {
                Opcode::Close => info!("Client sent CLOSE, not forwarded"),
                opcode if opcode.is_control() => {
                    debug!("Client sent {:?} ({} bytes)", opcode, frame.len())
                }
                _ => {
                    let frame = std::slice::from_ref(frame);
                    for text in codec.decode_messages(frame, Opcode::Text)? {
                        debug!("CLIENT -> SERVER: {}", String::from_utf8_lossy(&text));
                        let out = FrameCodec::encode(&codec.encode_message(text, Opcode::Text, true));
                        self.upstream.forward(&out).await;
                    }
                    for data in codec.decode_messages(frame, Opcode::Binary)? {
                        info!("CLIENT -> SERVER: BIN message of {} bytes not forwarded", data.len());
                    }
                }
            }
        }
        Ok(())
    }

    /// Upstream -> client: PINGs are answered upstream and propagated as a
    /// fresh PING downstream; TEXT messages are forwarded unmasked.
    async fn relay_upstream<R>(&self, mut reader: R, mut buf: BytesMut) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut codec = FrameCodec::new().with_max_message_len(self.config.max_message_len);
        loop {
            if !buf.is_empty() {
                let frames = codec.decode(&buf).map_err(|source| SessionError::Framing {
                    leg: Leg::Upstream,
                    source,
                })?;
                buf.clear();
                self.handle_server_frames(&mut codec, &frames)
                    .await
                    .map_err(|source| SessionError::Framing {
                        leg: Leg::Upstream,
                        source,
                    })?;
            }

            if self.read_some(Leg::Upstream, &mut reader, &mut buf).await? == 0 {
                info!("Upstream disconnected");
                return Ok(());
            }
        }
    }

    async fn handle_server_frames(&self, codec: &mut FrameCodec, frames: &[Frame]) -> Result<(), FrameError> {
        for frame in frames {
            match frame.opcode {
                Opcode::Ping => {
                    debug!("PROXY <-> SERVER: ping-pong");
                    let pong = FrameCodec::encode(&[FrameCodec::create_pong_frame(frame)]);
                    self.upstream.forward(&pong).await;
                    let ping = FrameCodec::encode(&[FrameCodec::create_ping_frame()]);
                    self.downstream.forward(&ping).await;
                }
                Opcode::Close => info!("Upstream sent CLOSE"),
                opcode if opcode.is_control() => {
                    debug!("Upstream sent {:?} ({} bytes)", opcode, frame.len())
                }
                _ => {
                    let frame = std::slice::from_ref(frame);
                    for text in codec.decode_messages(frame, Opcode::Text)? {
                        debug!("SERVER -> CLIENT: {}", String::from_utf8_lossy(&text));
                        let out = FrameCodec::encode(&codec.encode_message(text, Opcode::Text, false));
                        self.downstream.forward(&out).await;
                    }
                    for data in codec.decode_messages(frame, Opcode::Binary)? {
                        info!("SERVER -> CLIENT: BIN message of {} bytes not forwarded", data.len());
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct Session<C: Connector> {
    config: Arc<SessionConfig>,
    connector: Arc<C>,
    phase: PhaseTracker,
    readiness: Readiness,
}

impl<C: Connector> Session<C> {
    pub fn new(config: Arc<SessionConfig>, connector: Arc<C>) -> Self {
        let (tx, _) = watch::channel(Phase::AwaitingClient);
        Self {
            config,
            connector,
            phase: PhaseTracker { tx: Arc::new(tx) },
            readiness: Readiness::new(),
        }
    }

    /// Subscribes to phase changes of this session.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.tx.subscribe()
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    /// Drives the session until either leg disconnects or fails.
    ///
    /// The surviving leg is cancelled and both connections are shut down
    /// before this returns; the phase is `Closed` afterwards.
    pub async fn run<D>(self, downstream: D) -> Result<(), SessionError>
    where
        D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.phase.advance(Phase::ClientHandshaking);

        let (down_read, down_write) = tokio::io::split(downstream);
        let relay: Arc<Relay<WriteHalf<D>, WriteHalf<C::Stream>>> = Arc::new(Relay {
            config: self.config.clone(),
            phase: self.phase.clone(),
            readiness: self.readiness.clone(),
            activity: watch::channel(Instant::now()).0,
            downstream: LegWriter::new(Leg::Downstream),
            upstream: LegWriter::new(Leg::Upstream),
        });

        let mut downstream_task = tokio::spawn(run_downstream(relay.clone(), down_read, down_write));
        let mut upstream_task = tokio::spawn(run_upstream(relay.clone(), self.connector.clone()));

        let (finished, result) = tokio::select! {
            result = &mut downstream_task => {
                upstream_task.abort();
                let _ = upstream_task.await;
                (Leg::Downstream, result)
            }
            result = &mut upstream_task => {
                downstream_task.abort();
                let _ = downstream_task.await;
                (Leg::Upstream, result)
            }
        };

        relay.downstream.shutdown().await;
        relay.upstream.shutdown().await;
        self.phase.advance(Phase::Closed);
        debug!("Session closed by the {} leg", finished);

        result?
    }
}

async fn run_downstream<D, UW>(
    relay: Arc<Relay<WriteHalf<D>, UW>>,
    mut reader: ReadHalf<D>,
    mut writer: WriteHalf<D>,
) -> Result<(), SessionError>
where
    D: AsyncRead + AsyncWrite + Unpin,
    UW: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_LEN);
    let request = timeout(
        relay.config.handshake_timeout,
        read_http_head(&mut reader, &mut buf),
    )
    .await
    .map_err(|_| SessionError::Timeout("Client handshake"))?
    .map_err(SessionError::ClientHandshake)?;
    debug!("Client handshake request:\n{}", request);

    if !is_handshake_request(&request) {
        let first_line = request.lines().next().unwrap_or_default().to_string();
        return Err(SessionError::ClientHandshake(HandshakeError::NotUpgradeRequest(first_line)));
    }
    let response = build_downstream_response(&request).map_err(SessionError::ClientHandshake)?;
    writer
        .write_all(response.as_bytes())
        .await
        .map_err(|source| SessionError::Io {
            leg: Leg::Downstream,
            source,
        })?;
    info!("Client handshake complete");

    relay.downstream.attach(writer).await;
    relay.enter_relaying(Leg::Downstream).await;
    relay.relay_downstream(reader, buf).await
}

async fn run_upstream<DW, C>(
    relay: Arc<Relay<DW, WriteHalf<C::Stream>>>,
    connector: Arc<C>,
) -> Result<(), SessionError>
where
    DW: AsyncWrite + Unpin,
    C: Connector,
{
    relay.phase.advance(Phase::ConnectingUpstream);
    let stream = timeout(relay.config.connect_timeout, connector.connect())
        .await
        .map_err(|_| SessionError::Timeout("Upstream connect"))??;
    info!("Connected to upstream {}", relay.config.host);

    relay.phase.advance(Phase::UpstreamHandshaking);
    let (mut reader, mut writer) = tokio::io::split(stream);
    let handshake = build_upstream_request(&relay.config.host, &relay.config.path, &relay.config.user_agent)
        .map_err(SessionError::UpstreamHandshake)?;
    debug!("Upstream handshake request:\n{}", handshake.request);

    let mut buf = BytesMut::with_capacity(READ_BUFFER_LEN);
    let response = timeout(relay.config.handshake_timeout, async {
        writer.write_all(handshake.request.as_bytes()).await?;
        writer.flush().await?;
        read_http_head(&mut reader, &mut buf).await
    })
    .await
    .map_err(|_| SessionError::Timeout("Upstream handshake"))?
    .map_err(SessionError::UpstreamHandshake)?;
    debug!("Upstream handshake response:\n{}", response);

    validate_upstream_response(&response, &handshake.key).map_err(SessionError::UpstreamHandshake)?;
    info!("Upstream handshake complete");

    relay.upstream.attach(writer).await;
    relay.enter_relaying(Leg::Upstream).await;
    relay.relay_upstream(reader, buf).await
}
