//! TCP transport (`tcp://host:port`)
//!
//! Each frame on the wire is `[flags: u8][length: u32 BE][payload]`; bit 0
//! of `flags` is set when more frames of the same message follow. A bound
//! socket accepts any number of peers. A connecting socket keeps one
//! connection and re-establishes it every [`RECONNECT_INTERVAL`] after it
//! drops or fails.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::socket::{next_id, Multipart, PeerSet, SocketCore};
use crate::traits::{Mode, RecvOutcome, SendOutcome, SocketEvent, SocketOptions, Transport};

pub const SCHEME: &str = "tcp";

/// Maximum frame size (512 MiB)
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Delay between connection attempts of a connecting socket
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

const FLAG_MORE: u8 = 0x01;

/// TCP configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Maximum frame size in bytes
    pub max_frame_size: usize,
    /// Keep-alive interval in seconds (0 = disabled)
    pub keepalive_secs: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            keepalive_secs: 30,
        }
    }
}

/// Socket address part of a `tcp://host:port` address; `*` binds every
/// interface
pub fn parse_address(address: &str) -> Result<String> {
    let rest = address
        .strip_prefix("tcp://")
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }
    let host = if host == "*" { "0.0.0.0" } else { host };
    Ok(format!("{}:{}", host, port))
}

/// Everything a connection task needs from its socket
#[derive(Clone)]
struct Shared {
    peers: Arc<PeerSet>,
    inbound: mpsc::Sender<Multipart>,
    events: broadcast::Sender<SocketEvent>,
    shutdown: CancellationToken,
    writers: TaskTracker,
    queue_size: usize,
    config: TcpConfig,
}

impl Shared {
    fn notify(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }
}

/// Socket on the TCP transport
pub struct TcpSocket {
    core: SocketCore,
    shared: Shared,
    linger: Duration,
    local_addr: Option<SocketAddr>,
}

impl TcpSocket {
    fn new(address: &str, mode: Mode, options: &SocketOptions, config: TcpConfig) -> Self {
        let core = SocketCore::new(address, mode, options);
        let shared = Shared {
            peers: core.peers(),
            inbound: core.inbound(),
            events: core.event_sender(),
            shutdown: CancellationToken::new(),
            writers: TaskTracker::new(),
            queue_size: core.queue_size(),
            config,
        };
        Self {
            core,
            shared,
            linger: options.linger,
            local_addr: None,
        }
    }

    /// Bind and start accepting peers
    pub async fn bind(address: &str, mode: Mode, options: SocketOptions, config: TcpConfig) -> Result<Self> {
        let addr = parse_address(address)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bind {}: {}", address, e)))?;

        let mut socket = Self::new(address, mode, &options, config);
        socket.local_addr = listener.local_addr().ok();
        info!("TCP {} socket listening on {}", mode, addr);

        tokio::spawn(accept_loop(listener, socket.shared.clone()));
        Ok(socket)
    }

    /// Start connecting in the background; the peer does not have to be up yet
    pub async fn connect(address: &str, mode: Mode, options: SocketOptions, config: TcpConfig) -> Result<Self> {
        let addr = parse_address(address)?;
        let socket = Self::new(address, mode, &options, config);
        info!("TCP {} socket connecting to {}", mode, addr);

        tokio::spawn(connect_loop(addr, socket.shared.clone()));
        Ok(socket)
    }

    /// Local address of a bound socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of currently attached peers
    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }
}

async fn accept_loop(listener: TcpListener, shared: Shared) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("TCP connection accepted from {}", peer);
                    tokio::spawn(run_connection(stream, shared.clone(), SocketEvent::Accepted));
                }
                Err(e) => {
                    warn!("TCP accept failed: {}", e);
                    tokio::time::sleep(RECONNECT_INTERVAL).await;
                }
            }
        }
    }
}

async fn connect_loop(addr: String, shared: Shared) {
    loop {
        let attempt = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            attempt = TcpStream::connect(&addr) => attempt,
        };
        match attempt {
            Ok(stream) => run_connection(stream, shared.clone(), SocketEvent::Connected).await,
            Err(e) => debug!("TCP connect to {} failed: {}", addr, e),
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
        }
    }
}

/// Attach one established connection as a peer until it drops
async fn run_connection(stream: TcpStream, shared: Shared, event: SocketEvent) {
    if shared.config.keepalive_secs > 0 {
        let socket = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(shared.config.keepalive_secs));
        let _ = socket.set_tcp_keepalive(&keepalive);
    }
    let _ = stream.set_nodelay(true);

    let id = next_id();
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(shared.queue_size);

    shared.peers.add(id, tx);
    shared.notify(event);

    shared
        .writers
        .spawn(write_loop(writer, rx, shared.shutdown.clone()));

    let result = tokio::select! {
        _ = shared.shutdown.cancelled() => Ok(()),
        result = read_loop(reader, &shared) => result,
    };
    if let Err(e) = result {
        match e {
            TransportError::ConnectionClosed => debug!("TCP peer {} closed the connection", id),
            other => warn!("TCP peer {} dropped: {}", id, other),
        }
    }

    shared.peers.remove(id);
    if !shared.shutdown.is_cancelled() {
        shared.notify(SocketEvent::Disconnected);
    }
}

async fn read_loop(reader: OwnedReadHalf, shared: &Shared) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut message = Vec::new();
    loop {
        let flags = match reader.read_u8().await {
            Ok(flags) => flags,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        };
        let len = reader.read_u32().await? as usize;
        if len > shared.config.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: shared.config.max_frame_size,
            });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        message.push(Bytes::from(payload));

        if flags & FLAG_MORE == 0 {
            let complete = std::mem::take(&mut message);
            if shared.inbound.send(complete).await.is_err() {
                return Ok(());
            }
        }
    }
}

async fn write_loop(writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Multipart>, shutdown: CancellationToken) {
    let mut writer = BufWriter::new(writer);
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(e) = write_message(&mut writer, &message).await {
            error!("TCP write error: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_message(writer: &mut BufWriter<OwnedWriteHalf>, message: &Multipart) -> std::io::Result<()> {
    let last = message.len().saturating_sub(1);
    for (i, frame) in message.iter().enumerate() {
        let mut prefix = BytesMut::with_capacity(5);
        prefix.put_u8(if i < last { FLAG_MORE } else { 0 });
        prefix.put_u32(frame.len() as u32);
        writer.write_all(&prefix).await?;
        writer.write_all(frame).await?;
    }
    writer.flush().await
}

#[async_trait]
impl Transport for TcpSocket {
    fn address(&self) -> &str {
        self.core.address()
    }

    fn mode(&self) -> Mode {
        self.core.mode()
    }

    async fn send_frame(&mut self, frame: Bytes, more: bool, block: bool) -> Result<SendOutcome> {
        if frame.len() > self.shared.config.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: self.shared.config.max_frame_size,
            });
        }
        self.core.send_frame(frame, more, block).await
    }

    fn abort_message(&mut self) {
        self.core.abort_message();
    }

    async fn recv_frame(&mut self, block: bool) -> Result<RecvOutcome> {
        self.core.recv_frame(block).await
    }

    fn has_more(&self) -> bool {
        self.core.has_more()
    }

    fn set_receive_timeout(&mut self, timeout: Option<Duration>) {
        self.core.set_receive_timeout(timeout);
    }

    fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.core.set_send_timeout(timeout);
    }

    fn events(&self) -> broadcast::Receiver<SocketEvent> {
        self.core.subscribe()
    }

    async fn close(&mut self) -> Result<()> {
        if self.core.is_closed() {
            return Ok(());
        }

        // Dropping the peer queues lets each writer drain what is queued and
        // exit; whatever is left after the linger period is discarded.
        self.shared.peers.clear();
        self.shared.writers.close();
        if tokio::time::timeout(self.linger, self.shared.writers.wait())
            .await
            .is_err()
        {
            debug!("Linger expired on {} with unsent messages", self.core.address());
        }

        self.shared.shutdown.cancel();
        self.core.mark_closed();
        info!("TCP socket {} closed", self.core.address());
        Ok(())
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_config_default() {
        let config = TcpConfig::default();
        assert_eq!(config.max_frame_size, 512 * 1024 * 1024);
        assert_eq!(config.keepalive_secs, 30);
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("tcp://*:9999").unwrap(), "0.0.0.0:9999");
        assert_eq!(parse_address("tcp://localhost:8888").unwrap(), "localhost:8888");
        assert!(parse_address("tcp://localhost").is_err());
        assert!(parse_address("tcp://:9999").is_err());
        assert!(parse_address("tcp://host:port").is_err());
        assert!(parse_address("inproc://name").is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let first = TcpSocket::bind("tcp://127.0.0.1:0", Mode::Pull, Default::default(), Default::default())
            .await
            .unwrap();
        let port = first.local_addr().unwrap().port();
        let second = TcpSocket::bind(
            &format!("tcp://127.0.0.1:{}", port),
            Mode::Pull,
            Default::default(),
            Default::default(),
        )
        .await;
        assert!(matches!(second, Err(TransportError::ConnectionFailed(_))));
    }
}
