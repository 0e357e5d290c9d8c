//! Queueing core shared by every transport
//!
//! A socket owns one bounded inbound queue of complete messages and a set of
//! peers, each reachable through a bounded outbound queue. Transports differ
//! only in how peers are attached: the in-process transport links queues
//! directly, TCP puts a reader and a writer task between them.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::traits::{Mode, RecvOutcome, SendOutcome, SocketEvent, SocketOptions};

/// One complete multi-part message
pub(crate) type Multipart = Vec<Bytes>;

const EVENT_CHANNEL_CAPACITY: usize = 64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique id for sockets and connections
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone)]
pub(crate) struct Peer {
    pub id: u64,
    pub tx: mpsc::Sender<Multipart>,
}

/// Peers currently attached to a socket
#[derive(Default)]
pub(crate) struct PeerSet {
    peers: Mutex<Vec<Peer>>,
    changed: Notify,
}

impl PeerSet {
    pub fn add(&self, id: u64, tx: mpsc::Sender<Multipart>) {
        self.peers.lock().push(Peer { id, tx });
        self.changed.notify_one();
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|peer| peer.id != id);
        before != peers.len()
    }

    pub fn clear(&self) {
        self.peers.lock().clear();
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }
}

pub(crate) struct SocketCore {
    address: String,
    mode: Mode,
    queue_size: usize,
    inbound_tx: mpsc::Sender<Multipart>,
    inbound_rx: mpsc::Receiver<Multipart>,
    current: VecDeque<Bytes>,
    outgoing: Multipart,
    peers: Arc<PeerSet>,
    next_peer: usize,
    events: broadcast::Sender<SocketEvent>,
    /// Subscribed at creation so events raised while the socket is being
    /// opened reach the first listener
    first_events: Mutex<Option<broadcast::Receiver<SocketEvent>>>,
    receive_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    closed: bool,
}

impl SocketCore {
    pub fn new(address: &str, mode: Mode, options: &SocketOptions) -> Self {
        let queue_size = options.queue_size.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_size);
        let (events, first_events) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            address: address.to_string(),
            mode,
            queue_size,
            inbound_tx,
            inbound_rx,
            current: VecDeque::new(),
            outgoing: Vec::new(),
            peers: Arc::new(PeerSet::default()),
            next_peer: 0,
            events,
            first_events: Mutex::new(Some(first_events)),
            receive_timeout: options.receive_timeout,
            send_timeout: options.send_timeout,
            closed: false,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Sender feeding this socket's inbound queue
    pub fn inbound(&self) -> mpsc::Sender<Multipart> {
        self.inbound_tx.clone()
    }

    pub fn peers(&self) -> Arc<PeerSet> {
        self.peers.clone()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SocketEvent> {
        self.events.clone()
    }

    /// The first subscriber sees every event since the socket was created;
    /// later ones only what happens after they subscribe
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.first_events
            .lock()
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) {
        self.receive_timeout = timeout;
    }

    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.send_timeout = timeout;
    }

    /// Mark the socket closed and publish the final event
    pub fn mark_closed(&mut self) {
        self.closed = true;
        self.current.clear();
        self.outgoing.clear();
        let _ = self.events.send(SocketEvent::Closed);
    }

    pub fn abort_message(&mut self) {
        self.outgoing.clear();
    }

    pub fn has_more(&self) -> bool {
        !self.current.is_empty()
    }

    pub async fn recv_frame(&mut self, block: bool) -> Result<RecvOutcome> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if !self.mode.can_receive() {
            return Err(TransportError::InvalidOperation(self.mode.to_string()));
        }
        if let Some(frame) = self.current.pop_front() {
            return Ok(RecvOutcome::Frame(frame));
        }

        let message = if block {
            let next = self.inbound_rx.recv();
            match self.receive_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, next).await {
                    Ok(message) => message,
                    Err(_) => return Ok(RecvOutcome::WouldBlock),
                },
                None => next.await,
            }
        } else {
            match self.inbound_rx.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Empty) => return Ok(RecvOutcome::WouldBlock),
                Err(TryRecvError::Disconnected) => None,
            }
        };

        // The socket holds its own inbound sender, so the queue only closes
        // when the socket is being torn down.
        let Some(message) = message else {
            return Err(TransportError::ConnectionClosed);
        };

        self.current = message.into();
        match self.current.pop_front() {
            Some(frame) => Ok(RecvOutcome::Frame(frame)),
            None => Ok(RecvOutcome::WouldBlock),
        }
    }

    pub async fn send_frame(&mut self, frame: Bytes, more: bool, block: bool) -> Result<SendOutcome> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if !self.mode.can_send() {
            return Err(TransportError::InvalidOperation(self.mode.to_string()));
        }

        self.outgoing.push(frame);
        if more {
            return Ok(SendOutcome::Sent);
        }

        let message = std::mem::take(&mut self.outgoing);
        match self.mode {
            Mode::Pub => Ok(self.publish(message)),
            _ => self.push(message, block).await,
        }
    }

    /// Fan out to every peer; peers with a full queue miss the message
    fn publish(&mut self, message: Multipart) -> SendOutcome {
        for peer in self.peers.snapshot() {
            match peer.tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!("subscriber {} is slow, dropping message", peer.id),
                Err(TrySendError::Closed(_)) => {
                    self.peers.remove(peer.id);
                }
            }
        }
        SendOutcome::Sent
    }

    /// Hand the message to the next peer with room, round-robin
    async fn push(&mut self, message: Multipart, block: bool) -> Result<SendOutcome> {
        let mut message = message;
        let candidates = self.peers.snapshot();
        let count = candidates.len();
        for offset in 0..count {
            let index = (self.next_peer + offset) % count;
            let peer = &candidates[index];
            match peer.tx.try_send(message) {
                Ok(()) => {
                    self.next_peer = index + 1;
                    return Ok(SendOutcome::Sent);
                }
                Err(TrySendError::Full(m)) => message = m,
                Err(TrySendError::Closed(m)) => {
                    self.peers.remove(peer.id);
                    message = m;
                }
            }
        }

        if !block {
            return Ok(SendOutcome::WouldBlock);
        }

        let wait = push_blocking(self.peers.clone(), self.next_peer, message);
        let outcome = match self.send_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(outcome) => outcome,
                Err(_) => SendOutcome::WouldBlock,
            },
            None => wait.await,
        };
        if outcome == SendOutcome::Sent {
            self.next_peer += 1;
        }
        Ok(outcome)
    }
}

/// Wait until some peer can take `message`
async fn push_blocking(peers: Arc<PeerSet>, start: usize, mut message: Multipart) -> SendOutcome {
    loop {
        let attached = peers.changed.notified();
        let candidates = peers.snapshot();
        let Some(peer) = candidates.get(start % candidates.len().max(1)).cloned() else {
            attached.await;
            continue;
        };
        drop(attached);

        match peer.tx.send(message).await {
            Ok(()) => return SendOutcome::Sent,
            Err(mpsc::error::SendError(returned)) => {
                peers.remove(peer.id);
                message = returned;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&'static str]) -> Multipart {
        parts.iter().map(|p| Bytes::from_static(p.as_bytes())).collect()
    }

    #[tokio::test]
    async fn test_push_without_peers_would_block() {
        let mut core = SocketCore::new("inproc://core", Mode::Push, &SocketOptions::default());
        let outcome = core.send_frame(Bytes::from_static(b"a"), false, false).await.unwrap();
        assert_eq!(outcome, SendOutcome::WouldBlock);
    }

    #[tokio::test]
    async fn test_push_is_round_robin() {
        let mut core = SocketCore::new("inproc://core", Mode::Push, &SocketOptions::default());
        let (tx1, mut rx1) = mpsc::channel(10);
        let (tx2, mut rx2) = mpsc::channel(10);
        core.peers().add(1, tx1);
        core.peers().add(2, tx2);

        for part in ["a", "b", "c", "d"] {
            let outcome = core.send_frame(Bytes::from(part), false, false).await.unwrap();
            assert_eq!(outcome, SendOutcome::Sent);
        }

        assert_eq!(rx1.recv().await.unwrap(), frames(&["a"]));
        assert_eq!(rx2.recv().await.unwrap(), frames(&["b"]));
        assert_eq!(rx1.recv().await.unwrap(), frames(&["c"]));
        assert_eq!(rx2.recv().await.unwrap(), frames(&["d"]));
    }

    #[tokio::test]
    async fn test_message_is_delivered_on_final_frame() {
        let mut core = SocketCore::new("inproc://core", Mode::Push, &SocketOptions::default());
        let (tx, mut rx) = mpsc::channel(10);
        core.peers().add(1, tx);

        core.send_frame(Bytes::from_static(b"header"), true, false).await.unwrap();
        assert!(rx.try_recv().is_err());
        core.send_frame(Bytes::from_static(b"body"), false, false).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), frames(&["header", "body"]));
    }

    #[tokio::test]
    async fn test_pub_drops_for_full_subscriber() {
        let mut core = SocketCore::new("inproc://core", Mode::Pub, &SocketOptions::default());
        let (tx, mut rx) = mpsc::channel(1);
        core.peers().add(1, tx);

        for part in ["first", "second"] {
            let outcome = core.send_frame(Bytes::from(part), false, true).await.unwrap();
            assert_eq!(outcome, SendOutcome::Sent);
        }

        assert_eq!(rx.recv().await.unwrap(), frames(&["first"]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wrong_direction_is_rejected() {
        let mut pull = SocketCore::new("inproc://core", Mode::Pull, &SocketOptions::default());
        let err = pull.send_frame(Bytes::new(), false, false).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidOperation(_)));

        let mut push = SocketCore::new("inproc://core", Mode::Push, &SocketOptions::default());
        let err = push.recv_frame(false).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_recv_walks_frames_of_one_message() {
        let mut core = SocketCore::new("inproc://core", Mode::Pull, &SocketOptions::default());
        core.inbound().send(frames(&["h", "d"])).await.unwrap();

        assert_eq!(core.recv_frame(false).await.unwrap(), RecvOutcome::Frame(Bytes::from("h")));
        assert!(core.has_more());
        assert_eq!(core.recv_frame(false).await.unwrap(), RecvOutcome::Frame(Bytes::from("d")));
        assert!(!core.has_more());
        assert_eq!(core.recv_frame(false).await.unwrap(), RecvOutcome::WouldBlock);
    }

    #[tokio::test]
    async fn test_first_subscriber_sees_earlier_events() {
        let core = SocketCore::new("inproc://core", Mode::Pull, &SocketOptions::default());
        let _ = core.event_sender().send(SocketEvent::Accepted);

        let mut first = core.subscribe();
        let mut second = core.subscribe();
        assert_eq!(first.try_recv().unwrap(), SocketEvent::Accepted);
        assert!(second.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_recv_honors_timeout() {
        let options = SocketOptions {
            receive_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let mut core = SocketCore::new("inproc://core", Mode::Pull, &options);
        assert_eq!(core.recv_frame(true).await.unwrap(), RecvOutcome::WouldBlock);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_push_honors_send_timeout() {
        let options = SocketOptions {
            send_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let mut core = SocketCore::new("inproc://core", Mode::Push, &options);
        let outcome = core.send_frame(Bytes::from_static(b"x"), false, true).await.unwrap();
        assert_eq!(outcome, SendOutcome::WouldBlock);
    }
}
