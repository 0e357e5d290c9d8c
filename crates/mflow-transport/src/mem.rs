//! In-process transport (`inproc://name`)
//!
//! Sockets in the same process are linked directly through their queues.
//! A connecting socket may be opened before the address is bound; it is
//! parked and linked as soon as a socket binds the name. When the bound
//! socket goes away its connectors are parked again.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::socket::{next_id, Multipart, PeerSet, SocketCore};
use crate::traits::{ConnType, Mode, RecvOutcome, SendOutcome, SocketEvent, SocketOptions, Transport};

pub const SCHEME: &str = "inproc";

/// What a linked peer needs to reach a socket
#[derive(Clone)]
struct Endpoint {
    id: u64,
    inbound: mpsc::Sender<Multipart>,
    peers: Arc<PeerSet>,
    events: broadcast::Sender<SocketEvent>,
    links: Arc<Mutex<Vec<Endpoint>>>,
}

impl Endpoint {
    fn notify(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct Slot {
    bound: Option<Endpoint>,
    pending: Vec<Endpoint>,
}

static REGISTRY: LazyLock<Mutex<HashMap<String, Slot>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

fn link(binder: &Endpoint, connector: &Endpoint) {
    binder.peers.add(connector.id, connector.inbound.clone());
    connector.peers.add(binder.id, binder.inbound.clone());
    binder.links.lock().push(connector.clone());
    connector.links.lock().push(binder.clone());
    binder.notify(SocketEvent::Accepted);
    connector.notify(SocketEvent::Connected);
}

/// Name part of an `inproc://name` address
pub fn parse_address(address: &str) -> Result<&str> {
    match address.strip_prefix("inproc://") {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(TransportError::InvalidAddress(address.to_string())),
    }
}

/// Socket on the in-process transport
pub struct MemSocket {
    core: SocketCore,
    name: String,
    endpoint: Endpoint,
    conn_type: ConnType,
}

impl MemSocket {
    pub fn open(address: &str, conn_type: ConnType, mode: Mode, options: SocketOptions) -> Result<Self> {
        let name = parse_address(address)?.to_string();
        let core = SocketCore::new(address, mode, &options);
        let endpoint = Endpoint {
            id: next_id(),
            inbound: core.inbound(),
            peers: core.peers(),
            events: core.event_sender(),
            links: Arc::new(Mutex::new(Vec::new())),
        };

        let mut registry = REGISTRY.lock();
        let slot = registry.entry(name.clone()).or_default();
        match conn_type {
            ConnType::Bind => {
                if slot.bound.is_some() {
                    return Err(TransportError::ConnectionFailed(format!(
                        "{} is already bound",
                        address
                    )));
                }
                for connector in std::mem::take(&mut slot.pending) {
                    link(&endpoint, &connector);
                }
                slot.bound = Some(endpoint.clone());
                info!("Bound {} socket to {}", mode, address);
            }
            ConnType::Connect => {
                match &slot.bound {
                    Some(binder) => link(binder, &endpoint),
                    None => slot.pending.push(endpoint.clone()),
                }
                info!("Connected {} socket to {}", mode, address);
            }
        }
        drop(registry);

        Ok(Self {
            core,
            name,
            endpoint,
            conn_type,
        })
    }

    /// Number of currently linked peers
    pub fn peer_count(&self) -> usize {
        self.endpoint.peers.len()
    }

    fn detach(&mut self) {
        let mut registry = REGISTRY.lock();
        let id = self.endpoint.id;

        let remotes = std::mem::take(&mut *self.endpoint.links.lock());
        self.endpoint.peers.clear();

        if let Some(slot) = registry.get_mut(&self.name) {
            match self.conn_type {
                ConnType::Bind => {
                    if slot.bound.as_ref().map(|e| e.id) == Some(id) {
                        slot.bound = None;
                    }
                }
                ConnType::Connect => slot.pending.retain(|e| e.id != id),
            }
        }

        for remote in remotes {
            remote.peers.remove(id);
            remote.links.lock().retain(|e| e.id != id);
            remote.notify(SocketEvent::Disconnected);
            if self.conn_type == ConnType::Bind {
                if let Some(slot) = registry.get_mut(&self.name) {
                    slot.pending.push(remote);
                }
            }
        }

        if registry
            .get(&self.name)
            .is_some_and(|slot| slot.bound.is_none() && slot.pending.is_empty())
        {
            registry.remove(&self.name);
        }
        debug!("Detached {} from {}", self.core.mode(), self.core.address());
    }
}

#[async_trait]
impl Transport for MemSocket {
    fn address(&self) -> &str {
        self.core.address()
    }

    fn mode(&self) -> Mode {
        self.core.mode()
    }

    async fn send_frame(&mut self, frame: Bytes, more: bool, block: bool) -> Result<SendOutcome> {
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

    /// Queued messages already sit in the peers' inbound queues, so closing
    /// never has to linger.
    async fn close(&mut self) -> Result<()> {
        if self.core.is_closed() {
            return Ok(());
        }
        self.detach();
        self.core.mark_closed();
        Ok(())
    }
}

impl Drop for MemSocket {
    fn drop(&mut self) {
        if !self.core.is_closed() {
            self.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("inproc://detector").unwrap(), "detector");
        assert!(parse_address("inproc://").is_err());
        assert!(parse_address("tcp://localhost:9999").is_err());
    }

    #[tokio::test]
    async fn test_double_bind_fails() {
        let _first = MemSocket::open("inproc://mem-double-bind", ConnType::Bind, Mode::Pull, Default::default())
            .unwrap();
        let second = MemSocket::open("inproc://mem-double-bind", ConnType::Bind, Mode::Pull, Default::default());
        assert!(matches!(second, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_rebind_after_close() {
        let mut first =
            MemSocket::open("inproc://mem-rebind", ConnType::Bind, Mode::Pull, Default::default()).unwrap();
        first.close().await.unwrap();
        assert!(MemSocket::open("inproc://mem-rebind", ConnType::Bind, Mode::Pull, Default::default()).is_ok());
    }
}
