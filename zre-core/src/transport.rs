//! Mailbox seams between the engine and whatever carries frames between nodes.
//!
//! The engine only needs an ordered, connection-oriented outbound channel per
//! peer ([`Mailbox`]) and a way to open one ([`Connector`]). Inbound traffic
//! is pushed into the engine by the host together with the sender's routing id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::identity::ROUTING_ID_LEN;
use crate::protocol::Content;
use crate::wire::EncodeError;

/// Outbound connection to one peer.
pub trait Mailbox: Send {
    /// Queue one multi-frame message. Must never block: a full queue is
    /// [`SendError::WouldBlock`].
    fn send(&mut self, frames: Content) -> Result<(), SendError>;
}

/// Opens mailboxes. `routing_id` identifies this node to the remote inbox.
pub trait Connector: Send {
    fn connect(
        &mut self,
        routing_id: [u8; ROUTING_ID_LEN],
        endpoint: &str,
    ) -> Result<Box<dyn Mailbox>, ConnectError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("endpoint {0} unreachable")]
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Outbound queue is full; the peer is not keeping up.
    #[error("send would block")]
    WouldBlock,
    /// The connection is gone.
    #[error("mailbox disconnected")]
    Disconnected,
    /// The message does not fit the wire format. Nothing was sent.
    #[error("cannot encode message: {0}")]
    Encode(#[from] EncodeError),
    /// The message exceeds what the carrier accepts. Nothing was sent.
    #[error("message too large for transport")]
    Oversized,
}

impl SendError {
    /// True when the peer behind the mailbox can no longer be reached. The
    /// other errors reject one message and leave the connection usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SendError::WouldBlock | SendError::Disconnected)
    }
}

/// Frames waiting at an in-process inbox, tagged with the sender's routing id.
pub type Delivery = (Vec<u8>, Content);

/// In-process network: endpoints are plain strings, inboxes are queues.
/// Used to drive several engines in one process, e.g. in tests.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    inboxes: HashMap<String, VecDeque<Delivery>>,
    capacity: HashMap<String, usize>,
    refused: HashSet<String>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an inbox at `endpoint`.
    pub fn bind(&self, endpoint: &str) {
        self.lock().inboxes.entry(endpoint.to_string()).or_default();
    }

    /// Remove the inbox; queued frames are dropped and later sends fail.
    pub fn unbind(&self, endpoint: &str) {
        let mut inner = self.lock();
        inner.inboxes.remove(endpoint);
        inner.capacity.remove(endpoint);
    }

    /// Limit how many messages may wait at `endpoint` before senders see `WouldBlock`.
    pub fn set_capacity(&self, endpoint: &str, capacity: usize) {
        self.lock().capacity.insert(endpoint.to_string(), capacity);
    }

    /// Make new connections to `endpoint` fail.
    pub fn refuse(&self, endpoint: &str) {
        self.lock().refused.insert(endpoint.to_string());
    }

    /// Pop the oldest message waiting at `endpoint`.
    pub fn recv(&self, endpoint: &str) -> Option<Delivery> {
        self.lock().inboxes.get_mut(endpoint)?.pop_front()
    }

    /// Number of messages waiting at `endpoint`.
    pub fn pending(&self, endpoint: &str) -> usize {
        self.lock().inboxes.get(endpoint).map_or(0, VecDeque::len)
    }
}

impl Connector for MemoryNetwork {
    fn connect(
        &mut self,
        routing_id: [u8; ROUTING_ID_LEN],
        endpoint: &str,
    ) -> Result<Box<dyn Mailbox>, ConnectError> {
        if endpoint.is_empty() {
            return Err(ConnectError::InvalidEndpoint(endpoint.to_string()));
        }
        let inner = self.lock();
        if inner.refused.contains(endpoint) || !inner.inboxes.contains_key(endpoint) {
            return Err(ConnectError::Unreachable(endpoint.to_string()));
        }
        drop(inner);
        Ok(Box::new(MemoryMailbox {
            network: self.clone(),
            endpoint: endpoint.to_string(),
            routing_id: routing_id.to_vec(),
        }))
    }
}

struct MemoryMailbox {
    network: MemoryNetwork,
    endpoint: String,
    routing_id: Vec<u8>,
}

impl Mailbox for MemoryMailbox {
    fn send(&mut self, frames: Content) -> Result<(), SendError> {
        let mut inner = self.network.lock();
        let capacity = inner.capacity.get(&self.endpoint).copied();
        let queue = inner
            .inboxes
            .get_mut(&self.endpoint)
            .ok_or(SendError::Disconnected)?;
        if capacity.is_some_and(|cap| queue.len() >= cap) {
            return Err(SendError::WouldBlock);
        }
        queue.push_back((self.routing_id.clone(), frames));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;

    #[test]
    fn delivers_in_order_with_routing_id() {
        let mut net = MemoryNetwork::new();
        net.bind("inproc://a");
        let me = PeerId::generate();
        let mut mb = net.connect(me.routing_id(), "inproc://a").unwrap();
        mb.send(vec![b"1".to_vec()]).unwrap();
        mb.send(vec![b"2".to_vec()]).unwrap();
        assert_eq!(net.pending("inproc://a"), 2);
        let (rid, frames) = net.recv("inproc://a").unwrap();
        assert_eq!(PeerId::from_routing_id(&rid), Some(me));
        assert_eq!(frames, vec![b"1".to_vec()]);
        assert_eq!(net.recv("inproc://a").unwrap().1, vec![b"2".to_vec()]);
        assert!(net.recv("inproc://a").is_none());
    }

    #[test]
    fn connect_failures() {
        let mut net = MemoryNetwork::new();
        let rid = PeerId::generate().routing_id();
        assert!(matches!(
            net.connect(rid, "inproc://nobody"),
            Err(ConnectError::Unreachable(_))
        ));
        assert!(matches!(net.connect(rid, ""), Err(ConnectError::InvalidEndpoint(_))));
        net.bind("inproc://b");
        net.refuse("inproc://b");
        assert!(net.connect(rid, "inproc://b").is_err());
    }

    #[test]
    fn full_inbox_would_block_and_unbound_disconnects() {
        let mut net = MemoryNetwork::new();
        net.bind("inproc://c");
        net.set_capacity("inproc://c", 1);
        let mut mb = net.connect(PeerId::generate().routing_id(), "inproc://c").unwrap();
        mb.send(vec![]).unwrap();
        assert_eq!(mb.send(vec![]), Err(SendError::WouldBlock));
        net.unbind("inproc://c");
        assert_eq!(mb.send(vec![]), Err(SendError::Disconnected));
    }
}
