//! Node identity: the 16-byte UUID every ZRE node picks at startup, and the
//! routing id its mailboxes present to remote inboxes.

use std::fmt;
use std::str::FromStr;

/// Length of the routing id a mailbox announces: one marker byte plus the UUID.
pub const ROUTING_ID_LEN: usize = 1 + 16;

/// Leading byte of every routing id. Keeps the id from starting with zero.
const ROUTING_ID_MARKER: u8 = 1;

/// Node identity (UUID). Immutable once a node starts.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerId([u8; 16]);

impl PeerId {
    /// Fresh random identity (UUID v4).
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Routing id used when this node connects a mailbox to a peer.
    pub fn routing_id(&self) -> [u8; ROUTING_ID_LEN] {
        let mut out = [0u8; ROUTING_ID_LEN];
        out[0] = ROUTING_ID_MARKER;
        out[1..].copy_from_slice(&self.0);
        out
    }

    /// Recover the sender identity from an inbound routing id.
    /// Returns `None` for anything that is not marker + 16 bytes.
    pub fn from_routing_id(routing_id: &[u8]) -> Option<Self> {
        if routing_id.len() != ROUTING_ID_LEN || routing_id[0] != ROUTING_ID_MARKER {
            return None;
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&routing_id[1..]);
        Some(PeerId(id))
    }

    /// Default public name: first six hex characters of the identity.
    pub fn short_name(&self) -> String {
        let mut s = self.to_string();
        s.truncate(6);
        s
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", uuid::Uuid::from_bytes(self.0).simple())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid peer id: {0}")]
pub struct ParsePeerIdError(String);

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    /// Accepts the 32-character hex form (either case) as well as hyphenated UUIDs.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(|u| PeerId(u.into_bytes()))
            .map_err(|_| ParsePeerIdError(s.to_string()))
    }
}
