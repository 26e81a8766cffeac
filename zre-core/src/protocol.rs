//! ZRE wire protocol: message model, command ids and version.

use std::collections::BTreeMap;

/// Protocol signature: `0xAAA0 | 1`, "ZRE message v1" framing.
pub const SIGNATURE: u16 = 0xAAA0 | 1;

/// Protocol version carried in every message after the command id.
pub const PROTOCOL_VERSION: u8 = 2;

/// Peer header dictionary. Ordered so encoding is deterministic.
pub type Headers = BTreeMap<String, String>;

/// Opaque application payload, one entry per transport frame.
pub type Content = Vec<Vec<u8>>;

/// Command ids as they appear on the wire.
pub mod command_id {
    pub const HELLO: u8 = 1;
    pub const WHISPER: u8 = 2;
    pub const SHOUT: u8 = 3;
    pub const JOIN: u8 = 4;
    pub const LEAVE: u8 = 5;
    pub const PING: u8 = 6;
    pub const PING_OK: u8 = 7;
}

/// One ZRE message. The sender's identity is not part of the message; it
/// travels as the mailbox routing id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Cyclic per-connection sequence; assigned by the sending peer.
    pub sequence: u16,
    pub body: Body,
}

/// Per-command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Greet a peer so it can connect back to us.
    Hello(Hello),
    /// Send a message to a single peer.
    Whisper { content: Content },
    /// Send a message to every member of a group.
    Shout { group: String, content: Content },
    /// Sender joined a group.
    Join { group: String, status: u8 },
    /// Sender left a group.
    Leave { group: String, status: u8 },
    /// Liveness probe.
    Ping,
    /// Reply to a ping.
    PingOk,
}

/// HELLO payload: everything a peer needs to admit us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hello {
    /// Endpoint our inbox listens on, e.g. `tcp://192.168.1.5:49152`.
    pub endpoint: String,
    /// Groups we are currently in.
    pub groups: Vec<String>,
    /// Our join/leave change counter.
    pub status: u8,
    /// Our public name.
    pub name: String,
    pub headers: Headers,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Message { sequence: 0, body }
    }

    pub fn id(&self) -> u8 {
        self.body.id()
    }

    pub fn is_hello(&self) -> bool {
        matches!(self.body, Body::Hello(_))
    }

    /// Command name for logs.
    pub fn command(&self) -> &'static str {
        self.body.command()
    }
}

impl Body {
    pub fn id(&self) -> u8 {
        match self {
            Body::Hello(_) => command_id::HELLO,
            Body::Whisper { .. } => command_id::WHISPER,
            Body::Shout { .. } => command_id::SHOUT,
            Body::Join { .. } => command_id::JOIN,
            Body::Leave { .. } => command_id::LEAVE,
            Body::Ping => command_id::PING,
            Body::PingOk => command_id::PING_OK,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Body::Hello(_) => "HELLO",
            Body::Whisper { .. } => "WHISPER",
            Body::Shout { .. } => "SHOUT",
            Body::Join { .. } => "JOIN",
            Body::Leave { .. } => "LEAVE",
            Body::Ping => "PING",
            Body::PingOk => "PING_OK",
        }
    }
}
