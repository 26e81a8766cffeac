//! ZRE (ZeroMQ Realtime Exchange) node core.
//! Host-driven: no I/O of its own; the host feeds in frames, discovery
//! reports and clock ticks, and drains events for the application.

pub mod config;
pub mod engine;
pub mod event;
pub mod group;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod transport;
pub mod wire;

pub use config::EngineConfig;
pub use engine::{CommandError, DiscoveryEvent, NodeEngine, ProtocolViolation};
pub use event::Event;
pub use identity::{ParsePeerIdError, PeerId, ROUTING_ID_LEN};
pub use protocol::{Body, Content, Headers, Hello, Message, PROTOCOL_VERSION, SIGNATURE};
pub use transport::{ConnectError, Connector, Mailbox, MemoryNetwork, SendError};
pub use wire::{decode, decode_frame, encode, EncodeError, MalformedMessage};
