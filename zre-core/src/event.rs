//! Events the engine reports to the application, in the order they happened.

use crate::identity::PeerId;
use crate::protocol::{Content, Headers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A peer completed its HELLO and is now visible.
    Enter {
        peer: PeerId,
        name: String,
        headers: Headers,
        endpoint: String,
    },
    /// A peer is gone: expired, lost messages, or replaced.
    Exit { peer: PeerId, name: String },
    /// A peer has been silent long enough to be pinged.
    Evasive { peer: PeerId, name: String },
    Join {
        peer: PeerId,
        name: String,
        group: String,
    },
    Leave {
        peer: PeerId,
        name: String,
        group: String,
    },
    Whisper {
        peer: PeerId,
        name: String,
        content: Content,
    },
    Shout {
        peer: PeerId,
        name: String,
        group: String,
        content: Content,
    },
    /// The engine has shut down. Always the last event.
    Stop,
}

impl Event {
    /// Event type as the protocol names it.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Enter { .. } => "ENTER",
            Event::Exit { .. } => "EXIT",
            Event::Evasive { .. } => "EVASIVE",
            Event::Join { .. } => "JOIN",
            Event::Leave { .. } => "LEAVE",
            Event::Whisper { .. } => "WHISPER",
            Event::Shout { .. } => "SHOUT",
            Event::Stop => "STOP",
        }
    }

    /// Peer the event concerns; `None` for STOP.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            Event::Enter { peer, .. }
            | Event::Exit { peer, .. }
            | Event::Evasive { peer, .. }
            | Event::Join { peer, .. }
            | Event::Leave { peer, .. }
            | Event::Whisper { peer, .. }
            | Event::Shout { peer, .. } => Some(*peer),
            Event::Stop => None,
        }
    }

    /// Group for JOIN, LEAVE and SHOUT.
    pub fn group(&self) -> Option<&str> {
        match self {
            Event::Join { group, .. } | Event::Leave { group, .. } | Event::Shout { group, .. } => {
                Some(group)
            }
            _ => None,
        }
    }

    /// Payload for WHISPER and SHOUT.
    pub fn content(&self) -> Option<&Content> {
        match self {
            Event::Whisper { content, .. } | Event::Shout { content, .. } => Some(content),
            _ => None,
        }
    }
}
