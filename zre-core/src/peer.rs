//! One remote node: its mailbox, declared identity, sequencing and liveness deadlines.

use std::time::{Duration, Instant};

use crate::identity::PeerId;
use crate::protocol::{Headers, Message};
use crate::transport::{ConnectError, Connector, Mailbox, SendError};
use crate::wire;

pub struct Peer {
    id: PeerId,
    mailbox: Option<Box<dyn Mailbox>>,
    endpoint: String,
    name: Option<String>,
    headers: Headers,
    /// Peer's join/leave change counter as we have tracked it.
    status: u8,
    sent_sequence: u16,
    want_sequence: u16,
    ready: bool,
    evasive_at: Instant,
    expired_at: Instant,
    /// Set once we have pinged the peer for the current silence window.
    evasive: bool,
}

impl Peer {
    pub fn new(id: PeerId, now: Instant) -> Self {
        Self {
            id,
            mailbox: None,
            endpoint: String::new(),
            name: None,
            headers: Headers::new(),
            status: 0,
            sent_sequence: 0,
            want_sequence: 0,
            ready: false,
            evasive_at: now,
            expired_at: now,
            evasive: false,
        }
    }

    /// Open the mailbox to `endpoint`, announcing `local_id` as our routing id.
    /// On failure the peer stays disconnected.
    pub fn connect(
        &mut self,
        connector: &mut dyn Connector,
        local_id: PeerId,
        endpoint: &str,
    ) -> Result<(), ConnectError> {
        debug_assert!(!self.is_connected());
        let mailbox = connector.connect(local_id.routing_id(), endpoint)?;
        tracing::debug!(peer = %self.id, endpoint, "connected mailbox");
        self.mailbox = Some(mailbox);
        self.endpoint = endpoint.to_string();
        self.ready = false;
        Ok(())
    }

    /// Drop the mailbox and any messages still queued on it. Idempotent.
    pub fn disconnect(&mut self) {
        if self.mailbox.take().is_some() {
            tracing::debug!(peer = %self.id, endpoint = %self.endpoint, "disconnected mailbox");
        }
        self.ready = false;
    }

    /// Stamp the next sequence into `msg` and queue it. Silently drops the
    /// message when disconnected. A mailbox failure disconnects the peer; a
    /// message that cannot be encoded or carried is rejected on its own and
    /// does not use up a sequence number.
    pub fn send(&mut self, mut msg: Message) -> Result<(), SendError> {
        if !self.is_connected() {
            return Ok(());
        }
        msg.sequence = self.sent_sequence.wrapping_add(1);
        let frames = wire::encode(&msg).map_err(|e| {
            tracing::warn!(peer = %self.id, command = msg.command(), error = %e, "cannot encode");
            SendError::Encode(e)
        })?;
        tracing::debug!(
            peer = %self.id,
            name = self.name(),
            command = msg.command(),
            sequence = msg.sequence,
            "send"
        );
        let sent = match self.mailbox.as_mut() {
            Some(mailbox) => mailbox.send(frames),
            None => Ok(()),
        };
        match sent {
            Ok(()) => {
                self.sent_sequence = msg.sequence;
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                tracing::warn!(
                    peer = %self.id,
                    command = msg.command(),
                    error = %e,
                    "message rejected"
                );
                Err(e)
            }
            Err(e) => {
                tracing::info!(
                    peer = %self.id,
                    name = self.name(),
                    error = %e,
                    "send failed, disconnecting"
                );
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Advance the expected inbound sequence and compare. Returns true when
    /// messages were lost. HELLO always restarts the sequence at 1.
    pub fn check_sequence(&mut self, msg: &Message) -> bool {
        if msg.is_hello() {
            self.want_sequence = 1;
        } else {
            self.want_sequence = self.want_sequence.wrapping_add(1);
        }
        tracing::debug!(
            peer = %self.id,
            name = self.name(),
            command = msg.command(),
            sequence = msg.sequence,
            "recv"
        );
        if msg.sequence != self.want_sequence {
            tracing::warn!(
                peer = %self.id,
                name = self.name(),
                expected = self.want_sequence,
                got = msg.sequence,
                "sequence error"
            );
            return true;
        }
        false
    }

    /// Register activity: push both liveness deadlines out from `now`.
    pub fn refresh(&mut self, now: Instant, evasive_timeout: Duration, expired_timeout: Duration) {
        self.evasive_at = now + evasive_timeout;
        self.expired_at = now + expired_timeout;
        self.evasive = false;
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.mailbox.is_some()
    }

    /// Endpoint we connected to; empty when disconnected.
    pub fn endpoint(&self) -> &str {
        if self.is_connected() {
            &self.endpoint
        } else {
            ""
        }
    }

    /// Public name from HELLO, or empty before HELLO.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// True once the peer's HELLO has been processed, i.e. the application
    /// was told it entered.
    pub fn has_entered(&self) -> bool {
        self.name.is_some()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Replace the header dictionary wholesale.
    pub fn set_headers(&mut self, headers: Headers) {
        self.headers = headers;
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn set_status(&mut self, status: u8) {
        self.status = status;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn want_sequence(&self) -> u16 {
        self.want_sequence
    }

    pub fn sent_sequence(&self) -> u16 {
        self.sent_sequence
    }

    pub fn evasive_at(&self) -> Instant {
        self.evasive_at
    }

    pub fn expired_at(&self) -> Instant {
        self.expired_at
    }

    pub fn is_evasive(&self) -> bool {
        self.evasive
    }

    pub fn set_evasive(&mut self) {
        self.evasive = true;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("ready", &self.ready)
            .field("status", &self.status)
            .finish()
    }
}
