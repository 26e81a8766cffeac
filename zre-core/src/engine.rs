//! Host-driven node engine: the host feeds in application commands, inbound
//! frames, discovery events and reap ticks; the engine updates peer and group
//! state, talks to peers through their mailboxes, and queues [`Event`]s for
//! the application.
//!
//! The engine owns every [`Peer`] and [`Group`]. Nothing else mutates them,
//! and nothing handed out of the engine borrows from them.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::config::EngineConfig;
use crate::event::Event;
use crate::group::Group;
use crate::identity::PeerId;
use crate::peer::Peer;
use crate::protocol::{Body, Content, Headers, Hello, Message};
use crate::transport::Connector;
use crate::wire::{self, MAX_ITEMS, MAX_STRING_LEN};

/// What a discovery mechanism (beacons, explicit introduction) reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A node announced itself at `endpoint`.
    Found { peer: PeerId, endpoint: String },
    /// A node announced it is going away.
    Lost { peer: PeerId },
}

/// A peer said something inconsistent with what we tracked. Logged, not fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("{command} carried status {got}, expected {expected}")]
    StatusMismatch {
        command: &'static str,
        expected: u8,
        got: u8,
    },
}

/// A local command that would produce a message the wire format cannot carry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("header key {0:?} contains '='")]
    HeaderKey(String),
    #[error("header {key:?} encodes to {len} bytes, limit is 255")]
    HeaderTooLong { key: String, len: usize },
    #[error("already 255 headers")]
    TooManyHeaders,
    #[error("group name is {0} bytes, limit is 255")]
    GroupNameTooLong(usize),
    #[error("already in 255 groups")]
    TooManyGroups,
    #[error("node name is {0} bytes, limit is 255")]
    NameTooLong(usize),
}

/// Check that `key=value` can be added to `headers` and still fit in a HELLO.
pub fn check_header(headers: &Headers, key: &str, value: &str) -> Result<(), CommandError> {
    if key.contains('=') {
        return Err(CommandError::HeaderKey(key.to_string()));
    }
    let len = key.len() + 1 + value.len();
    if len > MAX_STRING_LEN {
        return Err(CommandError::HeaderTooLong {
            key: key.to_string(),
            len,
        });
    }
    if !headers.contains_key(key) && headers.len() >= MAX_ITEMS {
        return Err(CommandError::TooManyHeaders);
    }
    Ok(())
}

/// Check that a node already in `joined` groups can join `group`.
pub fn check_join(joined: usize, group: &str) -> Result<(), CommandError> {
    if group.len() > MAX_STRING_LEN {
        return Err(CommandError::GroupNameTooLong(group.len()));
    }
    if joined >= MAX_ITEMS {
        return Err(CommandError::TooManyGroups);
    }
    Ok(())
}

pub fn check_name(name: &str) -> Result<(), CommandError> {
    if name.len() > MAX_STRING_LEN {
        return Err(CommandError::NameTooLong(name.len()));
    }
    Ok(())
}

pub struct NodeEngine {
    id: PeerId,
    name: String,
    endpoint: String,
    headers: Headers,
    /// Our own join/leave change counter.
    status: u8,
    own_groups: BTreeSet<String>,
    peers: HashMap<PeerId, Peer>,
    peer_groups: HashMap<String, Group>,
    connector: Box<dyn Connector>,
    config: EngineConfig,
    events: Vec<Event>,
    stopped: bool,
}

impl NodeEngine {
    /// `endpoint` is where our inbox listens; it goes out in every HELLO.
    pub fn new(
        id: PeerId,
        name: impl Into<String>,
        endpoint: impl Into<String>,
        connector: Box<dyn Connector>,
        config: EngineConfig,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            endpoint: endpoint.into(),
            headers: Headers::new(),
            status: 0,
            own_groups: BTreeSet::new(),
            peers: HashMap::new(),
            peer_groups: HashMap::new(),
            connector,
            config,
            events: Vec::new(),
            stopped: false,
        }
    }

    // ---- application commands ----

    /// Set a header sent in future HELLOs. Headers that would not fit in a
    /// HELLO are refused.
    pub fn set_header(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), CommandError> {
        let (key, value) = (key.into(), value.into());
        check_header(&self.headers, &key, &value)?;
        self.headers.insert(key, value);
        Ok(())
    }

    /// Join a group and tell every known peer. No-op if already joined.
    pub fn join(&mut self, group: &str) -> Result<(), CommandError> {
        if self.own_groups.contains(group) {
            return Ok(());
        }
        check_join(self.own_groups.len(), group)?;
        self.own_groups.insert(group.to_string());
        self.status = self.status.wrapping_add(1);
        tracing::info!(node = %self.name, group, status = self.status, "joining group");
        self.broadcast(Message::new(Body::Join {
            group: group.to_string(),
            status: self.status,
        }));
        Ok(())
    }

    /// Leave a group and tell every known peer. No-op if not joined.
    pub fn leave(&mut self, group: &str) {
        if !self.own_groups.remove(group) {
            return;
        }
        self.status = self.status.wrapping_add(1);
        tracing::info!(node = %self.name, group, status = self.status, "leaving group");
        self.broadcast(Message::new(Body::Leave {
            group: group.to_string(),
            status: self.status,
        }));
    }

    /// Send to one peer. Unknown peers are ignored.
    pub fn whisper(&mut self, peer: PeerId, content: Content) {
        let Some(target) = self.peers.get_mut(&peer) else {
            tracing::debug!(%peer, "whisper to unknown peer dropped");
            return;
        };
        let sent = target.send(Message::new(Body::Whisper { content }));
        if sent.is_err_and(|e| e.is_fatal()) {
            self.remove_peer(peer);
        }
    }

    /// Send to every peer in `group`. Groups no peer has joined are ignored.
    pub fn shout(&mut self, group: &str, content: Content) {
        let Some(members) = self.peer_groups.get(group) else {
            tracing::debug!(group, "shout to unknown group dropped");
            return;
        };
        let msg = Message::new(Body::Shout {
            group: group.to_string(),
            content,
        });
        let failed = members.send(&mut self.peers, &msg);
        for id in failed {
            self.remove_peer(id);
        }
    }

    /// Disconnect every peer and report STOP. Later calls do nothing.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        tracing::info!(node = %self.name, peers = self.peers.len(), "shutting down");
        for peer in self.peers.values_mut() {
            peer.disconnect();
        }
        self.peers.clear();
        self.peer_groups.clear();
        self.stopped = true;
        self.events.push(Event::Stop);
    }

    // ---- network and timer input ----

    /// Handle a discovery report.
    pub fn on_discovery(&mut self, event: DiscoveryEvent, now: Instant) {
        match event {
            DiscoveryEvent::Found { peer, endpoint } => self.on_peer_found(peer, &endpoint, now),
            DiscoveryEvent::Lost { peer } => self.on_peer_lost(peer),
        }
    }

    /// A node was seen at `endpoint`: admit it if new, otherwise count the
    /// sighting as proof of life.
    pub fn on_peer_found(&mut self, peer: PeerId, endpoint: &str, now: Instant) {
        if self.stopped {
            return;
        }
        if let Some(id) = self.require_peer(peer, endpoint, now) {
            self.refresh(id, now);
        }
    }

    /// A node announced it is leaving. Unknown peers are ignored.
    pub fn on_peer_lost(&mut self, peer: PeerId) {
        if self.stopped || !self.peers.contains_key(&peer) {
            return;
        }
        tracing::info!(%peer, "discovery lost peer");
        self.remove_peer(peer);
    }

    /// Handle one inbound message: `routing_id` names the sending node,
    /// `frames` is the encoded message.
    pub fn recv_peer(&mut self, routing_id: &[u8], frames: Content, now: Instant) {
        if self.stopped {
            return;
        }
        let msg = match wire::decode(frames) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed message");
                return;
            }
        };
        let Some(id) = PeerId::from_routing_id(routing_id) else {
            tracing::debug!(len = routing_id.len(), "dropping message with bad routing id");
            return;
        };

        if let Body::Hello(hello) = &msg.body {
            if self.peers.get(&id).is_some_and(Peer::is_ready) {
                // Same identity greeting us again: a restarted node.
                tracing::info!(peer = %id, "peer said HELLO again, replacing");
                self.remove_peer(id);
            }
            let endpoint = hello.endpoint.clone();
            match self.require_peer(id, &endpoint, now) {
                Some(_) => {
                    if let Some(peer) = self.peers.get_mut(&id) {
                        peer.set_ready(true);
                    }
                }
                None => return,
            }
        }

        let Some(peer) = self.peers.get_mut(&id).filter(|p| p.is_ready()) else {
            tracing::debug!(
                peer = %id,
                command = msg.command(),
                "ignoring message from unready peer"
            );
            return;
        };
        if peer.check_sequence(&msg) {
            tracing::warn!(peer = %id, "lost messages from peer, removing");
            self.remove_peer(id);
            return;
        }

        match msg.body {
            Body::Hello(hello) => self.on_hello(id, hello),
            Body::Whisper { content } => {
                let name = self.peer_name_or_empty(&id);
                self.events.push(Event::Whisper {
                    peer: id,
                    name,
                    content,
                });
            }
            Body::Shout { group, content } => {
                let name = self.peer_name_or_empty(&id);
                self.events.push(Event::Shout {
                    peer: id,
                    name,
                    group,
                    content,
                });
            }
            Body::Join { group, status } => {
                self.join_peer_group(id, &group);
                self.check_status(id, "JOIN", status);
            }
            Body::Leave { group, status } => {
                self.leave_peer_group(id, &group);
                self.check_status(id, "LEAVE", status);
            }
            Body::Ping => {
                let failed = self.peers.get_mut(&id).is_some_and(|p| {
                    p.send(Message::new(Body::PingOk))
                        .is_err_and(|e| e.is_fatal())
                });
                if failed {
                    self.remove_peer(id);
                    return;
                }
            }
            Body::PingOk => {}
        }
        self.refresh(id, now);
    }

    /// Sweep the peer table: ping evasive peers once per silence window,
    /// remove expired ones.
    pub fn reap(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };
            if now >= peer.expired_at() {
                tracing::info!(peer = %id, name = peer.name(), "peer expired");
                self.remove_peer(id);
            } else if now >= peer.evasive_at() && !peer.is_evasive() {
                peer.set_evasive();
                let visible = peer.has_entered();
                let name = peer.name().to_string();
                let failed = peer.send(Message::new(Body::Ping)).is_err_and(|e| e.is_fatal());
                if visible {
                    tracing::debug!(peer = %id, name = %name, "peer evasive");
                    self.events.push(Event::Evasive { peer: id, name });
                }
                if failed {
                    self.remove_peer(id);
                }
            }
        }
    }

    /// Take every event queued since the last call, oldest first.
    pub fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    // ---- queries ----

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Peers that have completed their HELLO.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.is_ready())
            .map(Peer::id)
            .collect();
        ids.sort();
        ids
    }

    pub fn peers_in_group(&self, group: &str) -> Vec<PeerId> {
        self.peer_groups
            .get(group)
            .map(Group::members)
            .unwrap_or_default()
    }

    /// Groups we have joined.
    pub fn own_groups(&self) -> Vec<String> {
        self.own_groups.iter().cloned().collect()
    }

    /// Groups at least one peer is in.
    pub fn peer_groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peer_groups.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn peer_endpoint(&self, peer: &PeerId) -> Option<String> {
        self.ready_peer(peer).map(|p| p.endpoint().to_string())
    }

    pub fn peer_name(&self, peer: &PeerId) -> Option<String> {
        self.ready_peer(peer).map(|p| p.name().to_string())
    }

    pub fn peer_header(&self, peer: &PeerId, key: &str) -> Option<String> {
        self.ready_peer(peer)?.header(key).map(str::to_string)
    }

    // ---- internals ----

    fn ready_peer(&self, peer: &PeerId) -> Option<&Peer> {
        self.peers.get(peer).filter(|p| p.is_ready())
    }

    fn peer_name_or_empty(&self, peer: &PeerId) -> String {
        self.peers
            .get(peer)
            .map(|p| p.name().to_string())
            .unwrap_or_default()
    }

    /// Find or admit the peer `id` at `endpoint`. A new peer is connected and
    /// greeted with our HELLO as its first message. Returns `None` when the
    /// peer is ourselves or cannot be connected.
    fn require_peer(&mut self, id: PeerId, endpoint: &str, now: Instant) -> Option<PeerId> {
        if id == self.id || endpoint == self.endpoint {
            return None;
        }
        if self.peers.contains_key(&id) {
            return Some(id);
        }

        // An older incarnation at the same address is gone.
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.endpoint() == endpoint)
            .map(Peer::id)
            .collect();
        for old in stale {
            tracing::info!(peer = %old, endpoint, "purging peer at reused endpoint");
            self.remove_peer(old);
        }

        let mut peer = Peer::new(id, now);
        if let Err(e) = peer.connect(self.connector.as_mut(), self.id, endpoint) {
            tracing::warn!(peer = %id, endpoint, error = %e, "cannot connect to peer");
            return None;
        }
        let hello = Message::new(Body::Hello(Hello {
            endpoint: self.endpoint.clone(),
            groups: self.own_groups(),
            status: self.status,
            name: self.name.clone(),
            headers: self.headers.clone(),
        }));
        if let Err(e) = peer.send(hello) {
            tracing::warn!(peer = %id, endpoint, error = %e, "cannot greet peer");
            return None;
        }
        peer.refresh(now, self.config.evasive_timeout, self.config.expired_timeout);
        self.peers.insert(id, peer);
        Some(id)
    }

    fn on_hello(&mut self, id: PeerId, hello: Hello) {
        let Hello {
            groups,
            status,
            name,
            headers,
            ..
        } = hello;
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.set_name(name.clone());
        peer.set_headers(headers.clone());
        let endpoint = peer.endpoint().to_string();
        tracing::info!(peer = %id, name = %name, endpoint = %endpoint, "peer entered");
        self.events.push(Event::Enter {
            peer: id,
            name,
            headers,
            endpoint,
        });
        for group in &groups {
            self.join_peer_group(id, group);
        }
        // Status comes last: the join list already reflects it.
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.set_status(status);
        }
    }

    fn join_peer_group(&mut self, id: PeerId, group: &str) {
        self.peer_groups
            .entry(group.to_string())
            .or_insert_with(|| Group::new(group))
            .join(id);
        let name = self.peer_name_or_empty(&id);
        tracing::info!(peer = %id, name = %name, group, "peer joined group");
        self.events.push(Event::Join {
            peer: id,
            name,
            group: group.to_string(),
        });
    }

    fn leave_peer_group(&mut self, id: PeerId, group: &str) {
        if let Some(members) = self.peer_groups.get_mut(group) {
            members.leave(id);
            if members.is_empty() {
                self.peer_groups.remove(group);
            }
        }
        let name = self.peer_name_or_empty(&id);
        tracing::info!(peer = %id, name = %name, group, "peer left group");
        self.events.push(Event::Leave {
            peer: id,
            name,
            group: group.to_string(),
        });
    }

    /// JOIN and LEAVE each advance the sender's status by one.
    fn check_status(&mut self, id: PeerId, command: &'static str, got: u8) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        let expected = peer.status().wrapping_add(1);
        if got != expected {
            let violation = ProtocolViolation::StatusMismatch {
                command,
                expected,
                got,
            };
            tracing::warn!(
                peer = %id,
                name = peer.name(),
                error = %violation,
                "protocol violation"
            );
        }
        peer.set_status(got);
    }

    fn refresh(&mut self, id: PeerId, now: Instant) {
        let (evasive, expired) = (self.config.evasive_timeout, self.config.expired_timeout);
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.refresh(now, evasive, expired);
        }
    }

    /// Send a copy of `msg` to every known peer; drop the ones that fail.
    fn broadcast(&mut self, msg: Message) {
        let mut failed = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            if peer.send(msg.clone()).is_err_and(|e| e.is_fatal()) {
                failed.push(*id);
            }
        }
        for id in failed {
            self.remove_peer(id);
        }
    }

    /// Disconnect and forget a peer. If the application knew it, report EXIT
    /// and then LEAVE for every group it was in.
    fn remove_peer(&mut self, id: PeerId) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        peer.disconnect();
        let mut groups: Vec<String> = self
            .peer_groups
            .iter()
            .filter(|(_, g)| g.contains(&id))
            .map(|(name, _)| name.clone())
            .collect();
        groups.sort();
        for group in &groups {
            if let Some(members) = self.peer_groups.get_mut(group) {
                members.leave(id);
                if members.is_empty() {
                    self.peer_groups.remove(group);
                }
            }
        }
        if !peer.has_entered() {
            return;
        }
        let name = peer.name().to_string();
        tracing::info!(peer = %id, name = %name, "peer exited");
        self.events.push(Event::Exit {
            peer: id,
            name: name.clone(),
        });
        for group in groups {
            self.events.push(Event::Leave {
                peer: id,
                name: name.clone(),
                group,
            });
        }
    }
}
