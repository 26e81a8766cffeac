//! Named set of peers. Members are held by id; the peers themselves live in
//! the engine's peer table.

use std::collections::{BTreeSet, HashMap};

use crate::identity::PeerId;
use crate::peer::Peer;
use crate::protocol::Message;

#[derive(Debug, Clone)]
pub struct Group {
    name: String,
    members: BTreeSet<PeerId>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member. Returns false if it already was one.
    pub fn join(&mut self, peer: PeerId) -> bool {
        self.members.insert(peer)
    }

    /// Remove a member. Returns false if it was not one.
    pub fn leave(&mut self, peer: PeerId) -> bool {
        self.members.remove(&peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Snapshot of the current members.
    pub fn members(&self) -> Vec<PeerId> {
        self.members.iter().copied().collect()
    }

    /// Send a copy of `msg` to every member found in `peers`. Delivery is
    /// best effort per member; returns the members that became unreachable.
    pub fn send(&self, peers: &mut HashMap<PeerId, Peer>, msg: &Message) -> Vec<PeerId> {
        let mut failed = Vec::new();
        for id in &self.members {
            let Some(peer) = peers.get_mut(id) else {
                continue;
            };
            if let Err(e) = peer.send(msg.clone()) {
                tracing::debug!(group = %self.name, peer = %id, error = %e, "group send failed");
                if e.is_fatal() {
                    failed.push(*id);
                }
            }
        }
        failed
    }
}
