//! The task that owns the engine. Everything that touches node state goes
//! through its request channel.

use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use zre_core::{Content, DiscoveryEvent, Event, NodeEngine, PeerId};

use crate::transport::Inbound;

pub(crate) enum Request {
    SetHeader(String, String),
    Join(String),
    Leave(String),
    Whisper(PeerId, Content),
    Shout(String, Content),
    RequirePeer(PeerId, String),
    Peers(oneshot::Sender<Vec<PeerId>>),
    PeersInGroup(String, oneshot::Sender<Vec<PeerId>>),
    OwnGroups(oneshot::Sender<Vec<String>>),
    PeerGroups(oneshot::Sender<Vec<String>>),
    PeerEndpoint(PeerId, oneshot::Sender<Option<String>>),
    PeerName(PeerId, oneshot::Sender<Option<String>>),
    PeerHeader(PeerId, String, oneshot::Sender<Option<String>>),
}

pub(crate) struct Channels {
    pub requests: mpsc::UnboundedReceiver<Request>,
    pub inbox: mpsc::Receiver<Inbound>,
    pub discovery: mpsc::UnboundedReceiver<DiscoveryEvent>,
    pub events: mpsc::UnboundedSender<Event>,
}

/// Run until the request channel closes, then shut the engine down.
pub(crate) async fn run(mut engine: NodeEngine, mut ch: Channels) {
    let interval = engine.config().reap_interval;
    let mut reap_at = tokio::time::Instant::now() + interval;
    loop {
        tokio::select! {
            req = ch.requests.recv() => match req {
                Some(req) => handle(&mut engine, req),
                None => break,
            },
            Some((routing_id, frames)) = ch.inbox.recv() => {
                engine.recv_peer(&routing_id, frames, Instant::now());
            }
            Some(event) = ch.discovery.recv() => {
                engine.on_discovery(event, Instant::now());
            }
            _ = tokio::time::sleep_until(reap_at) => {
                engine.reap(Instant::now());
                reap_at = tokio::time::Instant::now() + interval;
            }
        }
        forward(&mut engine, &ch.events);
    }
    engine.shutdown();
    forward(&mut engine, &ch.events);
}

fn forward(engine: &mut NodeEngine, events: &mpsc::UnboundedSender<Event>) {
    for event in engine.drain_events() {
        // Nobody listening is fine.
        let _ = events.send(event);
    }
}

fn handle(engine: &mut NodeEngine, req: Request) {
    match req {
        Request::SetHeader(key, value) => {
            if let Err(e) = engine.set_header(key, value) {
                tracing::warn!(error = %e, "header refused");
            }
        }
        Request::Join(group) => {
            if let Err(e) = engine.join(&group) {
                tracing::warn!(group, error = %e, "join refused");
            }
        }
        Request::Leave(group) => engine.leave(&group),
        Request::Whisper(peer, content) => engine.whisper(peer, content),
        Request::Shout(group, content) => engine.shout(&group, content),
        Request::RequirePeer(peer, endpoint) => {
            engine.on_discovery(DiscoveryEvent::Found { peer, endpoint }, Instant::now())
        }
        Request::Peers(reply) => {
            let _ = reply.send(engine.peers());
        }
        Request::PeersInGroup(group, reply) => {
            let _ = reply.send(engine.peers_in_group(&group));
        }
        Request::OwnGroups(reply) => {
            let _ = reply.send(engine.own_groups());
        }
        Request::PeerGroups(reply) => {
            let _ = reply.send(engine.peer_groups());
        }
        Request::PeerEndpoint(peer, reply) => {
            let _ = reply.send(engine.peer_endpoint(&peer));
        }
        Request::PeerName(peer, reply) => {
            let _ = reply.send(engine.peer_name(&peer));
        }
        Request::PeerHeader(peer, key, reply) => {
            let _ = reply.send(engine.peer_header(&peer, &key));
        }
    }
}
