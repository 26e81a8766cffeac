//! Public node handle: owns the runtime pieces (inbox, beacon, engine task)
//! and talks to the engine task over channels.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use zre_core::engine::{check_header, check_join, check_name};
use zre_core::{CommandError, Content, Event, Headers, NodeEngine, PeerId};

use crate::actor::{self, Channels, Request};
use crate::config::Config;
use crate::discovery::{Beacon, Beaconing};
use crate::transport::{self, TcpConnector};

/// Inbound messages buffered between the inbox and the engine task.
const INBOX_QUEUE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node is not started")]
    NotStarted,
    #[error("node is already started")]
    AlreadyStarted,
    #[error("node has stopped")]
    Stopped,
    #[error("advertise host {0:?} is not an IP address")]
    AdvertiseHost(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

struct Running {
    requests: mpsc::UnboundedSender<Request>,
    endpoint: String,
    actor: JoinHandle<()>,
    inbox: JoinHandle<()>,
    beacon: Option<Beaconing>,
}

pub struct Node {
    config: Config,
    id: PeerId,
    name: String,
    headers: Headers,
    groups: Vec<String>,
    events_tx: Option<mpsc::UnboundedSender<Event>>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    running: Option<Running>,
    stopped: bool,
}

impl Node {
    pub fn new(config: Config) -> Self {
        let id = PeerId::generate();
        let name = config.name.clone().unwrap_or_else(|| id.short_name());
        let headers = config.headers.clone();
        let groups = config.groups.clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            id,
            name,
            headers,
            groups,
            events_tx: Some(events_tx),
            events_rx,
            running: None,
            stopped: false,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn uuid(&self) -> String {
        self.id.to_string()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Our `tcp://host:port` endpoint once started.
    pub fn endpoint(&self) -> Option<&str> {
        self.running.as_ref().map(|r| r.endpoint.as_str())
    }

    /// Rename the node. Only before `start`.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), NodeError> {
        self.ensure_idle()?;
        let name = name.into();
        check_name(&name)?;
        self.name = name;
        Ok(())
    }

    /// Set a HELLO header. Peers met later see it. Headers that would not
    /// fit in a HELLO are refused.
    pub fn set_header(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), NodeError> {
        let (key, value) = (key.into(), value.into());
        check_header(&self.headers, &key, &value)?;
        self.headers.insert(key.clone(), value.clone());
        if let Some(running) = &self.running {
            let _ = running.requests.send(Request::SetHeader(key, value));
        }
        Ok(())
    }

    /// Bind the inbox, start beaconing and the engine task.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        self.ensure_idle()?;
        check_name(&self.name)?;
        let mut checked = Headers::new();
        for (key, value) in &self.headers {
            check_header(&checked, key, value)?;
            checked.insert(key.clone(), value.clone());
        }
        for (joined, group) in self.groups.iter().enumerate() {
            check_join(joined, group)?;
        }

        let listener = transport::bind_inbox(&self.config.bind_host, self.config.inbox_port).await?;
        let local = listener.local_addr()?;
        let host = advertise_ip(&self.config, local)?;
        let endpoint = format!("tcp://{}", SocketAddr::new(host, local.port()));

        let connector = TcpConnector::new(Handle::current(), self.config.mailbox_capacity);
        let mut engine = NodeEngine::new(
            self.id,
            self.name.clone(),
            endpoint.clone(),
            Box::new(connector),
            self.config.engine_config(),
        );
        for (key, value) in &self.headers {
            engine.set_header(key.clone(), value.clone())?;
        }
        for group in &self.groups {
            engine.join(group)?;
        }

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_QUEUE);
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let beacon = if self.config.beacon_enabled {
            let beacon = Beacon {
                peer: self.id,
                port: local.port(),
            };
            Some(Beaconing::publish(
                beacon,
                self.config.discovery_port,
                self.config.beacon_interval(),
                discovery_tx,
            )?)
        } else {
            None
        };
        let events = self.events_tx.take().ok_or(NodeError::Stopped)?;
        let inbox = tokio::spawn(transport::run_inbox(listener, inbox_tx));
        let actor = tokio::spawn(actor::run(
            engine,
            Channels {
                requests: requests_rx,
                inbox: inbox_rx,
                discovery: discovery_rx,
                events,
            },
        ));
        tracing::info!(id = %self.id, name = %self.name, endpoint = %endpoint, "node started");
        self.running = Some(Running {
            requests: requests_tx,
            endpoint,
            actor,
            inbox,
            beacon,
        });
        Ok(())
    }

    /// Stop beaconing, disconnect from every peer and end the event stream
    /// with STOP. Does nothing if not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.stopped = true;
        // Peers must hear the withdrawal before our mailboxes close, or the
        // next beacon would reconnect them.
        if let Some(beacon) = running.beacon {
            beacon.withdraw().await;
        }
        drop(running.requests);
        if let Err(e) = running.actor.await {
            tracing::warn!(error = %e, "engine task failed");
        }
        running.inbox.abort();
        tracing::info!(id = %self.id, "node stopped");
    }

    /// Next event, or `None` once the node has stopped and every event was read.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    /// Join a group. Before `start` this only records it.
    pub fn join(&mut self, group: &str) -> Result<(), NodeError> {
        if self.stopped {
            return Err(NodeError::Stopped);
        }
        if self.groups.iter().any(|g| g == group) {
            return Ok(());
        }
        check_join(self.groups.len(), group)?;
        if self.running.is_some() {
            self.request(Request::Join(group.to_string()))?;
        }
        self.groups.push(group.to_string());
        Ok(())
    }

    pub fn leave(&mut self, group: &str) -> Result<(), NodeError> {
        if self.stopped {
            return Err(NodeError::Stopped);
        }
        if self.running.is_some() {
            self.request(Request::Leave(group.to_string()))?;
        }
        self.groups.retain(|g| g != group);
        Ok(())
    }

    pub fn whisper(&self, peer: PeerId, content: Content) -> Result<(), NodeError> {
        self.request(Request::Whisper(peer, content))
    }

    /// Whisper a single string frame.
    pub fn whispers(&self, peer: PeerId, text: &str) -> Result<(), NodeError> {
        self.whisper(peer, vec![text.as_bytes().to_vec()])
    }

    pub fn shout(&self, group: &str, content: Content) -> Result<(), NodeError> {
        self.request(Request::Shout(group.to_string(), content))
    }

    /// Shout a single string frame.
    pub fn shouts(&self, group: &str, text: &str) -> Result<(), NodeError> {
        self.shout(group, vec![text.as_bytes().to_vec()])
    }

    /// Connect to a node we know about without waiting for its beacon.
    pub fn require_peer(&self, peer: PeerId, endpoint: &str) -> Result<(), NodeError> {
        self.request(Request::RequirePeer(peer, endpoint.to_string()))
    }

    pub async fn peers(&self) -> Result<Vec<PeerId>, NodeError> {
        self.query(Request::Peers).await
    }

    pub async fn peers_in_group(&self, group: &str) -> Result<Vec<PeerId>, NodeError> {
        let group = group.to_string();
        self.query(|reply| Request::PeersInGroup(group, reply)).await
    }

    pub async fn own_groups(&self) -> Result<Vec<String>, NodeError> {
        self.query(Request::OwnGroups).await
    }

    pub async fn peer_groups(&self) -> Result<Vec<String>, NodeError> {
        self.query(Request::PeerGroups).await
    }

    pub async fn peer_endpoint(&self, peer: PeerId) -> Result<Option<String>, NodeError> {
        self.query(|reply| Request::PeerEndpoint(peer, reply)).await
    }

    pub async fn peer_name(&self, peer: PeerId) -> Result<Option<String>, NodeError> {
        self.query(|reply| Request::PeerName(peer, reply)).await
    }

    pub async fn peer_header(
        &self,
        peer: PeerId,
        key: &str,
    ) -> Result<Option<String>, NodeError> {
        let key = key.to_string();
        self.query(|reply| Request::PeerHeader(peer, key, reply)).await
    }

    fn ensure_idle(&self) -> Result<(), NodeError> {
        if self.stopped {
            return Err(NodeError::Stopped);
        }
        if self.running.is_some() {
            return Err(NodeError::AlreadyStarted);
        }
        Ok(())
    }

    fn request(&self, req: Request) -> Result<(), NodeError> {
        let running = self.running.as_ref().ok_or(if self.stopped {
            NodeError::Stopped
        } else {
            NodeError::NotStarted
        })?;
        running.requests.send(req).map_err(|_| NodeError::Stopped)
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.request(make(tx))?;
        rx.await.map_err(|_| NodeError::Stopped)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // The engine task ends by itself once the request channel closes.
        if let Some(running) = self.running.take() {
            running.inbox.abort();
            if let Some(beacon) = running.beacon {
                beacon.abort();
            }
        }
    }
}

fn advertise_ip(config: &Config, local: SocketAddr) -> Result<IpAddr, NodeError> {
    if let Some(host) = &config.advertise_host {
        return host
            .parse()
            .map_err(|_| NodeError::AdvertiseHost(host.clone()));
    }
    if !local.ip().is_unspecified() {
        return Ok(local.ip());
    }
    Ok(detect_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)))
}

/// Address of the interface that routes outward. Connecting a UDP socket
/// sends nothing.
fn detect_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
