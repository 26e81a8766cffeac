//! TCP carriage: one outbound connection per peer (our mailbox to it) and one
//! inbox listener for everyone else's.
//!
//! A connection opens with the sender's 17-byte routing id. Each message
//! follows as a u32 LE frame count, then per frame a u32 LE length and the bytes.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use zre_core::{ConnectError, Connector, Content, Mailbox, SendError, ROUTING_ID_LEN};

pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
pub const MAX_FRAMES: u32 = 1024;

/// A message read off the inbox with the routing id of the connection it came in on.
pub type Inbound = (Vec<u8>, Content);

pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    frames: &[Vec<u8>],
) -> io::Result<()> {
    if frames.len() > MAX_FRAMES as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "too many frames"));
    }
    let total: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut buf = Vec::with_capacity(4 + total);
    buf.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for frame in frames {
        if frame.len() > MAX_FRAME_LEN as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
        }
        buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        buf.extend_from_slice(frame);
    }
    w.write_all(&buf).await
}

pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Content> {
    let count = r.read_u32_le().await?;
    if count > MAX_FRAMES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "too many frames"));
    }
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = r.read_u32_le().await?;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
        }
        let mut frame = vec![0u8; len as usize];
        r.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(frames)
}

/// `tcp://ip:port` to a socket address.
pub fn parse_endpoint(endpoint: &str) -> Result<SocketAddr, ConnectError> {
    endpoint
        .strip_prefix("tcp://")
        .and_then(|addr| addr.parse().ok())
        .ok_or_else(|| ConnectError::InvalidEndpoint(endpoint.to_string()))
}

/// Opens TCP mailboxes. Each one is a writer task fed by a bounded queue; the
/// connection itself is made by the task, so an unreachable peer shows up as
/// [`SendError::Disconnected`] on a later send.
pub struct TcpConnector {
    handle: Handle,
    capacity: usize,
}

impl TcpConnector {
    pub fn new(handle: Handle, capacity: usize) -> Self {
        Self {
            handle,
            capacity: capacity.max(1),
        }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &mut self,
        routing_id: [u8; ROUTING_ID_LEN],
        endpoint: &str,
    ) -> Result<Box<dyn Mailbox>, ConnectError> {
        let addr = parse_endpoint(endpoint)?;
        let (tx, rx) = mpsc::channel(self.capacity);
        let (alive, closed) = oneshot::channel();
        self.handle.spawn(run_writer(addr, routing_id, rx, closed));
        Ok(Box::new(TcpMailbox { tx, _alive: alive }))
    }
}

struct TcpMailbox {
    tx: mpsc::Sender<Content>,
    /// Dropping the mailbox drops this, which stops the writer and discards
    /// whatever is still queued.
    _alive: oneshot::Sender<()>,
}

impl Mailbox for TcpMailbox {
    fn send(&mut self, frames: Content) -> Result<(), SendError> {
        // The writer could not frame it and would drop the connection.
        if frames.len() > MAX_FRAMES as usize
            || frames.iter().any(|f| f.len() > MAX_FRAME_LEN as usize)
        {
            return Err(SendError::Oversized);
        }
        self.tx.try_send(frames).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::WouldBlock,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }
}

async fn run_writer(
    addr: SocketAddr,
    routing_id: [u8; ROUTING_ID_LEN],
    mut rx: mpsc::Receiver<Content>,
    mut closed: oneshot::Receiver<()>,
) {
    let result: io::Result<()> = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&routing_id).await?;
        loop {
            tokio::select! {
                biased;
                _ = &mut closed => return Ok(()),
                next = rx.recv() => match next {
                    Some(frames) => write_message(&mut stream, &frames).await?,
                    None => return Ok(()),
                },
            }
        }
    }
    .await;
    if let Err(e) = result {
        tracing::debug!(%addr, error = %e, "peer connection closed");
    }
}

pub async fn bind_inbox(host: &str, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((host, port)).await
}

/// Accept peer connections and forward their messages to `tx` until the
/// listener fails or `tx` is closed.
pub async fn run_inbox(listener: TcpListener, tx: mpsc::Sender<Inbound>) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = read_connection(stream, tx).await {
                        tracing::debug!(%from, error = %e, "inbox connection dropped");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "inbox accept failed");
                break;
            }
        }
        if tx.is_closed() {
            break;
        }
    }
}

async fn read_connection(mut stream: TcpStream, tx: mpsc::Sender<Inbound>) -> io::Result<()> {
    let mut routing_id = [0u8; ROUTING_ID_LEN];
    stream.read_exact(&mut routing_id).await?;
    loop {
        let frames = match read_message(&mut stream).await {
            Ok(frames) => frames,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        if tx.send((routing_id.to_vec(), frames)).await.is_err() {
            return Ok(());
        }
    }
}
