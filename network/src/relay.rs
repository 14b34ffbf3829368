//! Rendezvous relay over TCP.
//!
//! The server is a dumb switchboard: clients register a peer id, and frames
//! addressed to a registered id are forwarded to it untouched. Each client
//! multiplexes any number of links over its single TCP connection.

use crate::link::{channel_pair, Binding, Connector, Dialer, Link, LinkCommand, LinkEvent};
use crate::protocol::MAX_MESSAGE_SIZE;
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use room_core::{Error, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// How long a client waits for the server to confirm its registration
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest line accepted on a relay connection. Payloads are JSON escaped
/// inside JSON, which can double their size.
const MAX_FRAME_LEN: usize = 2 * MAX_MESSAGE_SIZE + 1024;

/// One line on the relay connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Client claims a peer id
    Register { id: PeerId },
    /// Server confirms the claim
    Registered { id: PeerId },
    /// Open link number `link` from `from` to `to`
    Dial { from: PeerId, to: PeerId, link: u64 },
    /// Server tells the dialer its link reached `peer`
    Open { peer: PeerId, origin: PeerId, link: u64 },
    /// One message on a link; `origin` is the peer that dialed it
    Data {
        from: PeerId,
        to: PeerId,
        origin: PeerId,
        link: u64,
        payload: String,
    },
    /// Graceful close of a link
    Close {
        from: PeerId,
        to: PeerId,
        origin: PeerId,
        link: u64,
    },
    /// `peer` is not registered (or the id is taken, for `link` 0)
    Unavailable { peer: PeerId, link: u64 },
    /// `id` disconnected from the relay
    Gone { id: PeerId },
}

fn encode_frame(frame: &RelayFrame) -> Result<String, Error> {
    let mut line = serde_json::to_string(frame)
        .map_err(|e| Error::Serialization(format!("Failed to encode relay frame: {}", e)))?;
    line.push('\n');
    Ok(line)
}

fn decode_frame(line: &str) -> Result<RelayFrame, Error> {
    serde_json::from_str(line)
        .map_err(|e| Error::Protocol(format!("Failed to decode relay frame: {}", e)))
}

/// Read one newline-terminated line of at most `limit` bytes.
///
/// Returns `None` at end of stream. A longer line is a protocol error and
/// leaves the stream mid-line, so the caller must drop the connection.
async fn read_line<R>(reader: &mut R, limit: usize) -> Result<Option<String>, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_line(&mut line)
        .await
        .map_err(|e| Error::Transport(format!("Relay read failed: {}", e)))?;
    if read == 0 {
        return Ok(None);
    }
    if line.len() > limit {
        return Err(Error::Protocol(format!(
            "Relay line exceeds the {} byte limit",
            limit
        )));
    }
    Ok(Some(line))
}

/// Write queued frames to the socket until the queue closes or the socket fails
async fn write_frames(mut write: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<RelayFrame>) {
    while let Some(frame) = frames.recv().await {
        let line = match encode_frame(&frame) {
            Ok(line) => line,
            Err(e) => {
                error!("{}", e);
                continue;
            }
        };
        if let Err(e) = write.write_all(line.as_bytes()).await {
            debug!("Relay write failed: {}", e);
            break;
        }
    }
}

type ClientTable = Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<RelayFrame>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The rendezvous server
pub struct RelayServer {
    listener: TcpListener,
    clients: ClientTable,
}

impl RelayServer {
    pub async fn bind(address: &str) -> Result<Self, Error> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind relay on {}: {}", address, e)))?;
        Ok(Self {
            listener,
            clients: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("Failed to get relay address: {}", e)))
    }

    /// Accept clients forever
    pub async fn run(self) -> Result<(), Error> {
        info!("Relay listening on {}", self.local_addr()?);
        loop {
            let (stream, address) = self.listener.accept().await?;
            debug!("Relay client connected from {}", address);
            tokio::spawn(serve_client(stream, address, self.clients.clone()));
        }
    }
}

async fn serve_client(stream: TcpStream, address: SocketAddr, clients: ClientTable) {
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(write, rx));
    let mut reader = BufReader::new(read);
    let mut registered: Option<PeerId> = None;

    loop {
        let line = match read_line(&mut reader, MAX_FRAME_LEN).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping relay client {}: {}", address, e);
                break;
            }
        };

        let frame = match decode_frame(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping frame from {}: {}", address, e);
                continue;
            }
        };

        match frame {
            RelayFrame::Register { id } => {
                if let Some(current) = &registered {
                    warn!("{} at {} tried to register again as {}", current, address, id);
                    let _ = tx.send(RelayFrame::Unavailable { peer: id, link: 0 });
                    continue;
                }
                let mut table = lock(&clients);
                if table.contains_key(&id) {
                    warn!("Peer id {} is already registered", id);
                    let _ = tx.send(RelayFrame::Unavailable { peer: id, link: 0 });
                } else {
                    info!("Registered {} from {}", id, address);
                    table.insert(id.clone(), tx.clone());
                    let _ = tx.send(RelayFrame::Registered { id: id.clone() });
                    registered = Some(id);
                }
            }
            RelayFrame::Dial { from, to, link } => {
                if registered.as_ref() != Some(&from) {
                    warn!("Dial from unregistered id {} at {}", from, address);
                    continue;
                }
                let target = lock(&clients).get(&to).cloned();
                match target {
                    Some(target) => {
                        let _ = target.send(RelayFrame::Dial {
                            from: from.clone(),
                            to: to.clone(),
                            link,
                        });
                        let _ = tx.send(RelayFrame::Open {
                            peer: to,
                            origin: from,
                            link,
                        });
                    }
                    None => {
                        let _ = tx.send(RelayFrame::Unavailable { peer: to, link });
                    }
                }
            }
            frame @ (RelayFrame::Data { .. } | RelayFrame::Close { .. }) => {
                let (from, to) = match &frame {
                    RelayFrame::Data { from, to, .. } | RelayFrame::Close { from, to, .. } => {
                        (from.clone(), to.clone())
                    }
                    _ => continue,
                };
                if registered.as_ref() != Some(&from) {
                    warn!("Dropping frame claiming to be from {} at {}", from, address);
                    continue;
                }
                let target = lock(&clients).get(&to).cloned();
                match target {
                    Some(target) => {
                        let _ = target.send(frame);
                    }
                    None => {
                        let _ = tx.send(RelayFrame::Gone { id: to });
                    }
                }
            }
            other => trace!("Ignoring {:?} from {}", other, address),
        }
    }

    if let Some(id) = registered {
        let others: Vec<mpsc::UnboundedSender<RelayFrame>> = {
            let mut table = lock(&clients);
            table.remove(&id);
            table.values().cloned().collect()
        };
        info!("{} left the relay", id);
        for other in others {
            let _ = other.send(RelayFrame::Gone { id: id.clone() });
        }
    }
    writer.abort();
}

/// Links of one client, keyed by (dialing peer, link number)
type LinkTable = HashMap<(PeerId, u64), (PeerId, mpsc::UnboundedSender<LinkEvent>)>;

struct ClientShared {
    local: PeerId,
    frames: mpsc::UnboundedSender<RelayFrame>,
    links: Mutex<LinkTable>,
    next_link: AtomicU64,
}

impl ClientShared {
    fn event(&self, key: &(PeerId, u64), event: LinkEvent) {
        if let Some((_, events)) = lock(&self.links).get(key) {
            let _ = events.send(event);
        }
    }

    fn finish(&self, key: &(PeerId, u64), event: LinkEvent) {
        if let Some((_, events)) = lock(&self.links).remove(key) {
            let _ = events.send(event);
        }
    }

    /// Whether `from` is the remote end of link `key`
    fn belongs_to(&self, key: &(PeerId, u64), from: &PeerId) -> bool {
        match lock(&self.links).get(key) {
            Some((remote, _)) if remote == from => true,
            Some((remote, _)) => {
                warn!(
                    "Dropping frame from {} on link {} of {} to {}",
                    from, key.1, key.0, remote
                );
                false
            }
            None => false,
        }
    }

    fn fail_all(&self, reason: &str) {
        for (_, (_, events)) in lock(&self.links).drain() {
            let _ = events.send(LinkEvent::Error(reason.to_string()));
        }
    }
}

/// Connector that reaches peers through a `RelayServer`
#[derive(Debug, Clone)]
pub struct RelayConnector {
    address: String,
}

impl RelayConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn bind(&self, local: PeerId) -> Result<Binding, Error> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            Error::Transport(format!("Failed to reach relay at {}: {}", self.address, e))
        })?;
        let (read, write) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_frames(write, frames_rx));

        frames_tx
            .send(RelayFrame::Register { id: local.clone() })
            .map_err(|_| Error::Transport("Relay writer stopped".to_string()))?;

        let mut reader = BufReader::new(read);
        let confirmed = timeout(REGISTER_TIMEOUT, read_line(&mut reader, MAX_FRAME_LEN))
            .await
            .map_err(|_| Error::Timeout("Relay did not confirm registration".to_string()))??;

        match confirmed.as_deref().map(decode_frame) {
            Some(Ok(RelayFrame::Registered { id })) if id == local => {}
            Some(Ok(RelayFrame::Unavailable { .. })) => {
                writer.abort();
                return Err(Error::Transport(format!("Peer id {} is taken", local)));
            }
            other => {
                writer.abort();
                return Err(Error::Protocol(format!(
                    "Unexpected relay registration reply: {:?}",
                    other
                )));
            }
        }
        info!("Registered {} with relay {}", local, self.address);

        let shared = Arc::new(ClientShared {
            local: local.clone(),
            frames: frames_tx,
            links: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(1),
        });
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        // The writer exits on its own once every frame sender is gone, which
        // lets frames queued by closing links reach the relay first.
        drop(writer);
        let reader = tokio::spawn(read_frames(reader, shared.clone(), incoming_tx));

        Ok(Binding {
            local,
            dialer: Box::new(RelayDialer {
                shared,
                reader: Mutex::new(Some(reader)),
            }),
            incoming: incoming_rx,
        })
    }
}

async fn read_frames(
    mut reader: BufReader<OwnedReadHalf>,
    shared: Arc<ClientShared>,
    incoming: mpsc::UnboundedSender<Link>,
) {
    loop {
        let line = match read_line(&mut reader, MAX_FRAME_LEN).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Leaving the relay: {}", e);
                break;
            }
        };
        let frame = match decode_frame(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };

        match frame {
            RelayFrame::Dial { from, link, .. } => {
                let (new_link, commands, events) = channel_pair(from.clone());
                let key = (from.clone(), link);
                let _ = events.send(LinkEvent::Open);
                lock(&shared.links).insert(key.clone(), (from.clone(), events));
                tokio::spawn(forward_commands(commands, shared.clone(), from, key));
                if incoming.send(new_link).is_err() {
                    break;
                }
            }
            RelayFrame::Open { origin, link, .. } => {
                shared.event(&(origin, link), LinkEvent::Open);
            }
            RelayFrame::Unavailable { peer, link } => {
                let key = (shared.local.clone(), link);
                shared.finish(&key, LinkEvent::Error(format!("peer-unavailable: {}", peer)));
            }
            RelayFrame::Data {
                from,
                origin,
                link,
                payload,
                ..
            } => {
                let key = (origin, link);
                if shared.belongs_to(&key, &from) {
                    shared.event(&key, LinkEvent::Message(payload.into_bytes()));
                }
            }
            RelayFrame::Close {
                from, origin, link, ..
            } => {
                let key = (origin, link);
                if shared.belongs_to(&key, &from) {
                    shared.finish(&key, LinkEvent::Closed);
                }
            }
            RelayFrame::Gone { id } => {
                let mut links = lock(&shared.links);
                let keys: Vec<(PeerId, u64)> = links
                    .iter()
                    .filter(|(_, (remote, _))| remote == &id)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in keys {
                    if let Some((_, events)) = links.remove(&key) {
                        let _ = events.send(LinkEvent::Error(format!("{} left the relay", id)));
                    }
                }
            }
            RelayFrame::Register { .. } | RelayFrame::Registered { .. } => {}
        }
    }

    shared.fail_all("relay connection lost");
}

/// Turn link commands into frames for the remote peer
async fn forward_commands(
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    shared: Arc<ClientShared>,
    remote: PeerId,
    key: (PeerId, u64),
) {
    let (origin, link) = key.clone();
    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Send(bytes) => {
                let payload = match String::from_utf8(bytes) {
                    Ok(payload) => payload,
                    Err(_) => {
                        warn!("Dropping non UTF-8 message to {}", remote);
                        continue;
                    }
                };
                let frame = RelayFrame::Data {
                    from: shared.local.clone(),
                    to: remote.clone(),
                    origin: origin.clone(),
                    link,
                    payload,
                };
                if shared.frames.send(frame).is_err() {
                    return;
                }
            }
            LinkCommand::Close => break,
        }
    }

    let _ = shared.frames.send(RelayFrame::Close {
        from: shared.local.clone(),
        to: remote,
        origin,
        link,
    });
    lock(&shared.links).remove(&key);
}

struct RelayDialer {
    shared: Arc<ClientShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Dialer for RelayDialer {
    fn dial(&self, remote: &PeerId) -> Result<Link, Error> {
        let link_no = self.shared.next_link.fetch_add(1, Ordering::Relaxed);
        let key = (self.shared.local.clone(), link_no);
        let (link, commands, events) = channel_pair(remote.clone());

        lock(&self.shared.links).insert(key.clone(), (remote.clone(), events));
        self.shared
            .frames
            .send(RelayFrame::Dial {
                from: self.shared.local.clone(),
                to: remote.clone(),
                link: link_no,
            })
            .map_err(|_| {
                lock(&self.shared.links).remove(&key);
                Error::Transport("Relay connection is closed".to_string())
            })?;

        tokio::spawn(forward_commands(
            commands,
            self.shared.clone(),
            remote.clone(),
            key,
        ));
        Ok(link)
    }

    fn close(&self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        self.shared.fail_all("endpoint closed");
        debug!("Relay endpoint for {} closed", self.shared.local);
    }
}

impl Drop for RelayDialer {
    fn drop(&mut self) {
        self.close();
    }
}
