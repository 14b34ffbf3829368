//! In-process transport. Every bound endpoint lives in one shared hub, which
//! makes it possible to run whole meshes inside a single test.

use crate::link::{channel_pair, Binding, Connector, Dialer, Link, LinkCommand, LinkEvent};
use async_trait::async_trait;
use log::{debug, trace};
use room_core::{Error, PeerId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Default)]
struct Hub {
    /// Bound endpoints and the channel their inbound links go to
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<Link>>,
    /// Dials to these peers never complete
    held: HashSet<PeerId>,
    /// Unordered pairs that cannot reach each other
    blocked: HashSet<(PeerId, PeerId)>,
    /// Peers that may only reach the listed peers
    restricted: HashMap<PeerId, HashSet<PeerId>>,
    /// Every dial ever made, as (from, to)
    dials: Vec<(PeerId, PeerId)>,
}

/// Shared in-memory switchboard
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Dials to `peer` stay pending forever
    pub fn hold(&self, peer: &PeerId) {
        self.lock().held.insert(peer.clone());
    }

    /// `a` and `b` cannot connect to each other in either direction
    pub fn block(&self, a: &PeerId, b: &PeerId) {
        self.lock().blocked.insert(ordered(a, b));
    }

    /// `peer` can only connect to (and be reached from) `allowed`
    pub fn restrict(&self, peer: &PeerId, allowed: &[PeerId]) {
        self.lock()
            .restricted
            .insert(peer.clone(), allowed.iter().cloned().collect());
    }

    /// Number of dials made towards `peer` by anyone
    pub fn dial_count(&self, peer: &PeerId) -> usize {
        self.lock().dials.iter().filter(|(_, to)| to == peer).count()
    }

    /// Whether `peer` currently has a bound endpoint
    pub fn is_bound(&self, peer: &PeerId) -> bool {
        self.lock().endpoints.contains_key(peer)
    }
}

impl Hub {
    fn reachable(&self, from: &PeerId, to: &PeerId) -> bool {
        let allows = |peer: &PeerId, other: &PeerId| {
            self.restricted
                .get(peer)
                .map(|allowed| allowed.contains(other))
                .unwrap_or(true)
        };
        !self.blocked.contains(&ordered(from, to)) && allows(from, to) && allows(to, from)
    }
}

fn ordered(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn bind(&self, local: PeerId) -> Result<Binding, Error> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let mut hub = self.lock();
        if hub.endpoints.contains_key(&local) {
            return Err(Error::Transport(format!("Peer id {} is already bound", local)));
        }
        hub.endpoints.insert(local.clone(), incoming_tx);
        debug!("Memory endpoint bound for {}", local);

        Ok(Binding {
            local: local.clone(),
            dialer: Box::new(MemoryDialer {
                local,
                network: self.clone(),
            }),
            incoming: incoming_rx,
        })
    }
}

struct MemoryDialer {
    local: PeerId,
    network: MemoryNetwork,
}

impl Dialer for MemoryDialer {
    fn dial(&self, remote: &PeerId) -> Result<Link, Error> {
        let mut hub = self.network.lock();
        hub.dials.push((self.local.clone(), remote.clone()));

        let (link, commands, events) = channel_pair(remote.clone());

        if hub.held.contains(remote) {
            trace!("Holding dial {} -> {}", self.local, remote);
            tokio::spawn(drain(commands, events));
            return Ok(link);
        }

        let target = if hub.reachable(&self.local, remote) {
            hub.endpoints.get(remote).cloned()
        } else {
            None
        };

        let Some(target) = target else {
            let _ = events.send(LinkEvent::Error(format!("peer-unavailable: {}", remote)));
            return Ok(link);
        };

        let (remote_link, remote_commands, remote_events) = channel_pair(self.local.clone());
        if target.send(remote_link).is_err() {
            let _ = events.send(LinkEvent::Error(format!("peer-unavailable: {}", remote)));
            return Ok(link);
        }

        let _ = events.send(LinkEvent::Open);
        let _ = remote_events.send(LinkEvent::Open);
        tokio::spawn(pump(commands, remote_events.clone()));
        tokio::spawn(pump(remote_commands, events));

        Ok(link)
    }

    fn close(&self) {
        self.network.lock().endpoints.remove(&self.local);
        debug!("Memory endpoint released for {}", self.local);
    }
}

/// Deliver one side's commands as the other side's events
async fn pump(
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    peer: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Send(bytes) => {
                if peer.send(LinkEvent::Message(bytes)).is_err() {
                    return;
                }
            }
            LinkCommand::Close => {
                let _ = peer.send(LinkEvent::Closed);
                return;
            }
        }
    }
    // Handle dropped without a close
    let _ = peer.send(LinkEvent::Error("connection lost".to_string()));
}

/// Keep a held link alive without ever opening it
async fn drain(
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    _events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(command) = commands.recv().await {
        if command == LinkCommand::Close {
            return;
        }
    }
}
