//! Which peers exist and what state the connection to each one is in.

use crate::link::LinkHandle;
use log::{debug, trace};
use room_core::{PeerId, RECONNECT_BACKOFF};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Lifecycle of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Open,
    Closed,
}

/// Which side dialed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// The peer said goodbye or we closed on purpose
    Graceful,
    /// Transport failure
    Error,
}

/// Outcome of an inbound connection
#[derive(Debug)]
pub enum Acceptance {
    /// Registered as a new pending connection
    Accepted(u64),
    /// Registered, superseding an older connection to the same peer
    Replaced {
        conn_id: u64,
        previous: PeerConnection,
    },
    /// The existing connection wins; the inbound one must be closed
    Rejected,
}

/// One connection attempt to one peer. Never reused: a new attempt is a new object.
#[derive(Debug)]
pub struct PeerConnection {
    peer_id: PeerId,
    conn_id: u64,
    link: LinkHandle,
    state: ConnectionState,
    direction: Direction,
    last_activity: Instant,
    /// A connect timeout may still trigger one fresh attempt
    retry_on_timeout: bool,
    /// Timers and the event forwarder tied to this attempt
    tasks: Vec<JoinHandle<()>>,
}

impl PeerConnection {
    fn new(
        peer_id: PeerId,
        conn_id: u64,
        link: LinkHandle,
        direction: Direction,
        retry_on_timeout: bool,
    ) -> Self {
        Self {
            peer_id,
            conn_id,
            link,
            state: ConnectionState::Pending,
            direction,
            last_activity: Instant::now(),
            retry_on_timeout,
            tasks: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn retry_on_timeout(&self) -> bool {
        self.retry_on_timeout
    }

    /// Tie a task's lifetime to this connection
    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(task);
    }

    fn dialed_by_local(&self) -> bool {
        self.direction == Direction::Outbound
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.state = ConnectionState::Closed;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Single source of truth for peers and connection state
pub struct PeerRegistry {
    local: PeerId,
    connections: HashMap<PeerId, PeerConnection>,
    /// Every peer ever learned about, including ourselves
    known: HashSet<PeerId>,
    /// Consecutive transport failures per peer
    failures: HashMap<PeerId, usize>,
    /// Scheduled reconnection attempts
    retry_timers: HashMap<PeerId, JoinHandle<()>>,
    next_conn_id: u64,
}

impl PeerRegistry {
    pub fn new(local: PeerId) -> Self {
        let mut known = HashSet::new();
        known.insert(local.clone());
        Self {
            local,
            connections: HashMap::new(),
            known,
            failures: HashMap::new(),
            retry_timers: HashMap::new(),
            next_conn_id: 1,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn is_known(&self, peer: &PeerId) -> bool {
        self.known.contains(peer)
    }

    /// Add a peer to the known set; returns true if it was new
    pub fn learn(&mut self, peer: &PeerId) -> bool {
        self.known.insert(peer.clone())
    }

    /// The known set, sorted
    pub fn known_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.known.iter().cloned().collect();
        peers.sort();
        peers
    }

    /// False for ourselves and for peers with a pending or open connection
    pub fn should_connect(&self, peer: &PeerId) -> bool {
        peer != &self.local && !self.connections.contains_key(peer)
    }

    pub fn connection(&self, peer: &PeerId) -> Option<&PeerConnection> {
        self.connections.get(peer)
    }

    pub fn connection_mut(&mut self, peer: &PeerId) -> Option<&mut PeerConnection> {
        self.connections.get_mut(peer)
    }

    pub fn state_of(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.connections.get(peer).map(|conn| conn.state)
    }

    /// Whether `conn_id` is the live attempt for `peer`
    pub fn is_current(&self, peer: &PeerId, conn_id: u64) -> bool {
        self.connections
            .get(peer)
            .map(|conn| conn.conn_id == conn_id)
            .unwrap_or(false)
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    /// Record a dial we just started. Returns `None` if the peer already has a
    /// pending or open connection, in which case the link must be dropped.
    pub fn register_outbound(
        &mut self,
        link: LinkHandle,
        retry_on_timeout: bool,
    ) -> Option<u64> {
        let peer = link.remote().clone();
        if !self.should_connect(&peer) {
            return None;
        }

        if let Some(timer) = self.retry_timers.remove(&peer) {
            timer.abort();
        }

        let conn_id = self.allocate_id();
        self.learn(&peer);
        self.connections.insert(
            peer.clone(),
            PeerConnection::new(peer.clone(), conn_id, link, Direction::Outbound, retry_on_timeout),
        );
        debug!("Pending outbound connection {} to {}", conn_id, peer);
        Some(conn_id)
    }

    /// Record a connection opened by a remote peer.
    ///
    /// When both ends dial each other at once, the connection dialed by the
    /// smaller peer id survives on both ends.
    pub fn accept(&mut self, link: LinkHandle) -> Acceptance {
        let peer = link.remote().clone();
        if peer == self.local {
            return Acceptance::Rejected;
        }

        let keep_existing = match self.connections.get(&peer) {
            Some(existing) => existing.dialed_by_local() && self.local < peer,
            None => false,
        };
        if keep_existing {
            debug!("Keeping our own connection to {}, rejecting theirs", peer);
            return Acceptance::Rejected;
        }

        if let Some(timer) = self.retry_timers.remove(&peer) {
            timer.abort();
        }

        let conn_id = self.allocate_id();
        self.learn(&peer);
        let previous = self.connections.insert(
            peer.clone(),
            PeerConnection::new(peer.clone(), conn_id, link, Direction::Inbound, false),
        );
        debug!("Pending inbound connection {} from {}", conn_id, peer);

        match previous {
            Some(previous) => Acceptance::Replaced { conn_id, previous },
            None => Acceptance::Accepted(conn_id),
        }
    }

    /// Pending -> Open. Returns false for stale or unknown attempts.
    pub fn mark_open(&mut self, peer: &PeerId, conn_id: u64) -> bool {
        match self.connections.get_mut(peer) {
            Some(conn) if conn.conn_id == conn_id && conn.state == ConnectionState::Pending => {
                conn.state = ConnectionState::Open;
                conn.last_activity = Instant::now();
                self.failures.remove(peer);
                true
            }
            _ => false,
        }
    }

    /// Remove a connection. A graceful close keeps the peer known; an error
    /// close forgets it so it can be rediscovered and retried fresh.
    pub fn mark_closed(
        &mut self,
        peer: &PeerId,
        conn_id: u64,
        kind: CloseKind,
    ) -> Option<PeerConnection> {
        if !self.is_current(peer, conn_id) {
            trace!("Ignoring close of stale connection {} to {}", conn_id, peer);
            return None;
        }

        let mut conn = self.connections.remove(peer)?;
        conn.state = ConnectionState::Closed;
        if kind == CloseKind::Error {
            self.known.remove(peer);
        }
        debug!("Connection {} to {} closed ({:?})", conn_id, peer, kind);
        Some(conn)
    }

    /// Discard an attempt that is still pending when its timeout fires
    pub fn expire_pending(&mut self, peer: &PeerId, conn_id: u64) -> Option<PeerConnection> {
        let still_pending = matches!(
            self.connections.get(peer),
            Some(conn) if conn.conn_id == conn_id && conn.state == ConnectionState::Pending
        );
        if !still_pending {
            return None;
        }

        let mut conn = self.connections.remove(peer)?;
        conn.state = ConnectionState::Closed;
        Some(conn)
    }

    pub fn touch(&mut self, peer: &PeerId, conn_id: u64) {
        if let Some(conn) = self.connections.get_mut(peer) {
            if conn.conn_id == conn_id {
                conn.last_activity = Instant::now();
            }
        }
    }

    /// Count a transport failure and return how long to wait before the next
    /// attempt, or `None` once the backoff schedule is exhausted.
    pub fn record_failure(&mut self, peer: &PeerId) -> Option<Duration> {
        let count = self.failures.entry(peer.clone()).or_insert(0);
        *count += 1;
        let delay = RECONNECT_BACKOFF.get(*count - 1).copied();
        if delay.is_none() {
            self.failures.remove(peer);
        }
        delay
    }

    /// Remember a scheduled reconnection so it can be cancelled
    pub fn set_retry_timer(&mut self, peer: &PeerId, timer: JoinHandle<()>) {
        if let Some(old) = self.retry_timers.insert(peer.clone(), timer) {
            old.abort();
        }
    }

    /// Forget a reconnection timer that has fired
    pub fn clear_retry_timer(&mut self, peer: &PeerId) {
        self.retry_timers.remove(peer);
    }

    /// Peers with an open connection, sorted
    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .connections
            .values()
            .filter(|conn| conn.state == ConnectionState::Open)
            .map(|conn| conn.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Send handles of every open connection except `except`
    pub fn open_links(&self, except: Option<&PeerId>) -> Vec<LinkHandle> {
        self.connections
            .values()
            .filter(|conn| conn.state == ConnectionState::Open)
            .filter(|conn| Some(&conn.peer_id) != except)
            .map(|conn| conn.link.clone())
            .collect()
    }

    /// Remove every connection, leaving the known set untouched
    pub fn drain(&mut self) -> Vec<PeerConnection> {
        self.connections.drain().map(|(_, conn)| conn).collect()
    }

    /// Forget everything and start over under a new local id.
    /// All timers owned by the registry are cancelled.
    pub fn reset(&mut self, local: PeerId) {
        for (_, timer) in self.retry_timers.drain() {
            timer.abort();
        }
        self.connections.clear();
        self.failures.clear();
        self.known.clear();
        self.known.insert(local.clone());
        self.local = local;
    }
}
