use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

pub mod envelope;
pub mod events;

pub use envelope::{
    CanvasUpdate, Envelope, PeerList, PlayerInfo, PlayerLeft, PlayerMove, RequestAllCanvasData,
    RequestPeerList,
};
pub use events::{SessionEvent, SessionSnapshot};

/// Fastest rate at which the local pose is broadcast (10 Hz).
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

/// How long a connection may stay pending before it is discarded.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delays between reconnection attempts after a transport error.
pub const RECONNECT_BACKOFF: [Duration; 2] = [Duration::from_secs(3), Duration::from_secs(5)];

/// Delays before re-sending an unanswered full canvas sync request.
pub const FULL_SYNC_RETRY: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(5)];

/// Lifetime of a locally cached canvas.
pub const CANVAS_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Walls of the room that carry canvases, in slot order.
pub const WALLS: [&str; 4] = ["north", "east", "south", "west"];

/// Avatar colors handed out at session creation.
pub const AVATAR_PALETTE: [u32; 8] = [
    0xe6194b, 0x3cb44b, 0xffe119, 0x4363d8, 0xf58231, 0x911eb4, 0x42d4f4, 0xf032e6,
];

/// Unique identifier for one participant of one session join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh id from the wall clock plus a random suffix
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("p{:x}-{}", now_millis(), &suffix[..8]))
    }

    /// Wrap an id received from elsewhere (join address, wire message)
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one fixed canvas slot, e.g. `north-0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CanvasId(String);

impl CanvasId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The full slot layout: every wall gets `per_wall` canvases.
    pub fn layout(per_wall: usize) -> Vec<CanvasId> {
        WALLS
            .iter()
            .flat_map(|wall| (0..per_wall).map(move |i| CanvasId(format!("{}-{}", wall, i))))
            .collect()
    }
}

impl std::fmt::Display for CanvasId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A position in room space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Render-relevant state of one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarState {
    pub peer_id: PeerId,
    pub display_name: String,
    pub position: Vec3,
    pub heading: f32,
    /// RGB color, a plain value owned by the avatar
    pub color: u32,
}

impl AvatarState {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>, color: u32) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            position: Vec3::default(),
            heading: 0.0,
            color,
        }
    }
}

/// Content of one shared canvas slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasState {
    pub canvas_id: CanvasId,
    /// Opaque encoded image; empty means the default blank canvas
    pub image: Vec<u8>,
    pub updated_at_millis: u64,
}

impl CanvasState {
    pub fn blank(canvas_id: CanvasId) -> Self {
        Self {
            canvas_id,
            image: Vec::new(),
            updated_at_millis: 0,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.updated_at_millis == 0 && self.image.is_empty()
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unified error type for the session layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_peer_ids_are_unique() {
        let ids: HashSet<PeerId> = (0..500).map(|_| PeerId::generate()).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn peer_id_display_is_the_raw_id() {
        let id = PeerId::new("peer-a");
        assert_eq!(format!("{}", id), "peer-a");
        assert_eq!(id.as_str(), "peer-a");
    }

    #[test]
    fn canvas_layout_covers_every_wall() {
        let layout = CanvasId::layout(4);
        assert_eq!(layout.len(), 16);
        assert_eq!(layout[0], CanvasId::new("north-0"));
        assert_eq!(layout[15], CanvasId::new("west-3"));
    }

    #[test]
    fn blank_canvas() {
        let canvas = CanvasState::blank(CanvasId::new("east-1"));
        assert!(canvas.is_blank());
        assert_eq!(canvas.updated_at_millis, 0);
    }

    #[test]
    fn error_display() {
        let err = Error::Transport("peer unavailable".to_string());
        assert!(format!("{}", err).contains("Transport error: peer unavailable"));

        let anyhow_err = Error::Other(anyhow::anyhow!("Something went wrong"));
        assert!(format!("{}", anyhow_err).contains("Something went wrong"));
    }
}
