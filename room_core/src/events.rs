use crate::{AvatarState, CanvasId, CanvasState, PeerId};

/// Events emitted by the session layer to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The local identity is assigned and the listener is up
    SelfReady(PeerId),
    /// A remote avatar appeared
    PeerJoined(AvatarState),
    /// A remote avatar changed pose or description
    PeerMoved(AvatarState),
    /// A remote peer left or its connection went away
    PeerLeft(PeerId),
    /// A canvas received newer content
    CanvasChanged {
        /// Canvas that changed
        canvas_id: CanvasId,
        /// The new image
        image: Vec<u8>,
    },
    /// Human-readable connection status
    Status(String),
}

/// Point-in-time copy of everything the presentation layer renders
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Our own avatar, if the session is started
    pub local: Option<AvatarState>,
    /// Remote avatars, sorted by peer id
    pub peers: Vec<AvatarState>,
    /// Every canvas slot, sorted by canvas id
    pub canvases: Vec<CanvasState>,
    /// Peers with an open connection, sorted
    pub open_peers: Vec<PeerId>,
    /// Last status line
    pub status: String,
}

impl SessionSnapshot {
    pub fn peer(&self, peer_id: &PeerId) -> Option<&AvatarState> {
        self.peers.iter().find(|avatar| &avatar.peer_id == peer_id)
    }

    pub fn canvas(&self, canvas_id: &CanvasId) -> Option<&CanvasState> {
        self.canvases.iter().find(|canvas| &canvas.canvas_id == canvas_id)
    }
}
