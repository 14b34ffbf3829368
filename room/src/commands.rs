use network::Link;
use network::LinkEvent;
use room_core::{CanvasId, CanvasState, Error, PeerId, SessionSnapshot, Vec3};
use tokio::sync::oneshot;

/// Requests from the presentation layer to the session
#[derive(Debug)]
pub enum SessionCommand {
    Start {
        display_name: String,
        reply: oneshot::Sender<Result<PeerId, Error>>,
    },
    Tick,
    UpdatePose {
        position: Vec3,
        heading: f32,
    },
    RequestDraw {
        canvas_id: CanvasId,
        reply: oneshot::Sender<Result<CanvasState, Error>>,
    },
    CommitDraw {
        canvas_id: CanvasId,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    ForceReconnect {
        reply: oneshot::Sender<Result<PeerId, Error>>,
    },
    JoinAddress {
        reply: oneshot::Sender<Option<String>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

/// Inputs the session posts to itself from links and timers
#[derive(Debug)]
pub(crate) enum Input {
    /// A remote peer opened a link to us; `epoch` is the binding it arrived on
    Incoming { epoch: u64, link: Link },
    Link {
        peer: PeerId,
        conn_id: u64,
        event: LinkEvent,
    },
    ConnectTimeout { peer: PeerId, conn_id: u64 },
    RetryConnect { peer: PeerId, epoch: u64 },
    FullSyncCheck { peer: PeerId, conn_id: u64 },
}
