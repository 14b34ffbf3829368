//! Session layer for the room mesh
//!
//! This crate keeps avatars and canvases consistent across the peer mesh.
//! Presentation code talks to a running session through `SessionHandle` and
//! receives `SessionEvent`s on a channel.

pub mod commands;
pub mod handler;
pub mod sync;

use commands::SessionCommand;
use handler::SessionController;
use log::error;
use network::Connector;
use room_core::{CanvasId, CanvasState, Error, PeerId, SessionEvent, SessionSnapshot, Vec3};
use settings_manager::CanvasCache;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use handler::SessionConfig;
pub use sync::{AvatarApply, CanvasApply, StateSyncEngine};

/// Cloneable front end of a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

/// Run a session on the current runtime.
///
/// Returns the handle, the event stream and the task running the session.
/// The session stops on `shutdown()` or when every handle is dropped.
pub fn spawn_session(
    connector: Arc<dyn Connector>,
    cache: Option<CanvasCache>,
    config: SessionConfig,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
    JoinHandle<()>,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut controller = SessionController::new(connector, cache, config, command_rx, event_tx);

    let task = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!("Session stopped with an error: {}", e);
        }
    });

    (
        SessionHandle {
            commands: command_tx,
        },
        event_rx,
        task,
    )
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), Error> {
        self.commands
            .send(command)
            .map_err(|_| Error::Session("Session has stopped".to_string()))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await
            .map_err(|_| Error::Session("Session stopped before replying".to_string()))
    }

    /// Create the local identity, bind the endpoint and dial bootstrap peers
    pub async fn start(&self, display_name: impl Into<String>) -> Result<PeerId, Error> {
        let display_name = display_name.into();
        self.request(|reply| SessionCommand::Start {
            display_name,
            reply,
        })
        .await?
    }

    /// Call once per frame; pose broadcasts are capped at 10 Hz
    pub fn tick(&self) -> Result<(), Error> {
        self.send(SessionCommand::Tick)
    }

    pub fn update_pose(&self, position: Vec3, heading: f32) -> Result<(), Error> {
        self.send(SessionCommand::UpdatePose { position, heading })
    }

    /// Begin editing a canvas; returns its current content
    pub async fn request_draw(&self, canvas_id: CanvasId) -> Result<CanvasState, Error> {
        self.request(|reply| SessionCommand::RequestDraw { canvas_id, reply })
            .await?
    }

    /// Finish editing a canvas and share the result
    pub async fn commit_draw(&self, canvas_id: CanvasId, image: Vec<u8>) -> Result<(), Error> {
        self.request(|reply| SessionCommand::CommitDraw {
            canvas_id,
            image,
            reply,
        })
        .await?
    }

    /// Drop every connection and rejoin under a new peer id
    pub async fn force_reconnect(&self) -> Result<PeerId, Error> {
        self.request(|reply| SessionCommand::ForceReconnect { reply })
            .await?
    }

    /// Address others can use to join through us, once started
    pub async fn join_address(&self) -> Result<Option<String>, Error> {
        self.request(|reply| SessionCommand::JoinAddress { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, Error> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Say goodbye to every peer and stop the session
    pub fn shutdown(&self) -> Result<(), Error> {
        self.send(SessionCommand::Shutdown)
    }
}
