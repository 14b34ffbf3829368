//! The transport seam: one `Link` per peer-to-peer data channel.

use async_trait::async_trait;
use room_core::{Error, PeerId};
use tokio::sync::mpsc;

/// Events reported by one data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The channel is ready to carry messages
    Open,
    /// One complete message arrived
    Message(Vec<u8>),
    /// The remote side closed the channel on purpose
    Closed,
    /// The channel failed
    Error(String),
}

/// Requests from the owner of a link to its transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Send(Vec<u8>),
    Close,
}

/// Sending half of a link. Sends never block: they are queued for the transport.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    remote: PeerId,
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    pub fn new(remote: PeerId, commands: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self { remote, commands }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    /// Queue one message for the remote peer
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), Error> {
        self.commands
            .send(LinkCommand::Send(bytes))
            .map_err(|_| Error::Transport(format!("Link to {} is gone", self.remote)))
    }

    /// Close the channel gracefully; the remote side sees `LinkEvent::Closed`
    pub fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }
}

/// A data channel to one remote peer: the sending handle plus its event stream
#[derive(Debug)]
pub struct Link {
    pub handle: LinkHandle,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Link {
    pub fn remote(&self) -> &PeerId {
        self.handle.remote()
    }
}

/// Outbound side of a bound endpoint
pub trait Dialer: Send + Sync {
    /// Start connecting to `remote`. The returned link is pending until it
    /// reports `LinkEvent::Open`, or fails with `LinkEvent::Error`.
    fn dial(&self, remote: &PeerId) -> Result<Link, Error>;

    /// Stop listening and release the local id
    fn close(&self);
}

/// A local endpoint registered under one peer id
pub struct Binding {
    pub local: PeerId,
    pub dialer: Box<dyn Dialer>,
    /// Links opened by remote peers
    pub incoming: mpsc::UnboundedReceiver<Link>,
}

/// Peer-to-peer connection primitive the session layer is built on
#[async_trait]
pub trait Connector: Send + Sync {
    /// Register `local` with the rendezvous point and start accepting links
    async fn bind(&self, local: PeerId) -> Result<Binding, Error>;
}

/// Build both ends of an in-process link pair
pub(crate) fn channel_pair(
    remote: PeerId,
) -> (
    Link,
    mpsc::UnboundedReceiver<LinkCommand>,
    mpsc::UnboundedSender<LinkEvent>,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let link = Link {
        handle: LinkHandle::new(remote, command_tx),
        events: event_rx,
    };
    (link, command_rx, event_tx)
}
