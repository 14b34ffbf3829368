//! Network layer for the room mesh
//!
//! This crate holds everything below the session: the transport seam
//! (`Connector`/`Dialer`/`Link`), an in-process and a TCP relay transport,
//! the JSON envelope codec, the peer registry and gossip discovery.

pub mod discovery;
pub mod link;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod relay;

pub use discovery::{join_address, parse_join_address, Discovery, PlayerAdmission};
pub use link::{Binding, Connector, Dialer, Link, LinkCommand, LinkEvent, LinkHandle};
pub use memory::MemoryNetwork;
pub use registry::{Acceptance, CloseKind, ConnectionState, Direction, PeerConnection, PeerRegistry};
pub use relay::{RelayConnector, RelayFrame, RelayServer};
