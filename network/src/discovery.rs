//! Mesh growth without a directory: bootstrap from a join address, then
//! exchange peer lists over every connection that opens.

use crate::registry::PeerRegistry;
use log::{debug, warn};
use room_core::{Envelope, Error, PeerId, PeerList, PlayerInfo, RequestPeerList};
use std::collections::HashSet;

/// Query parameter of the join address that carries bootstrap peer ids
pub const JOIN_PARAM: &str = "peer";

/// Build a shareable join address pointing at `peers`
pub fn join_address(base: &str, peers: &[PeerId]) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    let ids: Vec<&str> = peers.iter().map(PeerId::as_str).collect();
    format!("{}{}{}={}", base, separator, JOIN_PARAM, ids.join(","))
}

/// Extract the bootstrap peer ids from a join address.
///
/// An address without the `peer` parameter is valid and means "start a new
/// mesh". Duplicate ids are dropped, order is kept.
pub fn parse_join_address(address: &str) -> Result<Vec<PeerId>, Error> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::Config("Join address is empty".to_string()));
    }

    let Some((_, query)) = address.split_once('?') else {
        return Ok(Vec::new());
    };
    let query = query.split('#').next().unwrap_or_default();

    let mut seen = HashSet::new();
    let mut peers = Vec::new();
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if key != JOIN_PARAM {
            continue;
        }

        let value = value.replace("%2C", ",").replace("%2c", ",");
        for id in value.split(',').map(str::trim).filter(|id| !id.is_empty()) {
            if id.chars().any(char::is_whitespace) {
                return Err(Error::Config(format!("Invalid peer id in join address: {:?}", id)));
            }
            if seen.insert(id.to_string()) {
                peers.push(PeerId::new(id));
            }
        }
    }

    Ok(peers)
}

/// What to do with a received `PlayerInfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerAdmission {
    /// Describes ourselves; must never become a remote avatar
    Echo,
    /// Claims an identity other than the connection it arrived on
    Misattributed,
    /// Valid; `newly_known` is true if the id was not in the known set
    Admitted { newly_known: bool },
}

/// Gossip-based peer discovery
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    bootstrap: Vec<PeerId>,
}

impl Discovery {
    pub fn new(bootstrap: Vec<PeerId>) -> Self {
        Self { bootstrap }
    }

    /// Build discovery from a join address
    pub fn from_join_address(address: &str) -> Result<Self, Error> {
        Ok(Self::new(parse_join_address(address)?))
    }

    /// Peers to dial right after the local endpoint is up
    pub fn bootstrap(&self) -> &[PeerId] {
        &self.bootstrap
    }

    /// Messages sent by each side when a connection reaches Open
    pub fn greeting(&self, own: PlayerInfo) -> Vec<Envelope> {
        vec![
            Envelope::PlayerInfo(own),
            Envelope::RequestPeerList(RequestPeerList {}),
        ]
    }

    /// Answer to `RequestPeerList`
    pub fn peer_list(&self, registry: &PeerRegistry) -> Envelope {
        Envelope::PeerList(PeerList {
            peers: registry.known_peers(),
        })
    }

    /// Peers from a received list that we should dial: not ourselves, not
    /// already known, and without a pending or open connection.
    pub fn candidates(&self, list: &PeerList, registry: &PeerRegistry) -> Vec<PeerId> {
        let mut seen = HashSet::new();
        list.peers
            .iter()
            .filter(|peer| *peer != registry.local())
            .filter(|peer| !registry.is_known(peer))
            .filter(|peer| registry.should_connect(peer))
            .filter(|peer| seen.insert((*peer).clone()))
            .cloned()
            .collect()
    }

    /// Decide whether a `PlayerInfo` received from `from` may create or
    /// update an avatar, registering its id as known when it may.
    pub fn admit_player(
        &self,
        info: &PlayerInfo,
        from: &PeerId,
        registry: &mut PeerRegistry,
    ) -> PlayerAdmission {
        if &info.id == registry.local() {
            debug!("Dropping PlayerInfo echo of ourselves from {}", from);
            return PlayerAdmission::Echo;
        }
        if &info.id != from {
            warn!(
                "Dropping PlayerInfo for {} received over the connection to {}",
                info.id, from
            );
            return PlayerAdmission::Misattributed;
        }

        PlayerAdmission::Admitted {
            newly_known: registry.learn(&info.id),
        }
    }
}
