use bytes::Bytes;

use crate::peer::PeerId;

/// Lifecycle notifications surfaced to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeshEvent {
    /// The link to the peer reached the connected state.
    PeerConnected(PeerId),
    /// The application channel to the peer is open for sending.
    DataChannelOpen(PeerId),
    DataReceived { peer: PeerId, data: Bytes },
    /// The peer's session was torn down. Fired once per removed session.
    PeerDisconnected(PeerId),
}

impl MeshEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            MeshEvent::PeerConnected(peer)
            | MeshEvent::DataChannelOpen(peer)
            | MeshEvent::PeerDisconnected(peer) => peer,
            MeshEvent::DataReceived { peer, .. } => peer,
        }
    }
}
