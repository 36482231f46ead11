use signal_bus::BusError;
use thiserror::Error;

use crate::link::LinkError;
use crate::peer::PeerId;
use crate::signal::SignalError;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("link to {peer} failed: {source}")]
    Link {
        peer: PeerId,
        #[source]
        source: LinkError,
    },
    #[error("signaling publish failed: {0}")]
    Bus(#[from] BusError),
    #[error("invalid signaling message: {0}")]
    Signal(#[from] SignalError),
    #[error("no session for peer {0}")]
    UnknownPeer(PeerId),
    #[error("mesh is shut down")]
    Closed,
}

impl MeshError {
    pub(crate) fn link(peer: &PeerId, source: LinkError) -> Self {
        MeshError::Link {
            peer: peer.clone(),
            source,
        }
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
