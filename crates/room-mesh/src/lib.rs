//! Full-mesh peer connection coordinator for a shared room.
//!
//! Every participant runs a [`RoomMesh`] over the same signaling topic. Offers,
//! answers and candidates travel over an unreliable [`signal_bus::SignalBus`];
//! the mesh decides who offers to whom, drops retransmissions, resolves offer
//! collisions, and restarts or evicts links that stop working.

pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod health;
pub mod link;
pub mod mesh;
pub mod negotiation;
pub mod peer;
pub mod registry;
pub mod session;
pub mod signal;
pub mod timer;

pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};
pub use events::MeshEvent;
pub use link::{
    DataLink, LinkError, LinkEvent, LinkFactory, LinkState, MemoryLinkFactory, MemoryNetwork,
    NegotiationPhase, NegotiationRecord, PeerLink, RtcConfig, RtcLinkFactory,
};
pub use mesh::RoomMesh;
pub use peer::{PeerId, Politeness, is_initiator, politeness};
pub use signal::{
    Envelope, IceCandidate, Participant, SdpKind, SessionDescription, Signal, SignalError,
    SignalKind,
};
