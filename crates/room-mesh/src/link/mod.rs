//! Boundary to the underlying peer-connection primitive.
//!
//! The coordinator never touches a concrete connection type. It drives a
//! [`PeerLink`] produced by a [`LinkFactory`] and reacts to [`LinkEvent`]s the
//! link pushes into the [`LinkEvents`] sink it was created with.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::peer::PeerId;
use crate::signal::{IceCandidate, SessionDescription};

pub mod memory;
pub mod rtc;

pub use memory::{MemoryLinkFactory, MemoryNetwork, NegotiationRecord};
pub use rtc::{RtcConfig, RtcLinkFactory};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Offer/answer phase of a link, mirroring the RTC signaling state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("operation not valid in phase {0:?}")]
    InvalidPhase(NegotiationPhase),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("link closed")]
    Closed,
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    fn state(&self) -> LinkState;

    fn phase(&self) -> NegotiationPhase;

    async fn has_remote_description(&self) -> bool;

    /// Open the application channel. Only the initiating side calls this; the
    /// other side learns of the channel through [`LinkEvent::DataChannel`].
    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataLink>, LinkError>;

    /// Create an offer and apply it as the local description.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, LinkError>;

    /// Create an answer to the applied remote offer and apply it locally.
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    async fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), LinkError>;

    /// Abandon an outstanding local offer and return to the stable phase.
    async fn rollback(&self) -> Result<(), LinkError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    async fn close(&self);
}

#[async_trait]
pub trait DataLink: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send(&self, data: Bytes) -> Result<(), LinkError>;

    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn connect(
        &self,
        remote: &PeerId,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, LinkError>;
}

pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    DataChannel(Arc<dyn DataLink>),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            LinkEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            LinkEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            LinkEvent::ChannelOpen => f.write_str("ChannelOpen"),
            LinkEvent::ChannelMessage(data) => {
                f.debug_tuple("ChannelMessage").field(&data.len()).finish()
            }
            LinkEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// A link event stamped with the session it belongs to.
#[derive(Debug)]
pub struct TaggedLinkEvent {
    pub peer: PeerId,
    pub generation: u64,
    pub event: LinkEvent,
}

/// Sink a link reports into. Cloned freely into connection callbacks.
#[derive(Clone, Debug)]
pub struct LinkEvents {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedLinkEvent>,
}

impl LinkEvents {
    pub fn new(peer: PeerId, generation: u64, tx: mpsc::UnboundedSender<TaggedLinkEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: LinkEvent) {
        let tagged = TaggedLinkEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        };
        if self.tx.send(tagged).is_err() {
            tracing::trace!(
                target: "mesh::link",
                peer = %self.peer,
                generation = self.generation,
                "link event dropped, mesh driver gone"
            );
        }
    }
}
