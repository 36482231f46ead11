//! Per-peer connection state.

use std::sync::Arc;

use crate::health::Grace;
use crate::link::{DataLink, LinkState, NegotiationPhase, PeerLink};
use crate::peer::{PeerId, Politeness};
use crate::signal::IceCandidate;
use crate::timer::{TimerHandle, TimerKind};

/// Perfect-negotiation flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NegotiationState {
    pub making_offer: bool,
    pub ignore_offer: bool,
}

#[derive(Debug, Default)]
struct SessionTimers {
    health: Option<TimerHandle>,
    failure: Option<TimerHandle>,
    restart: Option<TimerHandle>,
    negotiation: Option<TimerHandle>,
}

impl SessionTimers {
    fn get(&self, kind: TimerKind) -> Option<&TimerHandle> {
        match kind {
            TimerKind::Health => self.health.as_ref(),
            TimerKind::Failure => self.failure.as_ref(),
            TimerKind::Restart => self.restart.as_ref(),
            TimerKind::Negotiation => self.negotiation.as_ref(),
        }
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<TimerHandle> {
        match kind {
            TimerKind::Health => &mut self.health,
            TimerKind::Failure => &mut self.failure,
            TimerKind::Restart => &mut self.restart,
            TimerKind::Negotiation => &mut self.negotiation,
        }
    }
}

/// One negotiated (or negotiating) link to a remote peer.
///
/// A session is never repaired in place once its link is unusable: the registry
/// installs a fresh session under a new generation instead.
pub struct PeerSession {
    peer: PeerId,
    generation: u64,
    politeness: Politeness,
    link: Arc<dyn PeerLink>,
    channel: Option<Arc<dyn DataLink>>,
    pub negotiation: NegotiationState,
    pub reconnect_attempts: u32,
    /// Set while the failure grace timer runs.
    pub grace: Option<Grace>,
    pending_candidates: Vec<IceCandidate>,
    remote_ufrag: Option<String>,
    timers: SessionTimers,
    announced_connected: bool,
    announced_channel: bool,
}

impl PeerSession {
    pub fn new(
        peer: PeerId,
        generation: u64,
        politeness: Politeness,
        link: Arc<dyn PeerLink>,
    ) -> Self {
        Self {
            peer,
            generation,
            politeness,
            link,
            channel: None,
            negotiation: NegotiationState::default(),
            reconnect_attempts: 0,
            grace: None,
            pending_candidates: Vec::new(),
            remote_ufrag: None,
            timers: SessionTimers::default(),
            announced_connected: false,
            announced_channel: false,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn politeness(&self) -> Politeness {
        self.politeness
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    pub fn channel(&self) -> Option<&Arc<dyn DataLink>> {
        self.channel.as_ref()
    }

    pub fn set_channel(&mut self, channel: Arc<dyn DataLink>) {
        self.channel = Some(channel);
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    /// The link can no longer carry this session and must be replaced.
    pub fn is_stale(&self) -> bool {
        matches!(self.link.state(), LinkState::Closed | LinkState::Failed)
    }

    /// Connected with no negotiation in flight.
    pub fn is_healthy(&self) -> bool {
        self.link.state() == LinkState::Connected && self.link.phase() == NegotiationPhase::Stable
    }

    pub fn queue_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub fn take_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Username fragment of the last applied remote description.
    pub fn remote_ufrag(&self) -> Option<&str> {
        self.remote_ufrag.as_deref()
    }

    pub fn set_remote_ufrag(&mut self, ufrag: Option<String>) {
        self.remote_ufrag = ufrag;
    }

    pub fn arm(&mut self, kind: TimerKind, handle: TimerHandle) {
        *self.timers.slot(kind) = Some(handle);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.timers.slot(kind).take();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.timers.get(kind).is_some()
    }

    /// Whether a firing with `seq` belongs to the currently armed timer of `kind`.
    pub fn is_current(&self, kind: TimerKind, seq: u64) -> bool {
        self.timers
            .get(kind)
            .is_some_and(|handle| handle.seq() == seq)
    }

    pub fn cancel_all(&mut self) {
        self.timers = SessionTimers::default();
        self.grace = None;
    }

    /// Record that the connected event went out; false if it already had.
    pub fn announce_connected(&mut self) -> bool {
        !std::mem::replace(&mut self.announced_connected, true)
    }

    pub fn announce_channel(&mut self) -> bool {
        !std::mem::replace(&mut self.announced_channel, true)
    }

    /// Let the next channel opening be announced again.
    pub fn reset_channel_announcement(&mut self) {
        self.announced_channel = false;
    }

    pub fn was_announced(&self) -> bool {
        self.announced_connected
    }

    /// Cancel timers, then close the channel and the link.
    pub async fn close(mut self) {
        self.cancel_all();
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.link.close().await;
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.peer)
            .field("generation", &self.generation)
            .field("politeness", &self.politeness)
            .field("state", &self.link.state())
            .field("phase", &self.link.phase())
            .field("channel_open", &self.is_channel_open())
            .field("negotiation", &self.negotiation)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish()
    }
}
