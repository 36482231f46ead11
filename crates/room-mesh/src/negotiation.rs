//! Perfect negotiation.
//!
//! Both sides of a pair compute the same roles from their ids. The polite side
//! (smaller id) initiates. When offers cross, the impolite side ignores the
//! incoming offer and the polite side rolls its own back and answers.

use crate::dedup::{Admission, DedupKind};
use crate::error::{MeshError, MeshResult};
use crate::link::{LinkState, NegotiationPhase};
use crate::mesh::MeshDriver;
use crate::peer::{PeerId, Politeness};
use crate::session::NegotiationState;
use crate::signal::{Envelope, IceCandidate, SessionDescription, Signal};
use crate::timer::TimerKind;

/// Early candidates kept for a peer that has no session yet.
const EARLY_CANDIDATE_LIMIT: usize = 64;

/// An incoming offer collides with local negotiation already in flight.
pub fn is_collision(state: &NegotiationState, phase: NegotiationPhase) -> bool {
    state.making_offer || phase != NegotiationPhase::Stable
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfferResponse {
    /// Apply the offer and answer it, rolling back a local offer first if needed.
    Answer { rollback: bool },
    /// Drop the offer; our own offer wins.
    Ignore,
}

pub fn respond_to_offer(politeness: Politeness, collision: bool) -> OfferResponse {
    match (collision, politeness) {
        (false, _) => OfferResponse::Answer { rollback: false },
        (true, Politeness::Impolite) => OfferResponse::Ignore,
        (true, Politeness::Polite) => OfferResponse::Answer { rollback: true },
    }
}

impl MeshDriver {
    /// Start negotiating with `peer` unless a usable session already exists.
    ///
    /// A healthy session is kept, as is a fresh one still inside its
    /// negotiation window. Anything else is torn down and replaced.
    pub(crate) async fn create_offer(&mut self, peer: &PeerId) -> MeshResult<()> {
        if peer == &self.local {
            return Ok(());
        }
        if let Some(session) = self.registry.get(peer) {
            let negotiating = !session.is_stale() && session.is_armed(TimerKind::Negotiation);
            if session.is_healthy() || negotiating {
                tracing::debug!(
                    target: "mesh",
                    peer = %peer,
                    generation = session.generation(),
                    negotiating,
                    "session already present, offer skipped"
                );
                return Ok(());
            }
        }

        let generation = self.open_session(peer, true).await?;
        if let Err(err) = self.send_offer(peer, false).await {
            self.discard(peer, generation).await;
            return Err(err);
        }
        Ok(())
    }

    /// Create an offer on the peer's link and publish it.
    pub(crate) async fn send_offer(&mut self, peer: &PeerId, ice_restart: bool) -> MeshResult<()> {
        let Some(session) = self.registry.get_mut(peer) else {
            return Err(MeshError::UnknownPeer(peer.clone()));
        };
        session.negotiation.making_offer = true;
        let link = session.link().clone();
        let generation = session.generation();

        let result = match link.create_offer(ice_restart).await {
            Ok(description) => {
                let envelope = Envelope::unicast(
                    self.room.clone(),
                    self.local.clone(),
                    peer.clone(),
                    Signal::Offer {
                        description,
                        ice_restart,
                    },
                );
                self.publish(&envelope)
            }
            Err(err) => Err(MeshError::link(peer, err)),
        };

        if let Some(session) = self.registry.live_mut(peer, generation) {
            session.negotiation.making_offer = false;
        }
        if result.is_ok() {
            tracing::debug!(
                target: "mesh",
                peer = %peer,
                generation,
                ice_restart,
                "offer sent"
            );
        }
        result
    }

    pub(crate) async fn handle_offer(
        &mut self,
        peer: &PeerId,
        description: SessionDescription,
        ice_restart: bool,
    ) -> MeshResult<()> {
        if peer == &self.local {
            return Ok(());
        }
        self.members.insert(peer.clone());
        let token = match self.dedup.admit(DedupKind::Offer, peer, &description.sdp) {
            Admission::Proceed { token } => token,
            Admission::Busy => {
                tracing::debug!(
                    target: "mesh",
                    peer = %peer,
                    "offer dropped, processing lock held"
                );
                return Ok(());
            }
            Admission::Duplicate => {
                tracing::debug!(target: "mesh", peer = %peer, "duplicate offer dropped");
                return Ok(());
            }
        };
        let result = self.process_offer(peer, description, ice_restart).await;
        self.hold_lock(DedupKind::Offer, peer, token);
        result
    }

    async fn process_offer(
        &mut self,
        peer: &PeerId,
        description: SessionDescription,
        ice_restart: bool,
    ) -> MeshResult<()> {
        let reuse = match self.registry.get(peer) {
            None => false,
            Some(session) if ice_restart => session.link().state() != LinkState::Closed,
            Some(session) => !session.is_stale(),
        };
        let fresh = !reuse;
        if fresh {
            self.open_session(peer, false).await?;
        }
        let Some(session) = self.registry.get_mut(peer) else {
            return Err(MeshError::UnknownPeer(peer.clone()));
        };
        let generation = session.generation();
        let link = session.link().clone();
        let phase = link.phase();
        let collision = is_collision(&session.negotiation, phase);

        let rollback = match respond_to_offer(session.politeness(), collision) {
            OfferResponse::Ignore => {
                session.negotiation.ignore_offer = true;
                tracing::debug!(
                    target: "mesh",
                    peer = %peer,
                    generation,
                    phase = ?phase,
                    "offer collision, keeping local offer"
                );
                return Ok(());
            }
            OfferResponse::Answer { rollback } => {
                session.negotiation.ignore_offer = false;
                rollback && phase != NegotiationPhase::Stable
            }
        };

        if rollback {
            tracing::debug!(
                target: "mesh",
                peer = %peer,
                generation,
                "offer collision, rolling back local offer"
            );
            if let Err(err) = link.rollback().await {
                let err = MeshError::link(peer, err);
                return self.fail_negotiation(peer, generation, fresh, err).await;
            }
        }
        let ufrag = description.ice_ufrag().map(str::to_owned);
        if let Err(err) = link.set_remote_description(description).await {
            let err = MeshError::link(peer, err);
            return self.fail_negotiation(peer, generation, fresh, err).await;
        }
        self.flush_candidates(peer, generation, ufrag).await;

        let answer = match link.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                let err = MeshError::link(peer, err);
                return self.fail_negotiation(peer, generation, fresh, err).await;
            }
        };
        let envelope = Envelope::unicast(
            self.room.clone(),
            self.local.clone(),
            peer.clone(),
            Signal::Answer {
                description: answer,
            },
        );
        if let Err(err) = self.publish(&envelope) {
            tracing::warn!(target: "mesh", peer = %peer, error = %err, "failed to publish answer");
        } else {
            tracing::debug!(target: "mesh", peer = %peer, generation, ice_restart, "answer sent");
        }
        Ok(())
    }

    pub(crate) async fn handle_answer(
        &mut self,
        peer: &PeerId,
        description: SessionDescription,
    ) -> MeshResult<()> {
        let token = match self.dedup.admit(DedupKind::Answer, peer, &description.sdp) {
            Admission::Proceed { token } => token,
            Admission::Busy => {
                tracing::debug!(
                    target: "mesh",
                    peer = %peer,
                    "answer dropped, processing lock held"
                );
                return Ok(());
            }
            Admission::Duplicate => {
                tracing::debug!(target: "mesh", peer = %peer, "duplicate answer dropped");
                return Ok(());
            }
        };
        let result = self.process_answer(peer, description).await;
        self.hold_lock(DedupKind::Answer, peer, token);
        result
    }

    async fn process_answer(
        &mut self,
        peer: &PeerId,
        description: SessionDescription,
    ) -> MeshResult<()> {
        let Some(session) = self.registry.get(peer) else {
            tracing::warn!(target: "mesh", peer = %peer, "answer for unknown peer discarded");
            return Ok(());
        };
        let generation = session.generation();
        let link = session.link().clone();
        let phase = link.phase();
        if phase != NegotiationPhase::HaveLocalOffer {
            tracing::warn!(
                target: "mesh",
                peer = %peer,
                generation,
                phase = ?phase,
                "answer discarded, no outstanding offer"
            );
            return Ok(());
        }
        let ufrag = description.ice_ufrag().map(str::to_owned);
        link.set_remote_description(description)
            .await
            .map_err(|err| MeshError::link(peer, err))?;
        tracing::debug!(target: "mesh", peer = %peer, generation, "answer applied");
        self.flush_candidates(peer, generation, ufrag).await;
        Ok(())
    }

    pub(crate) async fn handle_ice_candidate(
        &mut self,
        peer: &PeerId,
        candidate: IceCandidate,
    ) -> MeshResult<()> {
        let Some(session) = self.registry.get_mut(peer) else {
            let early = self.early_candidates.entry(peer.clone()).or_default();
            if early.len() >= EARLY_CANDIDATE_LIMIT {
                early.remove(0);
            }
            early.push(candidate);
            tracing::trace!(target: "mesh", peer = %peer, "candidate buffered before session");
            return Ok(());
        };
        let link = session.link().clone();
        let generation = session.generation();
        if !link.has_remote_description().await {
            if let Some(session) = self.registry.live_mut(peer, generation) {
                session.queue_candidate(candidate);
            }
            tracing::trace!(
                target: "mesh",
                peer = %peer,
                "candidate queued until remote description"
            );
            return Ok(());
        }
        let current = self
            .registry
            .live_mut(peer, generation)
            .is_some_and(|session| candidate.matches_ufrag(session.remote_ufrag()));
        if !current {
            tracing::debug!(
                target: "mesh",
                peer = %peer,
                generation,
                "candidate for older session dropped"
            );
            return Ok(());
        }
        self.apply_candidate(peer, generation, candidate).await;
        Ok(())
    }

    /// Apply everything buffered for the peer once a remote description with
    /// `ufrag` is set. Candidates gathered for another description are dropped.
    async fn flush_candidates(&mut self, peer: &PeerId, generation: u64, ufrag: Option<String>) {
        let mut pending = self.early_candidates.remove(peer).unwrap_or_default();
        let Some(session) = self.registry.live_mut(peer, generation) else {
            return;
        };
        pending.extend(session.take_candidates());
        session.set_remote_ufrag(ufrag);
        let (current, stale): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|candidate| candidate.matches_ufrag(session.remote_ufrag()));
        if !stale.is_empty() {
            tracing::debug!(
                target: "mesh",
                peer = %peer,
                generation,
                dropped = stale.len(),
                "candidates for older session dropped"
            );
        }
        for candidate in current {
            self.apply_candidate(peer, generation, candidate).await;
        }
    }

    async fn apply_candidate(&mut self, peer: &PeerId, generation: u64, candidate: IceCandidate) {
        let Some(session) = self.registry.live_mut(peer, generation) else {
            return;
        };
        let ignoring = session.negotiation.ignore_offer;
        let link = session.link().clone();
        if let Err(err) = link.add_ice_candidate(candidate).await {
            if ignoring {
                tracing::trace!(
                    target: "mesh",
                    peer = %peer,
                    error = %err,
                    "candidate for ignored offer rejected"
                );
            } else {
                tracing::warn!(
                    target: "mesh",
                    peer = %peer,
                    error = %err,
                    "failed to add remote candidate"
                );
            }
        }
    }

    /// Abort a negotiation step. A session created for this offer is discarded
    /// silently; an established one is kept for the health monitor to judge.
    async fn fail_negotiation(
        &mut self,
        peer: &PeerId,
        generation: u64,
        fresh: bool,
        err: MeshError,
    ) -> MeshResult<()> {
        tracing::warn!(
            target: "mesh",
            peer = %peer,
            generation,
            error = %err,
            "negotiation failed"
        );
        if fresh {
            self.discard(peer, generation).await;
        }
        Err(err)
    }
}
