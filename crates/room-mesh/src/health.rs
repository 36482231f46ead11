//! Link health monitoring, ICE-restart recovery and eviction.
//!
//! Decisions are taken from the link's own state reports plus the data
//! channel: a channel that still carries data overrides a link that claims to
//! be disconnected or failed.

use std::time::Duration;

use crate::config::MeshConfig;
use crate::events::MeshEvent;
use crate::link::{LinkState, NegotiationPhase};
use crate::mesh::MeshDriver;
use crate::peer::{PeerId, is_initiator};
use crate::session::PeerSession;
use crate::timer::TimerKind;

/// Why the failure grace timer of a session is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Grace {
    Disconnected,
    Failed,
}

/// What to do when a link reports a new state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatePlan {
    pub recover_now: bool,
    pub failure_grace: Option<(Grace, Duration)>,
    pub restart_after: Option<Duration>,
}

pub fn plan_for_state(state: LinkState, running: Option<Grace>, config: &MeshConfig) -> StatePlan {
    match state {
        LinkState::Disconnected if running.is_none() => StatePlan {
            recover_now: false,
            failure_grace: Some((Grace::Disconnected, config.disconnected_grace)),
            restart_after: Some(config.restart_after_disconnect),
        },
        LinkState::Failed if running != Some(Grace::Failed) => StatePlan {
            recover_now: true,
            failure_grace: Some((Grace::Failed, config.failed_grace)),
            restart_after: None,
        },
        _ => StatePlan::default(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The path works after all; stop judging.
    FalseAlarm,
    /// Try another ICE restart and judge again after the failed grace.
    Retry,
    /// Give up on the peer.
    Evict,
}

pub fn judge(channel_open: bool, state: LinkState, attempts: u32, max_attempts: u32) -> Verdict {
    if channel_open || state == LinkState::Connected {
        Verdict::FalseAlarm
    } else if attempts < max_attempts {
        Verdict::Retry
    } else {
        Verdict::Evict
    }
}

/// Mismatch between what the link reports and what the channel does.
pub fn degradation(state: LinkState, channel_open: bool) -> Option<&'static str> {
    match (state, channel_open) {
        (LinkState::Connected, false) => Some("link connected but data channel not open"),
        (LinkState::Connected, true) => None,
        (_, true) => Some("data channel open but link not connected"),
        (_, false) => Some("link and data channel both down"),
    }
}

impl MeshDriver {
    pub(crate) async fn on_link_state(&mut self, peer: &PeerId, generation: u64, state: LinkState) {
        let Some(session) = self.registry.live_mut(peer, generation) else {
            return;
        };
        tracing::debug!(
            target: "mesh",
            peer = %peer,
            generation,
            state = ?state,
            "link state changed"
        );
        match state {
            LinkState::Connected => {
                session.cancel(TimerKind::Negotiation);
                session.reconnect_attempts = 0;
                session.grace = None;
                session.cancel(TimerKind::Failure);
                session.cancel(TimerKind::Restart);
                if !session.is_armed(TimerKind::Health) {
                    let handle = self.timers.session_every(
                        peer,
                        generation,
                        TimerKind::Health,
                        self.config.health_interval,
                    );
                    session.arm(TimerKind::Health, handle);
                }
                if session.announce_connected() {
                    tracing::info!(target: "mesh", peer = %peer, generation, "peer connected");
                    self.emit(MeshEvent::PeerConnected(peer.clone()));
                }
            }
            LinkState::Disconnected | LinkState::Failed => {
                session.cancel(TimerKind::Negotiation);
                let plan = plan_for_state(state, session.grace, &self.config);
                if let Some((grace, delay)) = plan.failure_grace {
                    let handle = self
                        .timers
                        .session(peer, generation, TimerKind::Failure, delay);
                    session.arm(TimerKind::Failure, handle);
                    session.grace = Some(grace);
                }
                if let Some(delay) = plan.restart_after {
                    let handle = self
                        .timers
                        .session(peer, generation, TimerKind::Restart, delay);
                    session.arm(TimerKind::Restart, handle);
                }
                if plan.recover_now {
                    session.cancel(TimerKind::Restart);
                    self.attempt_recovery(peer, generation).await;
                }
            }
            LinkState::Closed => {
                tracing::info!(
                    target: "mesh",
                    peer = %peer,
                    generation,
                    "link closed underneath session"
                );
                self.remove_peer(peer).await;
            }
            LinkState::New | LinkState::Connecting => {}
        }
    }

    pub(crate) async fn on_session_timer(
        &mut self,
        peer: &PeerId,
        generation: u64,
        kind: TimerKind,
    ) {
        match kind {
            TimerKind::Health => self.probe(peer, generation),
            TimerKind::Restart => {
                let Some(session) = self.registry.live_mut(peer, generation) else {
                    return;
                };
                session.cancel(TimerKind::Restart);
                if matches!(
                    session.link().state(),
                    LinkState::Disconnected | LinkState::Failed
                ) {
                    self.attempt_recovery(peer, generation).await;
                }
            }
            TimerKind::Failure => self.on_grace_expired(peer, generation).await,
            TimerKind::Negotiation => self.on_negotiation_stalled(peer, generation).await,
        }
    }

    /// A fresh session whose link never left `New`: its offer or the answer
    /// was lost. The initiator offers again within the reconnect budget; any
    /// other stalled session is dropped so a later offer starts clean.
    async fn on_negotiation_stalled(&mut self, peer: &PeerId, generation: u64) {
        let max_attempts = self.config.max_reconnect_attempts;
        let initiator = is_initiator(&self.local, peer);
        let Some(session) = self.registry.live_mut(peer, generation) else {
            return;
        };
        session.cancel(TimerKind::Negotiation);
        if session.link().state() != LinkState::New {
            return;
        }
        if !initiator || !has_budget(session, max_attempts) {
            tracing::info!(
                target: "mesh",
                peer = %peer,
                generation,
                attempts = session.reconnect_attempts,
                "negotiation stalled, dropping session"
            );
            self.discard(peer, generation).await;
            return;
        }

        session.reconnect_attempts += 1;
        let attempt = session.reconnect_attempts;
        let link = session.link().clone();
        let handle = self.timers.session(
            peer,
            generation,
            TimerKind::Negotiation,
            self.config.negotiation_timeout,
        );
        session.arm(TimerKind::Negotiation, handle);
        if link.phase() != NegotiationPhase::Stable {
            if let Err(err) = link.rollback().await {
                tracing::warn!(
                    target: "mesh",
                    peer = %peer,
                    error = %err,
                    "rollback before re-offer failed"
                );
            }
        }
        tracing::info!(
            target: "mesh",
            peer = %peer,
            generation,
            attempt,
            max_attempts,
            "negotiation stalled, offering again"
        );
        if let Err(err) = self.send_offer(peer, false).await {
            tracing::warn!(
                target: "mesh",
                peer = %peer,
                attempt,
                error = %err,
                "repeated offer failed"
            );
        }
    }

    fn probe(&mut self, peer: &PeerId, generation: u64) {
        let Some(session) = self.registry.live_mut(peer, generation) else {
            return;
        };
        let state = session.link().state();
        match degradation(state, session.is_channel_open()) {
            Some(reason) => tracing::warn!(
                target: "mesh",
                peer = %peer,
                generation,
                state = ?state,
                reason,
                "peer link degraded"
            ),
            None => tracing::trace!(target: "mesh", peer = %peer, generation, "peer link healthy"),
        }
    }

    async fn on_grace_expired(&mut self, peer: &PeerId, generation: u64) {
        let Some(session) = self.registry.live_mut(peer, generation) else {
            return;
        };
        let state = session.link().state();
        let verdict = judge(
            session.is_channel_open(),
            state,
            session.reconnect_attempts,
            self.config.max_reconnect_attempts,
        );
        match verdict {
            Verdict::FalseAlarm => {
                tracing::info!(
                    target: "mesh",
                    peer = %peer,
                    generation,
                    state = ?state,
                    "grace expired with working channel, keeping session"
                );
                session.cancel(TimerKind::Failure);
                session.grace = None;
            }
            Verdict::Retry => {
                let handle = self.timers.session(
                    peer,
                    generation,
                    TimerKind::Failure,
                    self.config.failed_grace,
                );
                session.arm(TimerKind::Failure, handle);
                session.grace = Some(Grace::Failed);
                self.attempt_recovery(peer, generation).await;
            }
            Verdict::Evict => {
                tracing::info!(
                    target: "mesh",
                    peer = %peer,
                    generation,
                    attempts = session.reconnect_attempts,
                    "evicting unreachable peer"
                );
                self.remove_peer(peer).await;
            }
        }
    }

    /// Renegotiate with an ICE restart, within the attempt budget.
    pub(crate) async fn attempt_recovery(&mut self, peer: &PeerId, generation: u64) {
        let max_attempts = self.config.max_reconnect_attempts;
        let Some(session) = self.registry.live_mut(peer, generation) else {
            return;
        };
        if !has_budget(session, max_attempts) {
            tracing::debug!(
                target: "mesh",
                peer = %peer,
                generation,
                "reconnect budget exhausted, awaiting eviction"
            );
            return;
        }
        session.reconnect_attempts += 1;
        let attempt = session.reconnect_attempts;
        let link = session.link().clone();
        if link.phase() != NegotiationPhase::Stable {
            if let Err(err) = link.rollback().await {
                tracing::warn!(
                    target: "mesh",
                    peer = %peer,
                    error = %err,
                    "rollback before restart failed"
                );
            }
        }
        tracing::info!(
            target: "mesh",
            peer = %peer,
            generation,
            attempt,
            max_attempts,
            "attempting ice restart"
        );
        if let Err(err) = self.send_offer(peer, true).await {
            tracing::warn!(
                target: "mesh",
                peer = %peer,
                attempt,
                error = %err,
                "ice restart offer failed"
            );
        }
    }
}

fn has_budget(session: &PeerSession, max_attempts: u32) -> bool {
    session.reconnect_attempts < max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_arms_grace_and_restart_once() {
        let config = MeshConfig::default();
        let plan = plan_for_state(LinkState::Disconnected, None, &config);
        assert!(!plan.recover_now);
        assert_eq!(
            plan.failure_grace,
            Some((Grace::Disconnected, Duration::from_secs(10)))
        );
        assert_eq!(plan.restart_after, Some(Duration::from_secs(3)));

        let again = plan_for_state(LinkState::Disconnected, Some(Grace::Disconnected), &config);
        assert_eq!(again, StatePlan::default());
    }

    #[test]
    fn failure_recovers_immediately_and_shortens_grace() {
        let config = MeshConfig::default();
        let plan = plan_for_state(LinkState::Failed, Some(Grace::Disconnected), &config);
        assert!(plan.recover_now);
        assert_eq!(plan.failure_grace, Some((Grace::Failed, Duration::from_secs(5))));

        let repeated = plan_for_state(LinkState::Failed, Some(Grace::Failed), &config);
        assert!(!repeated.recover_now);
    }

    #[test]
    fn open_channel_overrides_link_state() {
        assert_eq!(judge(true, LinkState::Failed, 3, 3), Verdict::FalseAlarm);
        assert_eq!(judge(false, LinkState::Connected, 3, 3), Verdict::FalseAlarm);
    }

    #[test]
    fn retries_until_budget_then_evicts() {
        assert_eq!(judge(false, LinkState::Failed, 0, 3), Verdict::Retry);
        assert_eq!(judge(false, LinkState::Disconnected, 2, 3), Verdict::Retry);
        assert_eq!(judge(false, LinkState::Failed, 3, 3), Verdict::Evict);
        assert_eq!(judge(false, LinkState::Failed, 0, 0), Verdict::Evict);
    }

    #[test]
    fn degradation_flags_mismatches_only() {
        assert!(degradation(LinkState::Connected, true).is_none());
        assert!(degradation(LinkState::Connected, false).is_some());
        assert!(degradation(LinkState::Disconnected, true).is_some());
    }
}
