//! In-process link network.
//!
//! Links created from one [`MemoryNetwork`] negotiate with each other through
//! real offer/answer/candidate exchanges carried by the mesh's signaling bus.
//! A pair becomes connected when the offering side applies the answer to its
//! outstanding offer. Pairs can be partitioned, healed and flapped to exercise
//! the recovery paths.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    DataLink, LinkError, LinkEvent, LinkEvents, LinkFactory, LinkState, NegotiationPhase, PeerLink,
};
use crate::peer::PeerId;
use crate::signal::{IceCandidate, SdpKind, SessionDescription};

/// A completed offer/answer exchange between two memory links.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiationRecord {
    pub offerer: PeerId,
    pub answerer: PeerId,
    pub ice_restart: bool,
    pub connected: bool,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

#[derive(Default)]
struct NetState {
    next_id: u64,
    links: HashMap<u64, LinkSlot>,
    channels: HashMap<u64, ChannelSlot>,
    offers: HashMap<String, (u64, bool)>,
    answered: HashMap<String, u64>,
    partitions: HashSet<(PeerId, PeerId)>,
    refused: HashSet<PeerId>,
    records: Vec<NegotiationRecord>,
}

struct LinkSlot {
    local: PeerId,
    remote: PeerId,
    state: LinkState,
    phase: NegotiationPhase,
    local_offer: Option<String>,
    remote_offer: Option<String>,
    has_remote: bool,
    candidates: usize,
    paired: Option<u64>,
    channels: Vec<u64>,
    events: LinkEvents,
}

struct ChannelSlot {
    label: String,
    link: u64,
    open: bool,
    peer: Option<u64>,
}

fn pair_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn sdp_field<'a>(sdp: &'a str, key: &str) -> Option<&'a str> {
    sdp.split_whitespace()
        .find_map(|part| part.strip_prefix(key)?.strip_prefix('='))
}

impl NetState {
    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn link(&mut self, id: u64) -> Result<&mut LinkSlot, LinkError> {
        match self.links.get_mut(&id) {
            Some(slot) if slot.state != LinkState::Closed => Ok(slot),
            _ => Err(LinkError::Closed),
        }
    }

    fn set_state(&mut self, id: u64, state: LinkState) {
        if let Some(slot) = self.links.get_mut(&id) {
            if slot.state != state && slot.state != LinkState::Closed {
                slot.state = state;
                slot.events.emit(LinkEvent::StateChanged(state));
            }
        }
    }

    fn close_channel(&mut self, channel: u64) {
        let Some(slot) = self.channels.get_mut(&channel) else {
            return;
        };
        if !slot.open {
            return;
        }
        slot.open = false;
        let link = slot.link;
        if let Some(owner) = self.links.get(&link) {
            owner.events.emit(LinkEvent::ChannelClosed);
        }
    }

    fn emit_to_channel_owner(&self, channel: u64, event: LinkEvent) {
        if let Some(owner) = self
            .channels
            .get(&channel)
            .and_then(|slot| self.links.get(&slot.link))
        {
            owner.events.emit(event);
        }
    }

    fn establish(&mut self, offerer: u64, answerer: u64, ice_restart: bool, net: &MemoryNetwork) {
        let (Some(a), Some(b)) = (self.links.get(&offerer), self.links.get(&answerer)) else {
            return;
        };
        if a.state == LinkState::Closed || b.state == LinkState::Closed {
            return;
        }
        let key = pair_key(&a.local, &b.local);
        let partitioned = self.partitions.contains(&key);
        self.records.push(NegotiationRecord {
            offerer: a.local.clone(),
            answerer: b.local.clone(),
            ice_restart,
            connected: !partitioned,
        });
        if partitioned {
            self.set_state(offerer, LinkState::Failed);
            self.set_state(answerer, LinkState::Failed);
            return;
        }

        if let Some(slot) = self.links.get_mut(&offerer) {
            slot.paired = Some(answerer);
        }
        if let Some(slot) = self.links.get_mut(&answerer) {
            slot.paired = Some(offerer);
        }
        self.set_state(offerer, LinkState::Connected);
        self.set_state(answerer, LinkState::Connected);
        self.open_channels(offerer, answerer, net);
        self.open_channels(answerer, offerer, net);
    }

    /// Give every channel of `from` a live counterpart on `to` and open both ends.
    fn open_channels(&mut self, from: u64, to: u64, net: &MemoryNetwork) {
        let owned = self
            .links
            .get(&from)
            .map(|slot| slot.channels.clone())
            .unwrap_or_default();
        for channel in owned {
            let Some((current, label)) = self
                .channels
                .get(&channel)
                .map(|slot| (slot.peer, slot.label.clone()))
            else {
                continue;
            };
            let peer = match current {
                Some(peer) if self.channels.get(&peer).is_some_and(|p| p.link == to) => peer,
                Some(_) => continue,
                None => {
                    let peer = self.alloc();
                    self.channels.insert(
                        peer,
                        ChannelSlot {
                            label: label.clone(),
                            link: to,
                            open: false,
                            peer: Some(channel),
                        },
                    );
                    if let Some(slot) = self.channels.get_mut(&channel) {
                        slot.peer = Some(peer);
                    }
                    let Some(remote) = self.links.get_mut(&to) else {
                        continue;
                    };
                    remote.channels.push(peer);
                    let handle: Arc<dyn DataLink> = Arc::new(MemoryChannel {
                        id: peer,
                        label,
                        net: net.clone(),
                    });
                    remote.events.emit(LinkEvent::DataChannel(handle));
                    peer
                }
            };
            for end in [channel, peer] {
                let opened = match self.channels.get_mut(&end) {
                    Some(slot) if !slot.open => {
                        slot.open = true;
                        true
                    }
                    _ => false,
                };
                if opened {
                    self.emit_to_channel_owner(end, LinkEvent::ChannelOpen);
                }
            }
        }
    }

    fn links_between(&self, a: &PeerId, b: &PeerId) -> Vec<u64> {
        self.links
            .iter()
            .filter(|(_, slot)| {
                slot.state != LinkState::Closed
                    && ((&slot.local == a && &slot.remote == b)
                        || (&slot.local == b && &slot.remote == a))
            })
            .map(|(id, _)| *id)
            .collect()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self, local: impl Into<PeerId>) -> MemoryLinkFactory {
        MemoryLinkFactory {
            net: self.clone(),
            local: local.into(),
        }
    }

    /// Cut the path between `a` and `b`: live links fail, their channels close,
    /// and negotiations completed while partitioned never connect.
    pub fn partition(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        state.partitions.insert(pair_key(a, b));
        for id in state.links_between(a, b) {
            let channels = state
                .links
                .get(&id)
                .map(|slot| slot.channels.clone())
                .unwrap_or_default();
            for channel in channels {
                state.close_channel(channel);
            }
            state.set_state(id, LinkState::Failed);
        }
    }

    pub fn heal(&self, a: &PeerId, b: &PeerId) {
        self.state.lock().partitions.remove(&pair_key(a, b));
    }

    /// Report connected links between `a` and `b` as disconnected while their
    /// channels keep working.
    pub fn flap(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        for id in state.links_between(a, b) {
            if state.links.get(&id).map(|slot| slot.state) == Some(LinkState::Connected) {
                state.set_state(id, LinkState::Disconnected);
            }
        }
    }

    /// Make every later link creation by `peer` fail.
    pub fn refuse_links_from(&self, peer: &PeerId) {
        self.state.lock().refused.insert(peer.clone());
    }

    pub fn negotiations(&self, a: &PeerId, b: &PeerId) -> Vec<NegotiationRecord> {
        let key = pair_key(a, b);
        self.state
            .lock()
            .records
            .iter()
            .filter(|record| pair_key(&record.offerer, &record.answerer) == key)
            .cloned()
            .collect()
    }

    /// Number of `local`'s links towards `remote` that are currently connected.
    pub fn established(&self, local: &PeerId, remote: &PeerId) -> usize {
        self.state
            .lock()
            .links
            .values()
            .filter(|slot| {
                &slot.local == local && &slot.remote == remote && slot.state == LinkState::Connected
            })
            .count()
    }

    /// Remote candidates applied to `local`'s newest link towards `remote`.
    pub fn candidates_applied(&self, local: &PeerId, remote: &PeerId) -> usize {
        let state = self.state.lock();
        state
            .links
            .iter()
            .filter(|(_, slot)| &slot.local == local && &slot.remote == remote)
            .max_by_key(|(id, _)| **id)
            .map(|(_, slot)| slot.candidates)
            .unwrap_or(0)
    }
}

pub struct MemoryLinkFactory {
    net: MemoryNetwork,
    local: PeerId,
}

#[async_trait]
impl LinkFactory for MemoryLinkFactory {
    async fn connect(
        &self,
        remote: &PeerId,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        let mut state = self.net.state.lock();
        if state.refused.contains(&self.local) {
            return Err(LinkError::Setup(format!(
                "memory network refuses links from {}",
                self.local
            )));
        }
        let id = state.alloc();
        state.links.insert(
            id,
            LinkSlot {
                local: self.local.clone(),
                remote: remote.clone(),
                state: LinkState::New,
                phase: NegotiationPhase::Stable,
                local_offer: None,
                remote_offer: None,
                has_remote: false,
                candidates: 0,
                paired: None,
                channels: Vec::new(),
                events,
            },
        );
        Ok(Arc::new(MemoryLink {
            id,
            local: self.local.clone(),
            remote: remote.clone(),
            net: self.net.clone(),
        }))
    }
}

pub struct MemoryLink {
    id: u64,
    local: PeerId,
    remote: PeerId,
    net: MemoryNetwork,
}

impl MemoryLink {
    /// Each link keeps one username fragment across offers and restarts.
    fn ufrag(&self) -> String {
        format!("m{}", self.id)
    }

    fn emit_host_candidate(&self, slot: &LinkSlot) {
        slot.events.emit(LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 memory {} typ host",
                self.id, self.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some(self.ufrag()),
        }));
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    fn state(&self) -> LinkState {
        self.net
            .state
            .lock()
            .links
            .get(&self.id)
            .map_or(LinkState::Closed, |slot| slot.state)
    }

    fn phase(&self) -> NegotiationPhase {
        self.net
            .state
            .lock()
            .links
            .get(&self.id)
            .map_or(NegotiationPhase::Closed, |slot| slot.phase)
    }

    async fn has_remote_description(&self) -> bool {
        self.net
            .state
            .lock()
            .links
            .get(&self.id)
            .is_some_and(|slot| slot.has_remote)
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _ordered: bool,
    ) -> Result<Arc<dyn DataLink>, LinkError> {
        let mut state = self.net.state.lock();
        state.link(self.id)?;
        let channel = state.alloc();
        state.channels.insert(
            channel,
            ChannelSlot {
                label: label.to_string(),
                link: self.id,
                open: false,
                peer: None,
            },
        );
        let paired = {
            let slot = state.link(self.id)?;
            slot.channels.push(channel);
            (slot.state == LinkState::Connected)
                .then_some(slot.paired)
                .flatten()
        };
        if let Some(paired) = paired {
            state.open_channels(self.id, paired, &self.net);
        }
        Ok(Arc::new(MemoryChannel {
            id: channel,
            label: label.to_string(),
            net: self.net.clone(),
        }))
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, LinkError> {
        let mut state = self.net.state.lock();
        let token = format!("o{}", state.alloc());
        let slot = state.link(self.id)?;
        if !matches!(
            slot.phase,
            NegotiationPhase::Stable | NegotiationPhase::HaveLocalOffer
        ) {
            return Err(LinkError::InvalidPhase(slot.phase));
        }
        let previous = slot.local_offer.replace(token.clone());
        slot.phase = NegotiationPhase::HaveLocalOffer;
        if let Some(previous) = previous {
            state.offers.remove(&previous);
        }
        state.offers.insert(token.clone(), (self.id, ice_restart));
        if let Some(slot) = state.links.get(&self.id) {
            self.emit_host_candidate(slot);
        }
        Ok(SessionDescription::offer(format!(
            "v=0 memory-offer token={token} restart={} from={} to={} a=ice-ufrag:{}",
            u8::from(ice_restart),
            self.local,
            self.remote,
            self.ufrag()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let mut state = self.net.state.lock();
        let slot = state.link(self.id)?;
        if slot.phase != NegotiationPhase::HaveRemoteOffer {
            return Err(LinkError::InvalidPhase(slot.phase));
        }
        let token = slot
            .remote_offer
            .take()
            .ok_or_else(|| LinkError::Negotiation("no remote offer applied".into()))?;
        slot.phase = NegotiationPhase::Stable;
        state.answered.insert(token.clone(), self.id);
        if let Some(slot) = state.links.get(&self.id) {
            self.emit_host_candidate(slot);
        }
        Ok(SessionDescription::answer(format!(
            "v=0 memory-answer token={token} from={} to={} a=ice-ufrag:{}",
            self.local,
            self.remote,
            self.ufrag()
        )))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let token = sdp_field(&description.sdp, "token")
            .ok_or_else(|| LinkError::Negotiation("description has no token".into()))?
            .to_string();
        let mut state = self.net.state.lock();
        match description.kind {
            SdpKind::Offer => {
                let slot = state.link(self.id)?;
                if slot.phase != NegotiationPhase::Stable {
                    return Err(LinkError::InvalidPhase(slot.phase));
                }
                slot.remote_offer = Some(token);
                slot.has_remote = true;
                slot.phase = NegotiationPhase::HaveRemoteOffer;
                Ok(())
            }
            SdpKind::Answer => {
                let slot = state.link(self.id)?;
                if slot.phase != NegotiationPhase::HaveLocalOffer {
                    return Err(LinkError::InvalidPhase(slot.phase));
                }
                if slot.local_offer.as_deref() != Some(token.as_str()) {
                    return Err(LinkError::Negotiation(
                        "answer does not match the outstanding offer".into(),
                    ));
                }
                slot.local_offer = None;
                slot.has_remote = true;
                slot.phase = NegotiationPhase::Stable;
                let ice_restart = state.offers.remove(&token).is_some_and(|(_, r)| r);
                if let Some(answerer) = state.answered.remove(&token) {
                    let net = self.net.clone();
                    state.establish(self.id, answerer, ice_restart, &net);
                }
                Ok(())
            }
        }
    }

    async fn rollback(&self) -> Result<(), LinkError> {
        let mut state = self.net.state.lock();
        let slot = state.link(self.id)?;
        match slot.phase {
            NegotiationPhase::HaveLocalOffer => {
                let token = slot.local_offer.take();
                slot.phase = NegotiationPhase::Stable;
                if let Some(token) = token {
                    state.offers.remove(&token);
                }
                Ok(())
            }
            NegotiationPhase::HaveRemoteOffer => {
                slot.remote_offer = None;
                slot.phase = NegotiationPhase::Stable;
                Ok(())
            }
            phase => Err(LinkError::InvalidPhase(phase)),
        }
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), LinkError> {
        let mut state = self.net.state.lock();
        let slot = state.link(self.id)?;
        if !slot.has_remote {
            return Err(LinkError::Negotiation("no remote description".into()));
        }
        slot.candidates += 1;
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.net.state.lock();
        let Some(slot) = state.links.get_mut(&self.id) else {
            return;
        };
        if slot.state == LinkState::Closed {
            return;
        }
        slot.state = LinkState::Closed;
        slot.phase = NegotiationPhase::Closed;
        let channels = slot.channels.clone();
        let paired = slot.paired.take();
        let offer = slot.local_offer.take();
        if let Some(offer) = offer {
            state.offers.remove(&offer);
        }
        for channel in channels {
            let peer = state.channels.get(&channel).and_then(|slot| slot.peer);
            if let Some(slot) = state.channels.get_mut(&channel) {
                slot.open = false;
            }
            if let Some(peer) = peer {
                state.close_channel(peer);
            }
        }
        if let Some(paired) = paired {
            if let Some(slot) = state.links.get_mut(&paired) {
                slot.paired = None;
            }
            if state.links.get(&paired).map(|slot| slot.state) == Some(LinkState::Connected) {
                state.set_state(paired, LinkState::Disconnected);
            }
        }
    }
}

pub struct MemoryChannel {
    id: u64,
    label: String,
    net: MemoryNetwork,
}

#[async_trait]
impl DataLink for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.net
            .state
            .lock()
            .channels
            .get(&self.id)
            .is_some_and(|slot| slot.open)
    }

    async fn send(&self, data: Bytes) -> Result<(), LinkError> {
        let state = self.net.state.lock();
        let peer = match state.channels.get(&self.id) {
            Some(slot) if slot.open => slot.peer.ok_or(LinkError::ChannelNotOpen)?,
            _ => return Err(LinkError::ChannelNotOpen),
        };
        state.emit_to_channel_owner(peer, LinkEvent::ChannelMessage(data));
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.net.state.lock();
        let peer = state.channels.get(&self.id).and_then(|slot| slot.peer);
        if let Some(slot) = state.channels.get_mut(&self.id) {
            slot.open = false;
        }
        if let Some(peer) = peer {
            state.close_channel(peer);
        }
    }
}
