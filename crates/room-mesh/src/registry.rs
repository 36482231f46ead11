use std::collections::HashMap;

use crate::peer::PeerId;
use crate::session::PeerSession;

/// Owner of every live [`PeerSession`], keyed by remote peer.
///
/// Each installed session receives a fresh generation number. Link events and
/// timer firings carry the generation they were created for and are matched
/// against the live session with [`ConnectionRegistry::live_mut`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: HashMap<PeerId, PeerSession>,
    next_generation: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer)
    }

    /// The session for `peer`, only if it is still the one created under `generation`.
    pub fn live_mut(&mut self, peer: &PeerId, generation: u64) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(peer)
            .filter(|session| session.generation() == generation)
    }

    /// Install a session. The previous session for the peer, if any, must have
    /// been taken and closed already.
    pub fn install(&mut self, session: PeerSession) -> &mut PeerSession {
        let peer = session.peer().clone();
        debug_assert!(!self.sessions.contains_key(&peer));
        self.sessions.entry(peer).insert_entry(session).into_mut()
    }

    pub fn take(&mut self, peer: &PeerId) -> Option<PeerSession> {
        self.sessions.remove(peer)
    }

    /// Take the session only if it is still the one created under `generation`.
    pub fn take_live(&mut self, peer: &PeerId, generation: u64) -> Option<PeerSession> {
        if self.live_mut(peer, generation).is_some() {
            self.sessions.remove(peer)
        } else {
            None
        }
    }

    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkEvents, LinkFactory, MemoryNetwork};
    use crate::peer::Politeness;
    use tokio::sync::mpsc;

    async fn session(net: &MemoryNetwork, peer: &str, generation: u64) -> PeerSession {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = PeerId::new(peer);
        let link = net
            .factory("local")
            .connect(&peer, LinkEvents::new(peer.clone(), generation, tx))
            .await
            .unwrap();
        PeerSession::new(peer, generation, Politeness::Impolite, link)
    }

    #[tokio::test]
    async fn generations_are_unique_and_increasing() {
        let mut registry = ConnectionRegistry::new();
        let a = registry.next_generation();
        let b = registry.next_generation();
        assert!(b > a);
    }

    #[tokio::test]
    async fn live_lookup_rejects_old_generation() {
        let net = MemoryNetwork::new();
        let mut registry = ConnectionRegistry::new();
        let peer = PeerId::new("b");
        let first = registry.next_generation();
        registry.install(session(&net, "b", first).await);

        let old = registry.take(&peer).unwrap();
        old.close().await;
        let second = registry.next_generation();
        registry.install(session(&net, "b", second).await);

        assert!(registry.live_mut(&peer, first).is_none());
        assert!(registry.take_live(&peer, first).is_none());
        assert_eq!(registry.live_mut(&peer, second).unwrap().generation(), second);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn drain_empties_registry() {
        let net = MemoryNetwork::new();
        let mut registry = ConnectionRegistry::new();
        for peer in ["b", "c"] {
            let generation = registry.next_generation();
            registry.install(session(&net, peer, generation).await);
        }
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
