//! Single-flight and duplicate suppression for inbound offers and answers.
//!
//! Each peer has one processing lock per description kind. A message arriving
//! while the lock is held is dropped, not queued. Messages whose fingerprint was
//! seen within the retention window are dropped as retransmissions. Locks are
//! released by the driver a short hold after processing so a burst of resends
//! lands on a held lock.

use std::collections::HashMap;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::peer::PeerId;
use crate::timer::TimerHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DedupKind {
    Offer,
    Answer,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Process the message; the lock is held under `token` until released.
    Proceed { token: u64 },
    /// Another message of this kind from the peer is being processed.
    Busy,
    /// The same content was processed within the retention window.
    Duplicate,
}

#[derive(Debug)]
struct Lock {
    token: u64,
    /// Dropping the lock aborts its pending release.
    _release: Option<TimerHandle>,
}

#[derive(Debug, Default)]
struct Track {
    locks: HashMap<PeerId, Lock>,
    seen: HashMap<PeerId, HashMap<String, Instant>>,
}

#[derive(Debug)]
pub struct DeduplicationGuard {
    prefix: usize,
    ttl: Duration,
    next_token: u64,
    offers: Track,
    answers: Track,
}

impl DeduplicationGuard {
    pub fn new(prefix: usize, ttl: Duration) -> Self {
        Self {
            prefix,
            ttl,
            next_token: 0,
            offers: Track::default(),
            answers: Track::default(),
        }
    }

    /// Hex SHA-256 of the first `prefix` characters of `sdp`.
    pub fn fingerprint(&self, sdp: &str) -> String {
        let head: String = sdp.chars().take(self.prefix).collect();
        hex::encode(Sha256::digest(head.as_bytes()))
    }

    pub fn admit(&mut self, kind: DedupKind, peer: &PeerId, sdp: &str) -> Admission {
        let now = Instant::now();
        let fingerprint = self.fingerprint(sdp);
        let ttl = self.ttl;
        self.prune(now);
        self.next_token += 1;
        let token = self.next_token;

        let track = self.track_mut(kind);
        if track.locks.contains_key(peer) {
            return Admission::Busy;
        }
        let seen = track.seen.entry(peer.clone()).or_default();
        if seen
            .get(&fingerprint)
            .is_some_and(|at| now.duration_since(*at) < ttl)
        {
            return Admission::Duplicate;
        }
        seen.insert(fingerprint, now);
        track.locks.insert(
            peer.clone(),
            Lock {
                token,
                _release: None,
            },
        );
        Admission::Proceed { token }
    }

    /// Attach the timer that will release the lock taken under `token`.
    pub fn hold(&mut self, kind: DedupKind, peer: &PeerId, token: u64, release: TimerHandle) {
        if let Some(lock) = self.track_mut(kind).locks.get_mut(peer) {
            if lock.token == token {
                lock._release = Some(release);
            }
        }
    }

    /// Release the lock if it is still the one taken under `token`.
    pub fn release(&mut self, kind: DedupKind, peer: &PeerId, token: u64) -> bool {
        let locks = &mut self.track_mut(kind).locks;
        if locks.get(peer).is_some_and(|lock| lock.token == token) {
            locks.remove(peer);
            true
        } else {
            false
        }
    }

    pub fn is_locked(&self, kind: DedupKind, peer: &PeerId) -> bool {
        self.track(kind).locks.contains_key(peer)
    }

    /// Drop every lock, pending release and fingerprint for `peer`.
    pub fn forget(&mut self, peer: &PeerId) {
        for track in [&mut self.offers, &mut self.answers] {
            track.locks.remove(peer);
            track.seen.remove(peer);
        }
    }

    pub fn clear(&mut self) {
        self.offers = Track::default();
        self.answers = Track::default();
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        for track in [&mut self.offers, &mut self.answers] {
            track.seen.retain(|_, prints| {
                prints.retain(|_, at| now.duration_since(*at) < ttl);
                !prints.is_empty()
            });
        }
    }

    fn track(&self, kind: DedupKind) -> &Track {
        match kind {
            DedupKind::Offer => &self.offers,
            DedupKind::Answer => &self.answers,
        }
    }

    fn track_mut(&mut self, kind: DedupKind) -> &mut Track {
        match kind {
            DedupKind::Offer => &mut self.offers,
            DedupKind::Answer => &mut self.answers,
        }
    }
}
