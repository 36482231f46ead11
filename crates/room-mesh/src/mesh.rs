//! The room mesh facade and the driver task behind it.
//!
//! [`RoomMesh`] is a cheap handle. Every operation is sent to a single driver
//! task that owns the registry, the dedup guard and the member set, and that
//! interleaves facade calls with inbound signaling, link events and timer
//! firings one at a time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use signal_bus::{BusMessage, SignalBus};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::MeshConfig;
use crate::dedup::{DedupKind, DeduplicationGuard};
use crate::error::{MeshError, MeshResult};
use crate::events::MeshEvent;
use crate::link::{DataLink, LinkEvent, LinkEvents, LinkFactory, TaggedLinkEvent};
use crate::peer::{PeerId, is_initiator, politeness};
use crate::registry::ConnectionRegistry;
use crate::session::PeerSession;
use crate::signal::{Envelope, IceCandidate, Participant, SessionDescription, Signal};
use crate::timer::{Timeout, TimerKind, Timers};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    CreateOffer {
        peer: PeerId,
        reply: Reply<MeshResult<()>>,
    },
    HandleOffer {
        peer: PeerId,
        description: SessionDescription,
        ice_restart: bool,
        reply: Reply<MeshResult<()>>,
    },
    HandleAnswer {
        peer: PeerId,
        description: SessionDescription,
        reply: Reply<MeshResult<()>>,
    },
    HandleIce {
        peer: PeerId,
        candidate: IceCandidate,
        reply: Reply<MeshResult<()>>,
    },
    HandleEnvelope {
        envelope: Envelope,
        reply: Reply<MeshResult<()>>,
    },
    Join {
        existing: Vec<Participant>,
        reply: Reply<MeshResult<()>>,
    },
    Leave {
        reply: Reply<MeshResult<()>>,
    },
    SendToPeer {
        peer: PeerId,
        data: Bytes,
        reply: Reply<bool>,
    },
    SendToAll {
        data: Bytes,
        reply: Reply<usize>,
    },
    RemovePeer {
        peer: PeerId,
        reply: Reply<()>,
    },
    Destroy {
        reply: Reply<()>,
    },
    Members {
        reply: Reply<Vec<PeerId>>,
    },
    ConnectedPeers {
        reply: Reply<Vec<PeerId>>,
    },
}

/// Handle to one participant's view of a room mesh.
///
/// Dropping every clone of the handle tears the mesh down as [`RoomMesh::destroy`] does.
#[derive(Clone, Debug)]
pub struct RoomMesh {
    local: PeerId,
    room: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::CreateOffer { .. } => "CreateOffer",
            Command::HandleOffer { .. } => "HandleOffer",
            Command::HandleAnswer { .. } => "HandleAnswer",
            Command::HandleIce { .. } => "HandleIce",
            Command::HandleEnvelope { .. } => "HandleEnvelope",
            Command::Join { .. } => "Join",
            Command::Leave { .. } => "Leave",
            Command::SendToPeer { .. } => "SendToPeer",
            Command::SendToAll { .. } => "SendToAll",
            Command::RemovePeer { .. } => "RemovePeer",
            Command::Destroy { .. } => "Destroy",
            Command::Members { .. } => "Members",
            Command::ConnectedPeers { .. } => "ConnectedPeers",
        };
        f.write_str(name)
    }
}

impl RoomMesh {
    /// Subscribe to the room's signaling topic and start the driver task.
    ///
    /// Must be called inside a tokio runtime. Returns the handle and the stream
    /// of lifecycle events.
    pub fn spawn(
        local: PeerId,
        room: impl Into<String>,
        bus: Arc<dyn SignalBus>,
        links: Arc<dyn LinkFactory>,
        config: MeshConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let room = room.into();
        let inbound = bus.subscribe(&room);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let driver = MeshDriver {
            local: local.clone(),
            room: room.clone(),
            dedup: DeduplicationGuard::new(config.fingerprint_prefix, config.fingerprint_ttl),
            config,
            bus,
            links,
            registry: ConnectionRegistry::new(),
            members: BTreeSet::new(),
            early_candidates: HashMap::new(),
            timers: Timers::new(timer_tx),
            link_tx,
            events: events_tx,
        };
        tracing::debug!(target: "mesh", peer = %local, room = %room, "mesh driver starting");
        tokio::spawn(driver.run(commands_rx, inbound, link_rx, timer_rx));

        (
            Self {
                local,
                room,
                commands: commands_tx,
            },
            events_rx,
        )
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).ok()?;
        rx.await.ok()
    }

    async fn request_result(
        &self,
        build: impl FnOnce(Reply<MeshResult<()>>) -> Command,
    ) -> MeshResult<()> {
        self.request(build).await.unwrap_or(Err(MeshError::Closed))
    }

    /// Begin negotiating with `peer`. A no-op while a usable session exists.
    pub async fn create_offer(&self, peer: impl Into<PeerId>) -> MeshResult<()> {
        let peer = peer.into();
        self.request_result(|reply| Command::CreateOffer { peer, reply })
            .await
    }

    pub async fn handle_offer(
        &self,
        peer: impl Into<PeerId>,
        description: SessionDescription,
        ice_restart: bool,
    ) -> MeshResult<()> {
        let peer = peer.into();
        self.request_result(|reply| Command::HandleOffer {
            peer,
            description,
            ice_restart,
            reply,
        })
        .await
    }

    pub async fn handle_answer(
        &self,
        peer: impl Into<PeerId>,
        description: SessionDescription,
    ) -> MeshResult<()> {
        let peer = peer.into();
        self.request_result(|reply| Command::HandleAnswer {
            peer,
            description,
            reply,
        })
        .await
    }

    pub async fn handle_ice_candidate(
        &self,
        peer: impl Into<PeerId>,
        candidate: IceCandidate,
    ) -> MeshResult<()> {
        let peer = peer.into();
        self.request_result(|reply| Command::HandleIce {
            peer,
            candidate,
            reply,
        })
        .await
    }

    /// Route a decoded signaling message as if it had arrived on the bus.
    pub async fn handle_envelope(&self, envelope: Envelope) -> MeshResult<()> {
        self.request_result(|reply| Command::HandleEnvelope { envelope, reply })
            .await
    }

    /// Announce ourselves and offer to the existing participants we initiate towards.
    pub async fn join(&self, existing: Vec<Participant>) -> MeshResult<()> {
        self.request_result(|reply| Command::Join { existing, reply })
            .await
    }

    /// Announce departure and tear the mesh down.
    pub async fn leave(&self) -> MeshResult<()> {
        self.request_result(|reply| Command::Leave { reply }).await
    }

    /// Send to one peer. False when no open channel exists for it.
    pub async fn send_to_peer(&self, peer: impl Into<PeerId>, data: impl Into<Bytes>) -> bool {
        let peer = peer.into();
        let data = data.into();
        self.request(|reply| Command::SendToPeer { peer, data, reply })
            .await
            .unwrap_or(false)
    }

    /// Send to every peer with an open channel; returns how many sends succeeded.
    pub async fn send_to_all(&self, data: impl Into<Bytes>) -> usize {
        let data = data.into();
        self.request(|reply| Command::SendToAll { data, reply })
            .await
            .unwrap_or(0)
    }

    pub async fn remove_peer(&self, peer: impl Into<PeerId>) {
        let peer = peer.into();
        self.request(|reply| Command::RemovePeer { peer, reply })
            .await;
    }

    /// Remove every peer and stop the driver.
    pub async fn destroy(&self) {
        self.request(|reply| Command::Destroy { reply }).await;
    }

    pub async fn members(&self) -> Vec<PeerId> {
        self.request(|reply| Command::Members { reply })
            .await
            .unwrap_or_default()
    }

    /// Peers whose data channel is currently open.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.request(|reply| Command::ConnectedPeers { reply })
            .await
            .unwrap_or_default()
    }
}

pub(crate) struct MeshDriver {
    pub(crate) local: PeerId,
    pub(crate) room: String,
    pub(crate) config: MeshConfig,
    bus: Arc<dyn SignalBus>,
    links: Arc<dyn LinkFactory>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) dedup: DeduplicationGuard,
    pub(crate) members: BTreeSet<PeerId>,
    pub(crate) early_candidates: HashMap<PeerId, Vec<IceCandidate>>,
    pub(crate) timers: Timers,
    link_tx: mpsc::UnboundedSender<TaggedLinkEvent>,
    events: mpsc::UnboundedSender<MeshEvent>,
}

enum Flow {
    Continue,
    Stop,
}

impl MeshDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: broadcast::Receiver<BusMessage>,
        mut link_events: mpsc::UnboundedReceiver<TaggedLinkEvent>,
        mut timeouts: mpsc::UnboundedReceiver<Timeout>,
    ) {
        let mut bus_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!(target: "mesh", peer = %self.local, "mesh handle dropped");
                        self.destroy().await;
                        break;
                    };
                    if let Flow::Stop = self.on_command(command).await {
                        break;
                    }
                }
                Some(event) = link_events.recv() => self.on_link_event(event).await,
                Some(timeout) = timeouts.recv() => self.on_timeout(timeout).await,
                message = inbound.recv(), if bus_open => match message {
                    Ok(message) => self.on_bus_message(message).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "mesh", skipped, "signaling subscriber lagged");
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!(target: "mesh", room = %self.room, "signaling topic closed");
                        bus_open = false;
                    }
                },
            }
        }
        tracing::debug!(
            target: "mesh",
            peer = %self.local,
            room = %self.room,
            "mesh driver stopped"
        );
    }

    async fn on_command(&mut self, command: Command) -> Flow {
        tracing::trace!(target: "mesh", command = ?command, "mesh command");
        match command {
            Command::CreateOffer { peer, reply } => {
                let _ = reply.send(self.create_offer(&peer).await);
            }
            Command::HandleOffer {
                peer,
                description,
                ice_restart,
                reply,
            } => {
                let _ = reply.send(self.handle_offer(&peer, description, ice_restart).await);
            }
            Command::HandleAnswer {
                peer,
                description,
                reply,
            } => {
                let _ = reply.send(self.handle_answer(&peer, description).await);
            }
            Command::HandleIce {
                peer,
                candidate,
                reply,
            } => {
                let _ = reply.send(self.handle_ice_candidate(&peer, candidate).await);
            }
            Command::HandleEnvelope { envelope, reply } => {
                let _ = reply.send(self.handle_envelope(envelope).await);
            }
            Command::Join { existing, reply } => {
                let _ = reply.send(self.join(existing).await);
            }
            Command::Leave { reply } => {
                let envelope =
                    Envelope::broadcast(self.room.clone(), self.local.clone(), Signal::Leave);
                let result = self.publish(&envelope);
                self.destroy().await;
                let _ = reply.send(result);
                return Flow::Stop;
            }
            Command::SendToPeer { peer, data, reply } => {
                let _ = reply.send(self.send_to_peer(&peer, data).await);
            }
            Command::SendToAll { data, reply } => {
                let _ = reply.send(self.send_to_all(data).await);
            }
            Command::RemovePeer { peer, reply } => {
                self.members.remove(&peer);
                self.remove_peer(&peer).await;
                let _ = reply.send(());
            }
            Command::Destroy { reply } => {
                self.destroy().await;
                let _ = reply.send(());
                return Flow::Stop;
            }
            Command::Members { reply } => {
                let _ = reply.send(self.members.iter().cloned().collect());
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.connected_peers());
            }
        }
        Flow::Continue
    }

    async fn on_bus_message(&mut self, message: BusMessage) {
        match Envelope::decode(&message.payload) {
            Ok(envelope) => {
                if let Err(err) = self.handle_envelope(envelope).await {
                    tracing::warn!(target: "mesh", error = %err, "signaling message failed");
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "mesh",
                    topic = %message.topic,
                    error = %err,
                    "undecodable signaling message dropped"
                );
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> MeshResult<()> {
        if envelope.room != self.room {
            tracing::trace!(
                target: "mesh",
                room = %envelope.room,
                "message for another room ignored"
            );
            return Ok(());
        }
        if envelope.from == self.local {
            return Ok(());
        }
        if envelope.to.as_ref().is_some_and(|to| to != &self.local) {
            return Ok(());
        }
        let peer = envelope.from.clone();
        tracing::trace!(target: "mesh", peer = %peer, kind = %envelope.kind(), "signaling message");
        match envelope.signal {
            Signal::Join { .. } => {
                self.members.insert(peer.clone());
                if is_initiator(&self.local, &peer) {
                    self.create_offer(&peer).await?;
                }
                Ok(())
            }
            Signal::Leave => {
                tracing::info!(target: "mesh", peer = %peer, "peer left the room");
                self.members.remove(&peer);
                self.remove_peer(&peer).await;
                Ok(())
            }
            Signal::Offer {
                description,
                ice_restart,
            } => self.handle_offer(&peer, description, ice_restart).await,
            Signal::Answer { description } => self.handle_answer(&peer, description).await,
            Signal::Ice { candidate } => self.handle_ice_candidate(&peer, candidate).await,
        }
    }

    async fn join(&mut self, existing: Vec<Participant>) -> MeshResult<()> {
        let envelope = Envelope::broadcast(
            self.room.clone(),
            self.local.clone(),
            Signal::Join {
                existing: existing.clone(),
            },
        );
        self.publish(&envelope)?;
        tracing::info!(
            target: "mesh",
            peer = %self.local,
            room = %self.room,
            existing = existing.len(),
            "joined room"
        );
        for participant in existing {
            let peer = participant.id;
            if peer == self.local {
                continue;
            }
            self.members.insert(peer.clone());
            if is_initiator(&self.local, &peer) {
                if let Err(err) = self.create_offer(&peer).await {
                    tracing::warn!(
                        target: "mesh",
                        peer = %peer,
                        error = %err,
                        "offer to existing participant failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn on_link_event(&mut self, tagged: TaggedLinkEvent) {
        let TaggedLinkEvent {
            peer,
            generation,
            event,
        } = tagged;
        let Some(session) = self.registry.live_mut(&peer, generation) else {
            tracing::trace!(
                target: "mesh",
                peer = %peer,
                generation,
                event = ?event,
                "event from replaced link ignored"
            );
            return;
        };
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let envelope = Envelope::unicast(
                    self.room.clone(),
                    self.local.clone(),
                    peer.clone(),
                    Signal::Ice { candidate },
                );
                if let Err(err) = self.publish(&envelope) {
                    tracing::warn!(
                        target: "mesh",
                        peer = %peer,
                        error = %err,
                        "failed to publish candidate"
                    );
                }
            }
            LinkEvent::StateChanged(state) => self.on_link_state(&peer, generation, state).await,
            LinkEvent::DataChannel(channel) => {
                if session.is_channel_open() {
                    tracing::debug!(
                        target: "mesh",
                        peer = %peer,
                        label = channel.label(),
                        "extra data channel ignored"
                    );
                    return;
                }
                tracing::debug!(
                    target: "mesh",
                    peer = %peer,
                    label = channel.label(),
                    "data channel received"
                );
                let open = channel.is_open();
                session.set_channel(channel);
                // Its open event may have been raised before the channel reached us.
                if open && session.announce_channel() {
                    tracing::info!(target: "mesh", peer = %peer, generation, "data channel open");
                    self.emit(MeshEvent::DataChannelOpen(peer));
                }
            }
            LinkEvent::ChannelOpen => {
                if session.is_channel_open() && session.announce_channel() {
                    tracing::info!(target: "mesh", peer = %peer, generation, "data channel open");
                    self.emit(MeshEvent::DataChannelOpen(peer));
                }
            }
            LinkEvent::ChannelMessage(data) => {
                self.emit(MeshEvent::DataReceived { peer, data });
            }
            LinkEvent::ChannelClosed => {
                if !session.is_channel_open() {
                    session.reset_channel_announcement();
                }
                tracing::debug!(target: "mesh", peer = %peer, generation, "data channel closed");
            }
        }
    }

    async fn on_timeout(&mut self, timeout: Timeout) {
        match timeout {
            Timeout::ReleaseLock { peer, kind, token } => {
                if self.dedup.release(kind, &peer, token) {
                    tracing::trace!(
                        target: "mesh",
                        peer = %peer,
                        kind = ?kind,
                        "processing lock released"
                    );
                }
            }
            Timeout::Session {
                peer,
                generation,
                kind,
                seq,
            } => {
                let current = self
                    .registry
                    .live_mut(&peer, generation)
                    .is_some_and(|session| session.is_current(kind, seq));
                if !current {
                    tracing::trace!(
                        target: "mesh",
                        peer = %peer,
                        generation,
                        kind = ?kind,
                        "stale timer ignored"
                    );
                    return;
                }
                self.on_session_timer(&peer, generation, kind).await;
            }
        }
    }

    async fn send_to_peer(&mut self, peer: &PeerId, data: Bytes) -> bool {
        let Some(channel) = self.open_channel(peer) else {
            tracing::debug!(target: "mesh", peer = %peer, "send skipped, no open channel");
            return false;
        };
        match channel.send(data).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(target: "mesh", peer = %peer, error = %err, "send failed");
                false
            }
        }
    }

    async fn send_to_all(&mut self, data: Bytes) -> usize {
        let targets: Vec<(PeerId, Arc<dyn DataLink>)> = self
            .registry
            .sessions()
            .filter(|session| session.is_channel_open())
            .filter_map(|session| Some((session.peer().clone(), session.channel()?.clone())))
            .collect();
        let mut delivered = 0;
        for (peer, channel) in targets {
            match channel.send(data.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(
                        target: "mesh",
                        peer = %peer,
                        error = %err,
                        "broadcast send failed"
                    );
                }
            }
        }
        delivered
    }

    fn open_channel(&self, peer: &PeerId) -> Option<Arc<dyn DataLink>> {
        let session = self.registry.get(peer)?;
        if session.is_channel_open() {
            session.channel().cloned()
        } else {
            None
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .registry
            .sessions()
            .filter(|session| session.is_channel_open())
            .map(|session| session.peer().clone())
            .collect();
        peers.sort();
        peers
    }

    /// Replace any existing session for `peer` with a fresh one and return its generation.
    pub(crate) async fn open_session(
        &mut self,
        peer: &PeerId,
        open_channel: bool,
    ) -> MeshResult<u64> {
        if let Some(old) = self.registry.take(peer) {
            let announced = old.was_announced();
            tracing::debug!(
                target: "mesh",
                peer = %peer,
                generation = old.generation(),
                "replacing stale session"
            );
            old.close().await;
            if announced {
                self.emit(MeshEvent::PeerDisconnected(peer.clone()));
            }
        }

        let generation = self.registry.next_generation();
        let events = LinkEvents::new(peer.clone(), generation, self.link_tx.clone());
        let link = self
            .links
            .connect(peer, events)
            .await
            .map_err(|err| MeshError::link(peer, err))?;
        let mut session =
            PeerSession::new(peer.clone(), generation, politeness(&self.local, peer), link);
        if open_channel {
            let created = session
                .link()
                .create_data_channel(&self.config.data_channel_label, self.config.ordered)
                .await;
            match created {
                Ok(channel) => session.set_channel(channel),
                Err(err) => {
                    session.close().await;
                    return Err(MeshError::link(peer, err));
                }
            }
        }
        let handle = self.timers.session(
            peer,
            generation,
            TimerKind::Negotiation,
            self.config.negotiation_timeout,
        );
        session.arm(TimerKind::Negotiation, handle);
        tracing::debug!(target: "mesh", peer = %peer, generation, "session created");
        self.registry.install(session);
        Ok(generation)
    }

    /// Drop a session that never became usable, without telling the application.
    pub(crate) async fn discard(&mut self, peer: &PeerId, generation: u64) {
        if let Some(session) = self.registry.take_live(peer, generation) {
            tracing::debug!(target: "mesh", peer = %peer, generation, "discarding session");
            session.close().await;
        }
    }

    /// Tear down the peer's session and report the disconnect once.
    pub(crate) async fn remove_peer(&mut self, peer: &PeerId) {
        self.dedup.forget(peer);
        self.early_candidates.remove(peer);
        let Some(session) = self.registry.take(peer) else {
            return;
        };
        let generation = session.generation();
        session.close().await;
        tracing::info!(target: "mesh", peer = %peer, generation, "peer removed");
        self.emit(MeshEvent::PeerDisconnected(peer.clone()));
    }

    async fn destroy(&mut self) {
        for session in self.registry.drain() {
            let peer = session.peer().clone();
            session.close().await;
            self.emit(MeshEvent::PeerDisconnected(peer));
        }
        self.dedup.clear();
        self.early_candidates.clear();
        self.members.clear();
        tracing::info!(target: "mesh", peer = %self.local, room = %self.room, "mesh destroyed");
    }

    pub(crate) fn hold_lock(&mut self, kind: DedupKind, peer: &PeerId, token: u64) {
        let release = self
            .timers
            .release_lock(peer, kind, token, self.config.dedup_lock_hold);
        self.dedup.hold(kind, peer, token, release);
    }

    pub(crate) fn publish(&self, envelope: &Envelope) -> MeshResult<()> {
        let payload = envelope.encode()?;
        self.bus.publish(&self.room, Bytes::from(payload))?;
        tracing::trace!(
            target: "mesh::bus",
            room = %self.room,
            kind = %envelope.kind(),
            to = ?envelope.to,
            "signaling message published"
        );
        Ok(())
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(target: "mesh", "event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use signal_bus::LocalBus;

    use super::*;
    use crate::link::MemoryNetwork;

    const ROOM: &str = "lobby";

    struct Harness {
        driver: MeshDriver,
        events: mpsc::UnboundedReceiver<MeshEvent>,
        published: broadcast::Receiver<BusMessage>,
        _link_events: mpsc::UnboundedReceiver<TaggedLinkEvent>,
        _timeouts: mpsc::UnboundedReceiver<Timeout>,
    }

    impl Harness {
        fn new(local: &str) -> Self {
            let bus = Arc::new(LocalBus::new());
            let published = bus.subscribe(ROOM);
            let net = MemoryNetwork::new();
            let (link_tx, link_events) = mpsc::unbounded_channel();
            let (timer_tx, timeouts) = mpsc::unbounded_channel();
            let (events_tx, events) = mpsc::unbounded_channel();
            let config = MeshConfig::default();
            let driver = MeshDriver {
                local: PeerId::from(local),
                room: ROOM.to_string(),
                dedup: DeduplicationGuard::new(config.fingerprint_prefix, config.fingerprint_ttl),
                config,
                bus,
                links: Arc::new(net.factory(local)),
                registry: ConnectionRegistry::new(),
                members: BTreeSet::new(),
                early_candidates: HashMap::new(),
                timers: Timers::new(timer_tx),
                link_tx,
                events: events_tx,
            };
            Self {
                driver,
                events,
                published,
                _link_events: link_events,
                _timeouts: timeouts,
            }
        }

        fn events(&mut self) -> Vec<MeshEvent> {
            let mut seen = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                seen.push(event);
            }
            seen
        }

        fn restart_offers(&mut self) -> usize {
            let mut count = 0;
            while let Ok(message) = self.published.try_recv() {
                let envelope = Envelope::decode(&message.payload).unwrap();
                if matches!(envelope.signal, Signal::Offer { ice_restart: true, .. }) {
                    count += 1;
                }
            }
            count
        }

        /// Arm a failure timer on the live session and return the firing it would post.
        fn arm_failure(&mut self, peer: &PeerId, generation: u64) -> Timeout {
            let handle = self.driver.timers.session(
                peer,
                generation,
                TimerKind::Failure,
                Duration::from_secs(5),
            );
            let seq = handle.seq();
            let session = self.driver.registry.live_mut(peer, generation).unwrap();
            session.arm(TimerKind::Failure, handle);
            Timeout::Session {
                peer: peer.clone(),
                generation,
                kind: TimerKind::Failure,
                seq,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_queued_before_removal_is_ignored() {
        let mut harness = Harness::new("a");
        let b = PeerId::from("b");
        harness.driver.create_offer(&b).await.unwrap();
        let generation = harness.driver.registry.get(&b).unwrap().generation();
        let late = harness.arm_failure(&b, generation);

        harness.driver.remove_peer(&b).await;
        harness.driver.on_timeout(late).await;

        assert_eq!(harness.events(), vec![MeshEvent::PeerDisconnected(b)]);
        assert!(harness.driver.registry.is_empty());
        assert_eq!(harness.restart_offers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_from_replaced_session_leaves_successor_alone() {
        let mut harness = Harness::new("a");
        let b = PeerId::from("b");
        harness.driver.create_offer(&b).await.unwrap();
        let first = harness.driver.registry.get(&b).unwrap().generation();
        let late = harness.arm_failure(&b, first);

        harness.driver.remove_peer(&b).await;
        harness.driver.create_offer(&b).await.unwrap();
        harness.driver.on_timeout(late).await;

        let session = harness.driver.registry.get(&b).unwrap();
        assert_ne!(session.generation(), first);
        assert!(!session.is_armed(TimerKind::Failure));
        assert!(session.is_armed(TimerKind::Negotiation));
        assert_eq!(harness.events(), vec![MeshEvent::PeerDisconnected(b)]);
        assert_eq!(harness.restart_offers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearmed_timer_ignores_earlier_firing() {
        let mut harness = Harness::new("a");
        let b = PeerId::from("b");
        harness.driver.create_offer(&b).await.unwrap();
        let generation = harness.driver.registry.get(&b).unwrap().generation();
        let superseded = harness.arm_failure(&b, generation);
        let Timeout::Session { seq: current, .. } = harness.arm_failure(&b, generation) else {
            unreachable!();
        };

        harness.driver.on_timeout(superseded).await;

        let session = harness.driver.registry.get(&b).unwrap();
        assert!(session.is_current(TimerKind::Failure, current));
        assert_eq!(session.reconnect_attempts, 0);
        assert!(harness.events().is_empty());
        assert_eq!(harness.restart_offers(), 0);
    }
}
