use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use room_mesh::{
    Envelope, IceCandidate, MeshConfig, MeshError, MeshEvent, MemoryNetwork, Participant, PeerId,
    RoomMesh, SessionDescription, Signal,
};
use signal_bus::{BusMessage, Faults, LocalBus, SignalBus};
use test_timeout::tokio_timeout_test;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;

const ROOM: &str = "lobby";

struct Node {
    id: PeerId,
    mesh: RoomMesh,
    events: mpsc::UnboundedReceiver<MeshEvent>,
}

impl Node {
    fn spawn(bus: &Arc<LocalBus>, net: &MemoryNetwork, id: &str, config: MeshConfig) -> Self {
        let id = PeerId::from(id);
        let (mesh, events) = RoomMesh::spawn(
            id.clone(),
            ROOM,
            bus.clone(),
            Arc::new(net.factory(id.clone())),
            config,
        );
        Self { id, mesh, events }
    }

    fn drain(&mut self) -> Vec<MeshEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("MESH_LOG_FILTER"))
        .with_test_writer()
        .try_init();
}

fn peer(id: &str) -> PeerId {
    PeerId::from(id)
}

async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

fn disconnects(events: &[MeshEvent], from: &PeerId) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, MeshEvent::PeerDisconnected(p) if p == from))
        .count()
}

/// Signaling messages seen on the room topic so far.
fn observed(rx: &mut broadcast::Receiver<BusMessage>) -> Vec<Envelope> {
    let mut seen = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Ok(envelope) = Envelope::decode(&message.payload) {
            seen.push(envelope);
        }
    }
    seen
}

/// Bring up `a` first, then have `b` join with `a` as an existing participant.
async fn connected_pair(
    bus: &Arc<LocalBus>,
    net: &MemoryNetwork,
    config: MeshConfig,
) -> (Node, Node) {
    let a = Node::spawn(bus, net, "a", config.clone());
    let b = Node::spawn(bus, net, "b", config);
    b.mesh.join(vec![Participant::new("a")]).await.unwrap();
    settle().await;
    (a, b)
}

#[tokio_timeout_test(10, paused)]
async fn smaller_id_initiates_regardless_of_join_order() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let (mut a, mut b) = connected_pair(&bus, &net, MeshConfig::default()).await;

    let records = net.negotiations(&a.id, &b.id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].offerer, a.id);
    assert!(records[0].connected);

    let a_events = a.drain();
    let b_events = b.drain();
    assert!(a_events.contains(&MeshEvent::PeerConnected(peer("b"))));
    assert!(a_events.contains(&MeshEvent::DataChannelOpen(peer("b"))));
    assert!(b_events.contains(&MeshEvent::PeerConnected(peer("a"))));
    assert!(b_events.contains(&MeshEvent::DataChannelOpen(peer("a"))));
    assert_eq!(a.mesh.members().await, vec![peer("b")]);
    assert_eq!(b.mesh.members().await, vec![peer("a")]);
}

#[tokio_timeout_test(10, paused)]
async fn larger_id_waits_for_join_before_being_offered() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let b = Node::spawn(&bus, &net, "b", MeshConfig::default());
    let a = Node::spawn(&bus, &net, "a", MeshConfig::default());

    a.mesh.join(vec![Participant::new("b")]).await.unwrap();
    settle().await;

    let records = net.negotiations(&a.id, &b.id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].offerer, a.id);
    assert_eq!(a.mesh.connected_peers().await, vec![peer("b")]);
    assert_eq!(b.mesh.connected_peers().await, vec![peer("a")]);
}

#[tokio_timeout_test(10, paused)]
async fn retransmitted_offer_is_answered_once() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let mut watch = bus.subscribe(ROOM);
    let a = Node::spawn(&bus, &net, "a", MeshConfig::default());
    let b = Node::spawn(&bus, &net, "b", MeshConfig::default());

    a.mesh.create_offer("b").await.unwrap();
    settle().await;

    let mut offer_payload = None;
    while let Ok(message) = watch.try_recv() {
        let envelope = Envelope::decode(&message.payload).unwrap();
        if matches!(envelope.signal, Signal::Offer { .. }) {
            offer_payload = Some(message.payload);
        }
    }
    let offer_payload = offer_payload.expect("offer published");

    // Immediate retransmissions hit the processing lock, later ones the fingerprint.
    bus.publish(ROOM, offer_payload.clone()).unwrap();
    bus.publish(ROOM, offer_payload.clone()).unwrap();
    sleep(Duration::from_secs(3)).await;
    bus.publish(ROOM, offer_payload).unwrap();
    settle().await;

    let answers_from_b = observed(&mut watch)
        .into_iter()
        .filter(|envelope| {
            envelope.from == b.id && matches!(envelope.signal, Signal::Answer { .. })
        })
        .count();
    assert_eq!(answers_from_b, 0, "retransmissions must not be answered again");
    assert_eq!(net.negotiations(&a.id, &b.id).len(), 1);
    assert_eq!(net.established(&a.id, &b.id), 1);
}

#[tokio_timeout_test(10, paused)]
async fn duplicating_bus_still_yields_one_negotiation() {
    let bus = Arc::new(LocalBus::with_faults(Faults {
        duplicate: 1.0,
        seed: 3,
        ..Default::default()
    }));
    let net = MemoryNetwork::new();
    let (mut a, mut b) = connected_pair(&bus, &net, MeshConfig::default()).await;

    assert_eq!(net.negotiations(&a.id, &b.id).len(), 1);
    let connected = a
        .drain()
        .into_iter()
        .filter(|event| matches!(event, MeshEvent::PeerConnected(_)))
        .count();
    assert_eq!(connected, 1);
    let connected = b
        .drain()
        .into_iter()
        .filter(|event| matches!(event, MeshEvent::PeerConnected(_)))
        .count();
    assert_eq!(connected, 1);
}

#[tokio_timeout_test(10, paused)]
async fn simultaneous_offers_converge_on_one_link() {
    let bus = Arc::new(LocalBus::with_faults(Faults {
        min_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(100),
        seed: 1,
        ..Default::default()
    }));
    let net = MemoryNetwork::new();
    let a = Node::spawn(&bus, &net, "a", MeshConfig::default());
    let b = Node::spawn(&bus, &net, "b", MeshConfig::default());

    let (from_a, from_b) = tokio::join!(a.mesh.create_offer("b"), b.mesh.create_offer("a"));
    from_a.unwrap();
    from_b.unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(net.established(&a.id, &b.id), 1);
    assert_eq!(net.established(&b.id, &a.id), 1);
    let records = net.negotiations(&a.id, &b.id);
    assert_eq!(records.len(), 1);
    // The polite side yields and answers the impolite side's offer.
    assert_eq!(records[0].offerer, b.id);
    assert_eq!(a.mesh.connected_peers().await, vec![peer("b")]);
    assert_eq!(b.mesh.connected_peers().await, vec![peer("a")]);
}

#[tokio_timeout_test(10, paused)]
async fn answer_without_outstanding_offer_is_discarded() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let (mut a, _b) = connected_pair(&bus, &net, MeshConfig::default()).await;
    a.drain();

    a.mesh
        .handle_answer("b", SessionDescription::answer("v=0 memory-answer token=o999"))
        .await
        .unwrap();
    a.mesh
        .handle_answer("zed", SessionDescription::answer("v=0 memory-answer token=o998"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(net.negotiations(&a.id, &peer("b")).len(), 1);
    assert_eq!(net.established(&a.id, &peer("b")), 1);
    assert!(a.drain().is_empty());
    assert!(a.mesh.send_to_peer("b", Bytes::from_static(b"still here")).await);
}

#[tokio_timeout_test(10, paused)]
async fn send_before_and_after_channel_opens() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let mut p0 = Node::spawn(&bus, &net, "p0", MeshConfig::default());
    let mut p1 = Node::spawn(&bus, &net, "p1", MeshConfig::default());
    let message = Bytes::from_static(br#"{"type":"chat","text":"hi"}"#);

    assert!(!p0.mesh.send_to_peer("p1", message.clone()).await);

    p1.mesh.join(vec![Participant::new("p0")]).await.unwrap();
    settle().await;
    assert!(p0.drain().contains(&MeshEvent::DataChannelOpen(peer("p1"))));
    p1.drain();

    assert!(p0.mesh.send_to_peer("p1", message.clone()).await);
    settle().await;

    assert_eq!(
        p1.drain(),
        vec![MeshEvent::DataReceived {
            peer: peer("p0"),
            data: message,
        }]
    );
}

#[tokio_timeout_test(10, paused)]
async fn broadcast_reaches_every_open_channel() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let a = Node::spawn(&bus, &net, "a", MeshConfig::default());
    let mut b = Node::spawn(&bus, &net, "b", MeshConfig::default());
    let mut c = Node::spawn(&bus, &net, "c", MeshConfig::default());
    b.mesh.join(vec![Participant::new("a")]).await.unwrap();
    settle().await;
    c.mesh
        .join(vec![Participant::new("a"), Participant::new("b")])
        .await
        .unwrap();
    settle().await;
    b.drain();
    c.drain();

    assert_eq!(a.mesh.send_to_all(Bytes::from_static(b"hello")).await, 2);
    settle().await;

    for node in [&mut b, &mut c] {
        assert_eq!(
            node.drain(),
            vec![MeshEvent::DataReceived {
                peer: peer("a"),
                data: Bytes::from_static(b"hello"),
            }]
        );
    }
}

#[tokio_timeout_test(30, paused)]
async fn partitioned_peer_is_evicted_after_restart_budget() {
    init_tracing();
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let mut watch = bus.subscribe(ROOM);
    let (mut a, mut b) = connected_pair(&bus, &net, MeshConfig::default()).await;
    a.drain();
    b.drain();
    observed(&mut watch);

    net.partition(&a.id, &b.id);
    sleep(Duration::from_secs(14)).await;
    assert_eq!(disconnects(&a.drain(), &b.id), 0);

    sleep(Duration::from_secs(46)).await;
    assert_eq!(disconnects(&a.drain(), &b.id), 1);
    assert_eq!(disconnects(&b.drain(), &a.id), 1);

    let restarts_from_a = observed(&mut watch)
        .into_iter()
        .filter(|envelope| {
            envelope.from == a.id
                && matches!(envelope.signal, Signal::Offer { ice_restart: true, .. })
        })
        .count();
    assert_eq!(restarts_from_a, 3);
    assert!(a.mesh.connected_peers().await.is_empty());
}

#[tokio_timeout_test(30, paused)]
async fn flapping_link_recovers_with_ice_restart() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let (mut a, mut b) = connected_pair(&bus, &net, MeshConfig::default()).await;
    a.drain();
    b.drain();

    net.flap(&a.id, &b.id);
    sleep(Duration::from_secs(20)).await;

    assert_eq!(disconnects(&a.drain(), &b.id), 0);
    assert_eq!(disconnects(&b.drain(), &a.id), 0);
    assert_eq!(net.established(&a.id, &b.id), 1);
    assert!(
        net.negotiations(&a.id, &b.id)
            .iter()
            .any(|record| record.ice_restart && record.connected)
    );
}

#[tokio_timeout_test(30, paused)]
async fn open_channel_outlives_disconnected_link() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let config = MeshConfig::default().with_max_reconnect_attempts(0);
    let (mut a, _b) = connected_pair(&bus, &net, config).await;
    a.drain();

    net.flap(&a.id, &peer("b"));
    sleep(Duration::from_secs(30)).await;

    assert_eq!(disconnects(&a.drain(), &peer("b")), 0);
    assert_eq!(a.mesh.connected_peers().await, vec![peer("b")]);
    assert!(a.mesh.send_to_peer("b", Bytes::from_static(b"ping")).await);
}

#[tokio_timeout_test(30, paused)]
async fn removed_peer_is_reported_once() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let (mut a, _b) = connected_pair(&bus, &net, MeshConfig::default()).await;
    a.drain();

    a.mesh.remove_peer("b").await;
    a.mesh.remove_peer("b").await;
    assert!(!a.mesh.members().await.contains(&peer("b")));
    sleep(Duration::from_secs(30)).await;

    assert_eq!(disconnects(&a.drain(), &peer("b")), 1);
}

#[tokio_timeout_test(10, paused)]
async fn leave_disconnects_remaining_peers() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let (mut a, mut b) = connected_pair(&bus, &net, MeshConfig::default()).await;
    a.drain();
    b.drain();

    b.mesh.leave().await.unwrap();
    settle().await;

    assert_eq!(disconnects(&a.drain(), &b.id), 1);
    assert_eq!(disconnects(&b.drain(), &a.id), 1);
    assert!(a.mesh.members().await.is_empty());
    assert!(a.mesh.connected_peers().await.is_empty());

    assert!(matches!(b.mesh.create_offer("a").await, Err(MeshError::Closed)));
    assert!(!b.mesh.send_to_peer("a", Bytes::from_static(b"late")).await);
}

#[tokio_timeout_test(10, paused)]
async fn destroy_reports_every_session() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let mut a = Node::spawn(&bus, &net, "a", MeshConfig::default());
    let _b = Node::spawn(&bus, &net, "b", MeshConfig::default());
    let _c = Node::spawn(&bus, &net, "c", MeshConfig::default());
    a.mesh
        .join(vec![Participant::new("b"), Participant::new("c")])
        .await
        .unwrap();
    settle().await;
    a.drain();

    a.mesh.destroy().await;
    let mut gone: Vec<PeerId> = a
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            MeshEvent::PeerDisconnected(peer) => Some(peer),
            _ => None,
        })
        .collect();
    gone.sort();
    assert_eq!(gone, vec![peer("b"), peer("c")]);
    assert_eq!(a.mesh.send_to_all(Bytes::from_static(b"late")).await, 0);
}

#[tokio_timeout_test(10, paused)]
async fn repeated_join_does_not_renegotiate() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let (a, b) = connected_pair(&bus, &net, MeshConfig::default()).await;

    let rejoin = Envelope::broadcast(ROOM, b.id.clone(), Signal::Join { existing: vec![] });
    a.mesh.handle_envelope(rejoin).await.unwrap();
    settle().await;

    assert_eq!(net.negotiations(&a.id, &b.id).len(), 1);
    assert_eq!(net.established(&a.id, &b.id), 1);
}

#[tokio_timeout_test(10, paused)]
async fn misaddressed_messages_are_ignored() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let a = Node::spawn(&bus, &net, "a", MeshConfig::default());

    let elsewhere = Envelope::broadcast("other-room", peer("b"), Signal::Join { existing: vec![] });
    a.mesh.handle_envelope(elsewhere).await.unwrap();
    let not_for_us = Envelope::unicast(
        ROOM,
        peer("b"),
        peer("c"),
        Signal::Offer {
            description: SessionDescription::offer("v=0 memory-offer token=o1"),
            ice_restart: false,
        },
    );
    a.mesh.handle_envelope(not_for_us).await.unwrap();
    let from_self = Envelope::broadcast(ROOM, peer("a"), Signal::Leave);
    a.mesh.handle_envelope(from_self).await.unwrap();

    assert!(a.mesh.members().await.is_empty());
    assert!(net.negotiations(&a.id, &peer("b")).is_empty());
}

#[tokio_timeout_test(10, paused)]
async fn refused_link_surfaces_as_error() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let a = Node::spawn(&bus, &net, "a", MeshConfig::default());
    net.refuse_links_from(&a.id);

    let err = a.mesh.create_offer("b").await.unwrap_err();
    assert!(matches!(err, MeshError::Link { .. }));
    assert!(a.mesh.connected_peers().await.is_empty());
}

#[tokio_timeout_test(20, paused)]
async fn three_peers_converge_over_lossy_bus() {
    init_tracing();
    let bus = Arc::new(LocalBus::with_faults(Faults {
        duplicate: 0.3,
        max_delay: Duration::from_millis(300),
        seed: 11,
        ..Default::default()
    }));
    let net = MemoryNetwork::new();
    let a = Node::spawn(&bus, &net, "a", MeshConfig::default());
    let b = Node::spawn(&bus, &net, "b", MeshConfig::default());
    let c = Node::spawn(&bus, &net, "c", MeshConfig::default());

    b.mesh.join(vec![Participant::new("a")]).await.unwrap();
    sleep(Duration::from_secs(2)).await;
    c.mesh
        .join(vec![Participant::new("a"), Participant::new("b")])
        .await
        .unwrap();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(a.mesh.connected_peers().await, vec![peer("b"), peer("c")]);
    assert_eq!(b.mesh.connected_peers().await, vec![peer("a"), peer("c")]);
    assert_eq!(c.mesh.connected_peers().await, vec![peer("a"), peer("b")]);
    for (x, y) in [(&a.id, &b.id), (&a.id, &c.id), (&b.id, &c.id)] {
        assert_eq!(net.established(x, y), 1, "{x} -> {y}");
        assert_eq!(net.negotiations(x, y).len(), 1, "{x} <-> {y}");
    }
}

fn offers_from(envelopes: &[Envelope], from: &PeerId) -> usize {
    envelopes
        .iter()
        .filter(|envelope| {
            &envelope.from == from && matches!(envelope.signal, Signal::Offer { .. })
        })
        .count()
}

#[tokio_timeout_test(10, paused)]
async fn lost_offer_is_sent_again() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let mut a = Node::spawn(&bus, &net, "a", MeshConfig::default());
    a.mesh.create_offer("b").await.unwrap();
    settle().await;

    let mut b = Node::spawn(&bus, &net, "b", MeshConfig::default());
    a.mesh.create_offer("b").await.unwrap();
    settle().await;
    assert_eq!(net.established(&a.id, &b.id), 0);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(net.established(&a.id, &b.id), 1);
    assert_eq!(net.established(&b.id, &a.id), 1);
    assert_eq!(net.negotiations(&a.id, &b.id).len(), 1);
    assert!(a.drain().contains(&MeshEvent::PeerConnected(peer("b"))));
    assert!(b.drain().contains(&MeshEvent::PeerConnected(peer("a"))));
}

#[tokio_timeout_test(10, paused)]
async fn unanswered_offers_stop_after_budget() {
    let bus = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let mut watch = bus.subscribe(ROOM);
    let mut a = Node::spawn(&bus, &net, "a", MeshConfig::default());

    a.mesh.create_offer("b").await.unwrap();
    sleep(Duration::from_secs(60)).await;
    // The first offer plus one per reconnect attempt, then the session is dropped.
    assert_eq!(offers_from(&observed(&mut watch), &a.id), 4);
    assert!(a.drain().is_empty());

    a.mesh.create_offer("b").await.unwrap();
    settle().await;
    assert_eq!(offers_from(&observed(&mut watch), &a.id), 1);
}

#[tokio_timeout_test(10, paused)]
async fn candidates_before_descriptions_are_applied_after() {
    let bus_a = Arc::new(LocalBus::new());
    let bus_b = Arc::new(LocalBus::new());
    let net = MemoryNetwork::new();
    let mut watch_a = bus_a.subscribe(ROOM);
    let mut watch_b = bus_b.subscribe(ROOM);
    let a = Node::spawn(&bus_a, &net, "a", MeshConfig::default());
    let mut b = Node::spawn(&bus_b, &net, "b", MeshConfig::default());

    a.mesh.create_offer("b").await.unwrap();
    settle().await;
    let (a_candidates, a_offer): (Vec<_>, Vec<_>) = observed(&mut watch_a)
        .into_iter()
        .filter(|envelope| envelope.from == a.id)
        .partition(|envelope| matches!(envelope.signal, Signal::Ice { .. }));
    assert!(!a_candidates.is_empty());
    assert_eq!(a_offer.len(), 1);

    // A trailing candidate from an earlier link to `a` must not reach the new one.
    let trailing = Envelope::unicast(
        ROOM,
        a.id.clone(),
        b.id.clone(),
        Signal::Ice {
            candidate: IceCandidate {
                candidate: "candidate:0 1 udp 2130706431 memory 0 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: Some("stale".into()),
            },
        },
    );
    b.mesh.handle_envelope(trailing).await.unwrap();
    for envelope in a_candidates.into_iter().chain(a_offer) {
        b.mesh.handle_envelope(envelope).await.unwrap();
    }
    settle().await;
    assert_eq!(net.candidates_applied(&b.id, &a.id), 1);

    let (b_candidates, b_answer): (Vec<_>, Vec<_>) = observed(&mut watch_b)
        .into_iter()
        .filter(|envelope| envelope.from == b.id)
        .partition(|envelope| matches!(envelope.signal, Signal::Ice { .. }));
    assert!(!b_candidates.is_empty());
    assert_eq!(b_answer.len(), 1);
    for envelope in b_candidates.into_iter().chain(b_answer) {
        a.mesh.handle_envelope(envelope).await.unwrap();
    }
    settle().await;

    assert_eq!(net.candidates_applied(&a.id, &b.id), 1);
    assert_eq!(net.established(&a.id, &b.id), 1);
    assert_eq!(net.established(&b.id, &a.id), 1);
    let opened = b
        .drain()
        .into_iter()
        .filter(|event| matches!(event, MeshEvent::DataChannelOpen(_)))
        .count();
    assert_eq!(opened, 1);
}
