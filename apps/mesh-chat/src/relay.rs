//! Websocket relay that carries mesh signaling between participants.
//!
//! Every connection subscribes to topics (one per room) and publishes frames
//! that are fanned out to the topic's other subscribers. When a socket that
//! named its peer goes away, the relay publishes a leave message on its behalf.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use room_mesh::{Envelope, PeerId, Signal};
use signal_bus::RelayFrame;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct Subscriber {
    peer: Option<String>,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Clone, Default)]
pub struct RelayState {
    /// topic -> (connection id -> subscriber)
    topics: Arc<DashMap<String, DashMap<u64, Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayState {
    fn connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn subscribe(
        &self,
        id: u64,
        topic: String,
        peer: Option<String>,
        tx: mpsc::UnboundedSender<String>,
    ) {
        debug!(id, topic = %topic, peer = ?peer, "subscribed");
        self.topics
            .entry(topic)
            .or_default()
            .insert(id, Subscriber { peer, tx });
    }

    /// Forward a frame to every other subscriber of `topic`. Returns the fan-out.
    fn publish(&self, from: u64, topic: &str, text: &str) -> usize {
        let Some(subscribers) = self.topics.get(topic) else {
            return 0;
        };
        subscribers
            .iter()
            .filter(|entry| *entry.key() != from)
            .filter(|entry| entry.value().tx.send(text.to_owned()).is_ok())
            .count()
    }

    /// Drop a connection from every topic and announce its departure.
    fn disconnect(&self, id: u64) {
        let mut departures = Vec::new();
        for topic in self.topics.iter() {
            if let Some((_, subscriber)) = topic.value().remove(&id) {
                if let Some(peer) = subscriber.peer {
                    departures.push((topic.key().clone(), peer));
                }
            }
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());

        for (topic, peer) in departures {
            match leave_frame(&topic, &peer) {
                Some(text) => {
                    let notified = self.publish(id, &topic, &text);
                    info!(topic = %topic, peer = %peer, notified, "peer dropped, leave announced");
                }
                None => warn!(topic = %topic, peer = %peer, "could not build leave message"),
            }
        }
    }
}

fn leave_frame(topic: &str, peer: &str) -> Option<String> {
    let envelope = Envelope::broadcast(topic, PeerId::from(peer), Signal::Leave);
    let payload = String::from_utf8(envelope.encode().ok()?).ok()?;
    RelayFrame::Publish {
        topic: topic.to_owned(),
        payload,
    }
    .encode()
    .ok()
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

pub async fn serve(listen: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "relay listening");
    axum::serve(listener, router(RelayState::default())).await?;
    Ok(())
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let id = state.connection_id();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(id, "relay writer ended");
    });

    debug!(id, "relay connection opened");
    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(id, "non-utf8 frame ignored");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(id, error = %err, "relay socket error");
                break;
            }
        };
        match RelayFrame::decode(&text) {
            Ok(RelayFrame::Subscribe { topic, peer }) => {
                state.subscribe(id, topic, peer, tx.clone());
            }
            Ok(RelayFrame::Publish { topic, .. }) => {
                let fanout = state.publish(id, &topic, &text);
                debug!(id, topic = %topic, fanout, "frame relayed");
            }
            Err(err) => debug!(id, error = %err, "malformed frame ignored"),
        }
    }

    state.disconnect(id);
    writer.abort();
    debug!(id, "relay connection closed");
}
