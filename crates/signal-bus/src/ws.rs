//! Bus client for a websocket relay.
//!
//! Frames are JSON [`RelayFrame`]s in text messages. The relay forwards every
//! published frame to the other subscribers of its topic.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::{BusError, BusMessage, BusResult, SignalBus, Topics};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Join a topic. `peer` lets the relay announce our departure when the socket drops.
    Subscribe {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },
    Publish {
        topic: String,
        payload: String,
    },
}

impl RelayFrame {
    pub fn encode(&self) -> BusResult<String> {
        serde_json::to_string(self).map_err(|err| BusError::Transport(err.to_string()))
    }

    pub fn decode(text: &str) -> BusResult<Self> {
        serde_json::from_str(text).map_err(|err| BusError::Transport(err.to_string()))
    }
}

pub struct WsBus {
    peer: Option<String>,
    topics: Arc<Topics>,
    subscribed: Mutex<HashSet<String>>,
    outbound: mpsc::UnboundedSender<RelayFrame>,
    task: JoinHandle<()>,
}

impl WsBus {
    pub async fn connect(url: &str, peer: Option<String>) -> BusResult<Self> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;
        tracing::info!(target: "mesh::bus", url, "connected to relay");

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let topics = Arc::new(Topics::default());
        let inbound_topics = topics.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let text = match frame.encode() {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!(
                                    target: "mesh::bus",
                                    error = %err,
                                    "relay frame not encodable"
                                );
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            tracing::warn!(target: "mesh::bus", error = %err, "relay send failed");
                            break;
                        }
                    }
                    message = source.next() => match message {
                        Some(Ok(Message::Text(text))) => deliver(&inbound_topics, &text),
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => deliver(&inbound_topics, text),
                            Err(_) => {
                                tracing::debug!(target: "mesh::bus", "non-utf8 relay frame dropped")
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!(target: "mesh::bus", "relay closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!(
                                target: "mesh::bus",
                                error = %err,
                                "relay connection error"
                            );
                            break;
                        }
                    },
                }
            }
        });

        Ok(Self {
            peer,
            topics,
            subscribed: Mutex::new(HashSet::new()),
            outbound,
            task,
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.task.is_finished()
    }
}

fn deliver(topics: &Topics, text: &str) {
    match RelayFrame::decode(text) {
        Ok(RelayFrame::Publish { topic, payload }) => {
            if !topics.is_known(&topic) {
                return;
            }
            topics.deliver(BusMessage {
                topic,
                payload: Bytes::from(payload),
            });
        }
        Ok(RelayFrame::Subscribe { .. }) => {}
        Err(err) => {
            tracing::debug!(target: "mesh::bus", error = %err, "malformed relay frame dropped")
        }
    }
}

impl SignalBus for WsBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        let receiver = self.topics.sender_for(topic).subscribe();
        if self.subscribed.lock().insert(topic.to_string()) {
            let frame = RelayFrame::Subscribe {
                topic: topic.to_string(),
                peer: self.peer.clone(),
            };
            if self.outbound.send(frame).is_err() {
                tracing::warn!(
                    target: "mesh::bus",
                    topic,
                    "subscribe after relay connection closed"
                );
            }
        }
        receiver
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let payload = String::from_utf8(payload.to_vec())
            .map_err(|_| BusError::Transport("payload is not utf-8".into()))?;
        self.outbound
            .send(RelayFrame::Publish {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| BusError::Closed)
    }
}

impl Drop for WsBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}
