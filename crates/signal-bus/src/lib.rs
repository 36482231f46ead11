//! Topic pub/sub used to carry signaling between participants.
//!
//! Delivery is best effort: messages may be duplicated, delayed, reordered or
//! lost, and nothing is delivered to a subscriber that has gone away.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

mod local;
mod ws;

pub use local::{Faults, LocalBus};
pub use ws::{RelayFrame, WsBus};

/// Per-topic subscriber buffer.
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait SignalBus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// Local fan-out table shared by the bus implementations.
#[derive(Debug, Default)]
struct Topics {
    senders: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Topics {
    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.senders.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.senders.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn is_known(&self, topic: &str) -> bool {
        self.senders.read().contains_key(topic)
    }

    /// Hand a message to current subscribers. Returns how many received it.
    fn deliver(&self, message: BusMessage) -> usize {
        let sender = self.senders.read().get(&message.topic).cloned();
        match sender {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }
}
