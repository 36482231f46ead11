use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;

use crate::{BusError, BusMessage, BusResult, SignalBus, Topics};

/// Delivery faults injected by a [`LocalBus`].
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Probability that a published message is delivered twice.
    pub duplicate: f64,
    /// Lower bound of the per-delivery delay.
    pub min_delay: Duration,
    /// Upper bound of the random per-delivery delay. Differing delays reorder messages.
    pub max_delay: Duration,
    pub seed: u64,
}

/// In-process bus for tests and single-process demos.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: Topics,
    faults: Option<(Faults, Mutex<StdRng>)>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that duplicates and delays deliveries. Publishing spawns tokio
    /// tasks for delayed copies, so it must happen inside a runtime.
    pub fn with_faults(faults: Faults) -> Self {
        let rng = StdRng::seed_from_u64(faults.seed);
        Self {
            topics: Topics::default(),
            faults: Some((faults, Mutex::new(rng))),
        }
    }

    /// Delays for each copy of one published message.
    fn schedule(&self) -> Vec<Duration> {
        let Some((faults, rng)) = &self.faults else {
            return vec![Duration::ZERO];
        };
        let mut rng = rng.lock();
        let copies = if faults.duplicate > 0.0 && rng.gen_bool(faults.duplicate.min(1.0)) {
            2
        } else {
            1
        };
        let min_ms = faults.min_delay.as_millis() as u64;
        let max_ms = (faults.max_delay.as_millis() as u64).max(min_ms);
        (0..copies)
            .map(|_| Duration::from_millis(rng.gen_range(min_ms..=max_ms)))
            .collect()
    }
}

impl SignalBus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.topics.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.topics.sender_for(topic);
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        for delay in self.schedule() {
            if delay.is_zero() {
                sender
                    .send(message.clone())
                    .map_err(|_| BusError::Closed)?;
            } else {
                let sender = sender.clone();
                let message = message.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(message);
                });
            }
        }
        Ok(())
    }
}
