//! Cancellable delayed work for the mesh driver.
//!
//! A timer is a spawned sleep that posts a [`Timeout`] back to the driver. The
//! [`TimerHandle`] aborts the sleep when dropped, and every session firing is
//! stamped with the generation and sequence it was armed for so that a firing
//! which raced with cancellation is recognised and ignored.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::dedup::DedupKind;
use crate::peer::PeerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Periodic liveness probe of a connected session.
    Health,
    /// Grace period after which a failed or disconnected session is judged.
    Failure,
    /// Sustained disconnection after which an ICE restart is attempted.
    Restart,
    /// Fresh session still waiting for its first connection state.
    Negotiation,
}

#[derive(Debug)]
pub enum Timeout {
    Session {
        peer: PeerId,
        generation: u64,
        kind: TimerKind,
        seq: u64,
    },
    ReleaseLock {
        peer: PeerId,
        kind: DedupKind,
        token: u64,
    },
}

#[derive(Debug)]
pub struct TimerHandle {
    seq: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone, Debug)]
pub struct Timers {
    tx: mpsc::UnboundedSender<Timeout>,
    next_seq: u64,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<Timeout>) -> Self {
        Self { tx, next_seq: 0 }
    }

    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Arm a one-shot session timer.
    pub fn session(
        &mut self,
        peer: &PeerId,
        generation: u64,
        kind: TimerKind,
        delay: Duration,
    ) -> TimerHandle {
        let seq = self.next_seq();
        let timeout = Timeout::Session {
            peer: peer.clone(),
            generation,
            kind,
            seq,
        };
        self.once(seq, delay, timeout)
    }

    /// Arm a repeating session timer whose first firing is one period away.
    pub fn session_every(
        &mut self,
        peer: &PeerId,
        generation: u64,
        kind: TimerKind,
        period: Duration,
    ) -> TimerHandle {
        let seq = self.next_seq();
        let tx = self.tx.clone();
        let peer = peer.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let fired = Timeout::Session {
                    peer: peer.clone(),
                    generation,
                    kind,
                    seq,
                };
                if tx.send(fired).is_err() {
                    break;
                }
            }
        });
        TimerHandle { seq, task }
    }

    pub fn release_lock(
        &mut self,
        peer: &PeerId,
        kind: DedupKind,
        token: u64,
        delay: Duration,
    ) -> TimerHandle {
        let seq = self.next_seq();
        let timeout = Timeout::ReleaseLock {
            peer: peer.clone(),
            kind,
            token,
        };
        self.once(seq, delay, timeout)
    }

    fn once(&self, seq: u64, delay: Duration, timeout: Timeout) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(timeout);
        });
        TimerHandle { seq, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        let peer = PeerId::new("a");
        let handle = timers.session(&peer, 4, TimerKind::Failure, Duration::from_secs(5));

        time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());
        time::sleep(Duration::from_secs(2)).await;
        match rx.try_recv() {
            Ok(Timeout::Session {
                generation, kind, seq, ..
            }) => {
                assert_eq!(generation, 4);
                assert_eq!(kind, TimerKind::Failure);
                assert_eq!(seq, handle.seq());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        let peer = PeerId::new("a");
        let handle = timers.session(&peer, 1, TimerKind::Restart, Duration::from_secs(3));
        drop(handle);
        time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_ticks_each_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        let _handle =
            timers.session_every(&PeerId::new("a"), 1, TimerKind::Health, Duration::from_secs(5));
        time::sleep(Duration::from_millis(15_500)).await;
        let mut ticks = 0;
        while rx.try_recv().is_ok() {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
    }
}
