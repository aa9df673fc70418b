//! Per-peer outbound writer tasks.
//!
//! The actor never blocks on the network: it pushes envelopes into a
//! per-peer channel and each writer task owns the connection to its
//! peer, reconnecting as needed. Protocol messages are idempotent by
//! key, so retrying an envelope that may already have arrived is safe —
//! and required, because a dropped release would stall every replica.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::SinkExt;
use lockstep_core::codec::PeerCodec;
use lockstep_core::{Envelope, NodeId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::connector::Dial;

/// Give up on a dial attempt after this long; a partitioned network can
/// leave the connect hanging rather than failing.
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Reconnect pacing for one peer link.
///
/// Tracks the consecutive-failure count itself: delays double from
/// [`Self::FLOOR`] up to [`Self::CEIL`], each smeared by a jitter factor
/// so every writer that lost the same peer does not redial in lockstep,
/// and the schedule reports when the run of failures is long enough to
/// surface the peer as unreachable. A successful dial or send resets it.
struct RetrySchedule {
    rng: StdRng,
    misses: u32,
}

impl RetrySchedule {
    const FLOOR: Duration = Duration::from_millis(50);
    const CEIL: Duration = Duration::from_secs(5);

    /// Misses in a row before the peer is reported unreachable. The
    /// writer keeps retrying past this; the flag exists for the
    /// operator.
    const UNREACHABLE_AFTER: u32 = 5;

    fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
            misses: 0,
        }
    }

    /// Record one failed attempt and return how long to wait before the
    /// next.
    fn next_delay(&mut self) -> Duration {
        self.misses = self.misses.saturating_add(1);
        let doublings = self.misses.saturating_sub(1).min(7);
        let step = Self::FLOOR.saturating_mul(1 << doublings).min(Self::CEIL);
        step.mul_f64(self.rng.random_range(0.75..1.25))
    }

    fn reset(&mut self) {
        self.misses = 0;
    }

    /// Whether the current run of failures has crossed the reporting
    /// threshold.
    fn exhausted(&self) -> bool {
        self.misses >= Self::UNREACHABLE_AFTER
    }
}

/// Handle to one peer's writer task.
#[derive(Debug, Clone)]
pub struct PeerLink {
    peer: NodeId,
    tx: mpsc::UnboundedSender<Envelope>,
    unreachable: Arc<AtomicBool>,
}

impl PeerLink {
    #[must_use]
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Queue an envelope for delivery. Never blocks.
    pub fn send(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            warn!(peer = self.peer, "writer task is gone, dropping message");
        }
    }

    /// Whether the writer has failed enough times in a row to consider
    /// the peer unreachable.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::Relaxed)
    }
}

/// Spawn the writer task for one peer.
pub fn spawn_writer<D: Dial>(dial: D, peer: NodeId, endpoint: String) -> PeerLink {
    let (tx, rx) = mpsc::unbounded_channel();
    let unreachable = Arc::new(AtomicBool::new(false));
    tokio::spawn(run_writer(
        dial,
        peer,
        endpoint,
        rx,
        Arc::clone(&unreachable),
    ));
    PeerLink {
        peer,
        tx,
        unreachable,
    }
}

async fn run_writer<D: Dial>(
    dial: D,
    peer: NodeId,
    endpoint: String,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    unreachable: Arc<AtomicBool>,
) {
    let mut retry = RetrySchedule::new();
    let mut conn: Option<Framed<D::Io, PeerCodec>> = None;

    'messages: while let Some(envelope) = rx.recv().await {
        loop {
            if conn.is_none() {
                match tokio::time::timeout(DIAL_TIMEOUT, dial.dial(&endpoint)).await {
                    Ok(Ok(io)) => {
                        trace!(peer, "connected");
                        retry.reset();
                        unreachable.store(false, Ordering::Relaxed);
                        conn = Some(Framed::new(io, PeerCodec::default()));
                    }
                    Ok(Err(err)) => {
                        back_off(peer, &endpoint, &mut retry, &unreachable, &err).await;
                        continue;
                    }
                    Err(elapsed) => {
                        back_off(peer, &endpoint, &mut retry, &unreachable, &elapsed).await;
                        continue;
                    }
                }
            }
            let Some(framed) = conn.as_mut() else {
                continue;
            };

            match framed.send(envelope.clone()).await {
                Ok(()) => {
                    retry.reset();
                    continue 'messages;
                }
                Err(err) => {
                    debug!(peer, %err, "send failed, reconnecting");
                    conn = None;
                    back_off(peer, &endpoint, &mut retry, &unreachable, &err).await;
                }
            }
        }
    }

    debug!(peer, "writer stopped");
}

/// Record a failure, flip the unreachable flag once the run is long
/// enough, and wait out the schedule's delay.
async fn back_off(
    peer: NodeId,
    endpoint: &str,
    retry: &mut RetrySchedule,
    unreachable: &AtomicBool,
    err: &(dyn std::fmt::Display + Send + Sync),
) {
    let delay = retry.next_delay();
    if retry.exhausted() && !unreachable.swap(true, Ordering::Relaxed) {
        warn!(peer, endpoint, %err, "peer unreachable, still retrying");
    } else {
        trace!(peer, %err, ?delay, "delivery attempt failed");
    }
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_toward_the_ceiling() {
        let mut retry = RetrySchedule::new();
        let mut previous = Duration::ZERO;
        for _ in 0..6 {
            let delay = retry.next_delay();
            assert!(delay > previous.mul_f64(0.5), "delays trend upward");
            assert!(delay <= RetrySchedule::CEIL.mul_f64(1.25));
            previous = delay;
        }
        // far into a failure run the delay plateaus at the ceiling
        for _ in 0..100 {
            retry.next_delay();
        }
        assert!(retry.next_delay() >= RetrySchedule::CEIL.mul_f64(0.75));
    }

    #[test]
    fn exhaustion_threshold_resets_on_success() {
        let mut retry = RetrySchedule::new();
        for _ in 0..RetrySchedule::UNREACHABLE_AFTER - 1 {
            retry.next_delay();
            assert!(!retry.exhausted());
        }
        retry.next_delay();
        assert!(retry.exhausted());

        retry.reset();
        assert!(!retry.exhausted());
        assert!(retry.next_delay() <= RetrySchedule::FLOOR.mul_f64(1.25));
    }
}
