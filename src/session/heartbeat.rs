//! Heartbeat bookkeeping, shared between the sender task (due-checks,
//! sends) and the receiver task (acks) through atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Fraction of the interval used as the default safety margin.
const DEFAULT_MARGIN_DIVISOR: u32 = 8;

pub struct HeartbeatState {
    epoch: Instant,
    interval_ms: AtomicU64,
    margin_ms: AtomicU64,
    /// Milliseconds since `epoch`; zero means "never".
    last_sent_ms: AtomicU64,
    last_ack_ms: AtomicU64,
    last_sent_nonce: AtomicU64,
    last_received_nonce: AtomicU64,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            interval_ms: AtomicU64::new(0),
            margin_ms: AtomicU64::new(0),
            last_sent_ms: AtomicU64::new(0),
            last_ack_ms: AtomicU64::new(0),
            last_sent_nonce: AtomicU64::new(0),
            last_received_nonce: AtomicU64::new(0),
        }
    }

    /// Applies the interval announced by Hello. The effective margin is
    /// clamped to `[0, interval / 2]`; `None` means an eighth of the
    /// interval. Resets the liveness window for the fresh connection.
    pub fn configure(&self, interval: Duration, margin: Option<Duration>) {
        let interval_ms = interval.as_millis() as u64;
        let margin_ms = margin
            .map(|m| m.as_millis() as u64)
            .unwrap_or(interval_ms / DEFAULT_MARGIN_DIVISOR as u64)
            .min(interval_ms / 2);
        self.interval_ms.store(interval_ms, Ordering::Relaxed);
        self.margin_ms.store(margin_ms, Ordering::Relaxed);
        self.last_sent_ms.store(0, Ordering::Relaxed);
        self.last_ack_ms.store(0, Ordering::Relaxed);
    }

    fn now_ms(&self) -> u64 {
        // Never zero, so zero can mean "never".
        (self.epoch.elapsed().as_millis() as u64).max(1)
    }

    /// A heartbeat is due once `interval - margin` has passed since the
    /// last send. The very first beat after [`Self::configure`] is due
    /// immediately.
    pub fn is_due(&self) -> bool {
        let interval = self.interval_ms.load(Ordering::Relaxed);
        if interval == 0 {
            return false;
        }
        let last_sent = self.last_sent_ms.load(Ordering::Relaxed);
        if last_sent == 0 {
            return true;
        }
        let margin = self.margin_ms.load(Ordering::Relaxed);
        self.now_ms().saturating_sub(last_sent) >= interval - margin
    }

    pub fn time_until_due(&self) -> Duration {
        let interval = self.interval_ms.load(Ordering::Relaxed);
        if interval == 0 {
            return Duration::MAX;
        }
        let last_sent = self.last_sent_ms.load(Ordering::Relaxed);
        if last_sent == 0 {
            return Duration::ZERO;
        }
        let margin = self.margin_ms.load(Ordering::Relaxed);
        let due_at = last_sent + (interval - margin);
        Duration::from_millis(due_at.saturating_sub(self.now_ms()))
    }

    /// Liveness invariant checked before each send: the previous beat must
    /// have been acked.
    pub fn ack_is_current(&self) -> bool {
        self.last_ack_ms.load(Ordering::Relaxed) >= self.last_sent_ms.load(Ordering::Relaxed)
    }

    pub fn record_send(&self, nonce: u64) {
        self.last_sent_nonce.store(nonce, Ordering::Relaxed);
        self.last_sent_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn record_ack(&self, nonce: u64) {
        self.last_received_nonce.store(nonce, Ordering::Relaxed);
        self.last_ack_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// True when the peer echoed our nonce — or echoed zero, which the peer
    /// is known to do; strict enforcement is the caller's opt-in.
    pub fn nonce_ok(&self) -> bool {
        let received = self.last_received_nonce.load(Ordering::Relaxed);
        received == 0 || received == self.last_sent_nonce.load(Ordering::Relaxed)
    }

    /// Send→ack delay of the most recent completed beat.
    pub fn latency(&self) -> Option<Duration> {
        let sent = self.last_sent_ms.load(Ordering::Relaxed);
        let acked = self.last_ack_ms.load(Ordering::Relaxed);
        if sent == 0 || acked < sent {
            return None;
        }
        Some(Duration::from_millis(acked - sent))
    }
}
