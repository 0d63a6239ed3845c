use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Liveness bookkeeping shared between the read loop and the keepalive loop of one session.
///
/// The read loop marks activity on every inbound frame; the keepalive loop checks staleness
/// before sending each ping. Timestamps are stored as milliseconds since the session opened
/// so both loops can share the state without a lock.
#[derive(Debug)]
pub struct KeepAlive {
    opened: Instant,
    interval: Duration,
    timeout: Duration,
    last_activity_ms: AtomicU64,
    pings_sent: AtomicU64,
}

impl KeepAlive {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            opened: Instant::now(),
            interval,
            timeout,
            last_activity_ms: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
        }
    }

    #[inline]
    fn now_ms(&self) -> u64 {
        self.opened.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    #[inline]
    pub fn record_activity(&self) {
        self.last_activity_ms.store(self.now_ms(), Ordering::Release);
    }

    pub fn record_ping(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or since open, when nothing arrived yet).
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// No inbound activity within the read-timeout window.
    pub fn is_stale(&self) -> bool {
        self.idle_for() > self.timeout
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
