//! Process-wide counters for the link and delivery layers.
//! Cheap atomics; read them all at once with [`snapshot`].
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static RELIABLE_SENT: AtomicU64 = AtomicU64::new(0);
static RELIABLE_ACKED: AtomicU64 = AtomicU64::new(0);
static RELIABLE_FAILED: AtomicU64 = AtomicU64::new(0);
static RELIABLE_RETRIES: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);
static DUPLICATES_SUPPRESSED: AtomicU64 = AtomicU64::new(0);
static FRAMES_DISCARDED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_ABANDONED: AtomicU64 = AtomicU64::new(0);
static LINK_RESTARTS: AtomicU64 = AtomicU64::new(0);

pub fn inc_reliable_sent() {
    RELIABLE_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reliable_acked() {
    RELIABLE_ACKED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reliable_failed() {
    RELIABLE_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reliable_retries() {
    RELIABLE_RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_ack_latency(latency: Duration) {
    ACK_LATENCY_SUM_MS.fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicates_suppressed() {
    DUPLICATES_SUPPRESSED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_frames_discarded() {
    FRAMES_DISCARDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sessions_abandoned() {
    SESSIONS_ABANDONED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_link_restarts() {
    LINK_RESTARTS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub reliable_sent: u64,
    pub reliable_acked: u64,
    pub reliable_failed: u64,
    pub reliable_retries: u64,
    pub ack_latency_avg_ms: Option<u64>,
    pub duplicates_suppressed: u64,
    pub frames_discarded: u64,
    pub sessions_abandoned: u64,
    pub link_restarts: u64,
}

pub fn snapshot() -> Snapshot {
    let sum = ACK_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        reliable_sent: RELIABLE_SENT.load(Ordering::Relaxed),
        reliable_acked: RELIABLE_ACKED.load(Ordering::Relaxed),
        reliable_failed: RELIABLE_FAILED.load(Ordering::Relaxed),
        reliable_retries: RELIABLE_RETRIES.load(Ordering::Relaxed),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
        duplicates_suppressed: DUPLICATES_SUPPRESSED.load(Ordering::Relaxed),
        frames_discarded: FRAMES_DISCARDED.load(Ordering::Relaxed),
        sessions_abandoned: SESSIONS_ABANDONED.load(Ordering::Relaxed),
        link_restarts: LINK_RESTARTS.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are global; assert on deltas so parallel tests don't interfere.
    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        inc_duplicates_suppressed();
        inc_frames_discarded();
        observe_ack_latency(Duration::from_millis(1500));
        let after = snapshot();
        assert!(after.duplicates_suppressed > before.duplicates_suppressed);
        assert!(after.frames_discarded > before.frames_discarded);
        assert!(after.ack_latency_avg_ms.is_some());
    }
}
