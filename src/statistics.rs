//! Running counters for the `diag`/`status` REPL commands (spec §6).
//! Plain atomics rather than a metrics crate: the teacher reaches for
//! `prometheus` only at its axum-exposed `/metrics` endpoint, which this
//! node has no analogue of — the REPL is the only consumer here.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Statistics {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub hole_punches_attempted: AtomicU64,
    pub hole_punches_succeeded: AtomicU64,
    pub stun_requests: AtomicU64,
    pub turn_allocations: AtomicU64,
    pub dht_lookups: AtomicU64,
}

impl Statistics {
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_hole_punch_attempt(&self) {
        self.hole_punches_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hole_punch_success(&self) {
        self.hole_punches_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stun_request(&self) {
        self.stun_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_turn_allocation(&self) {
        self.turn_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dht_lookup(&self) {
        self.dht_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            hole_punches_attempted: self.hole_punches_attempted.load(Ordering::Relaxed),
            hole_punches_succeeded: self.hole_punches_succeeded.load(Ordering::Relaxed),
            stun_requests: self.stun_requests.load(Ordering::Relaxed),
            turn_allocations: self.turn_allocations.load(Ordering::Relaxed),
            dht_lookups: self.dht_lookups.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatisticsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub hole_punches_attempted: u64,
    pub hole_punches_succeeded: u64,
    pub stun_requests: u64,
    pub turn_allocations: u64,
    pub dht_lookups: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Statistics::default();
        stats.record_sent(100);
        stats.record_sent(50);
        stats.record_received(20);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(snapshot.bytes_sent, 150);
        assert_eq!(snapshot.packets_received, 1);
        assert_eq!(snapshot.bytes_received, 20);
    }
}
