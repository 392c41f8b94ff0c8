use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-node protocol counters, updated lock-free from every task.
#[derive(Debug, Default)]
pub struct GossipStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub gossip_rounds: AtomicU64,
    pub sync_rounds: AtomicU64,
    pub full_syncs: AtomicU64,
    pub entries_synced: AtomicU64,
    pub conflicts_resolved: AtomicU64,
    pub failures_detected: AtomicU64,
    pub refutations: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub gossip_rounds: u64,
    pub sync_rounds: u64,
    pub full_syncs: u64,
    pub entries_synced: u64,
    pub conflicts_resolved: u64,
    pub failures_detected: u64,
    pub refutations: u64,
}

impl GossipStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            gossip_rounds: self.gossip_rounds.load(Ordering::Relaxed),
            sync_rounds: self.sync_rounds.load(Ordering::Relaxed),
            full_syncs: self.full_syncs.load(Ordering::Relaxed),
            entries_synced: self.entries_synced.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            failures_detected: self.failures_detected.load(Ordering::Relaxed),
            refutations: self.refutations.load(Ordering::Relaxed),
        }
    }
}
