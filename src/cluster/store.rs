//! Versioned key-value state store with tombstoned deletes and
//! deterministic cross-origin conflict resolution.

use super::config::ConflictPolicy;
use super::membership::NodeId;
use super::version::VersionVector;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: Option<String>,
    pub tombstone: bool,
    pub version: u64,
    pub timestamp: f64,
    pub origin: NodeId,
}

impl StateEntry {
    /// The application-visible value. Tombstones read as absent.
    pub fn live_value(&self) -> Option<&str> {
        if self.tombstone {
            None
        } else {
            self.value.as_deref()
        }
    }
}

/// What `merge` did with an incoming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    /// Cross-origin conflict resolved by the configured policy.
    ConflictResolved { remote_won: bool },
    Unchanged,
}

#[derive(Debug)]
pub struct StateStore {
    local_id: NodeId,
    policy: ConflictPolicy,
    entries: AHashMap<String, StateEntry>,
    versions: VersionVector,
    /// Keys mutated since the last gossip round, drained for piggybacking.
    dirty: Vec<String>,
}

impl StateStore {
    pub fn new(local_id: NodeId, policy: ConflictPolicy) -> Self {
        StateStore {
            local_id,
            policy,
            entries: AHashMap::new(),
            versions: VersionVector::new(),
            dirty: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|e| e.live_value())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| !e.tombstone)
            .unwrap_or(false)
    }

    pub fn versions(&self) -> &VersionVector {
        &self.versions
    }

    /// Local write. Version is assigned from this node's vector component,
    /// so versions are monotonic per (key, origin) by construction.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>, now: f64) -> StateEntry {
        self.write_entry(key.into(), Some(value.into()), false, now)
    }

    /// Local delete: a tombstone written through the same path as `put`, so
    /// it versions and propagates like any other entry.
    pub fn delete(&mut self, key: impl Into<String>, now: f64) -> StateEntry {
        self.write_entry(key.into(), None, true, now)
    }

    fn write_entry(
        &mut self,
        key: String,
        value: Option<String>,
        tombstone: bool,
        now: f64,
    ) -> StateEntry {
        let version = self.versions.advance(&self.local_id);
        let entry = StateEntry {
            key: key.clone(),
            value,
            tombstone,
            version,
            timestamp: now,
            origin: self.local_id.clone(),
        };
        self.entries.insert(key.clone(), entry.clone());
        self.dirty.push(key);
        entry
    }

    /// Merge a replicated entry. Idempotent and commutative: re-applying an
    /// entry, or applying a set of entries in any order, converges to the
    /// same store.
    pub fn merge(&mut self, incoming: StateEntry) -> MergeOutcome {
        self.versions.observe(&incoming.origin, incoming.version);

        let outcome = match self.entries.get(&incoming.key) {
            None => {
                self.entries.insert(incoming.key.clone(), incoming.clone());
                MergeOutcome::Inserted
            }
            Some(local) if local.origin == incoming.origin => {
                if incoming.version > local.version {
                    self.entries.insert(incoming.key.clone(), incoming.clone());
                    MergeOutcome::Replaced
                } else {
                    MergeOutcome::Unchanged
                }
            }
            Some(local) => {
                let remote_won = resolve(self.policy, local, &incoming);
                if remote_won {
                    self.entries.insert(incoming.key.clone(), incoming.clone());
                }
                MergeOutcome::ConflictResolved { remote_won }
            }
        };

        match outcome {
            MergeOutcome::Inserted
            | MergeOutcome::Replaced
            | MergeOutcome::ConflictResolved { remote_won: true } => {
                self.dirty.push(incoming.key);
            }
            _ => {}
        }
        outcome
    }

    /// Drain up to `limit` distinct recently-mutated entries for gossip.
    pub fn drain_dirty(&mut self, limit: usize) -> Vec<StateEntry> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        while out.len() < limit {
            let Some(key) = self.dirty.pop() else { break };
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(entry) = self.entries.get(&key) {
                out.push(entry.clone());
            }
        }
        out
    }

    /// Entries this store holds that `remote` has not observed, judged by
    /// its version vector. Per-origin vector components cannot express
    /// per-key gaps; full sync covers what this misses.
    pub fn entries_ahead_of(&self, remote: &VersionVector) -> Vec<StateEntry> {
        self.entries
            .values()
            .filter(|e| e.version > remote.get(&e.origin))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<StateEntry> {
        let mut entries: Vec<StateEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn snapshot_refs(&self) -> impl Iterator<Item = &StateEntry> {
        self.entries.values()
    }

    pub fn live_len(&self) -> usize {
        self.entries.values().filter(|e| !e.tombstone).count()
    }

    /// Physically remove tombstones older than the retention window.
    pub fn purge_tombstones(&mut self, now: f64, retention: f64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !(e.tombstone && now - e.timestamp >= retention));
        before - self.entries.len()
    }
}

/// Deterministic cross-origin conflict resolution: does the remote entry
/// win? For any pair (a, b), resolve(a, b) and resolve(b, a) agree on the
/// same winner.
fn resolve(policy: ConflictPolicy, local: &StateEntry, remote: &StateEntry) -> bool {
    match policy {
        ConflictPolicy::LastWriteWins => {
            if remote.timestamp != local.timestamp {
                remote.timestamp > local.timestamp
            } else {
                // Documented tie-break: lexically greater origin id wins.
                remote.origin > local.origin
            }
        }
        ConflictPolicy::OriginPriority => remote.origin < local.origin,
    }
}
