//! Anti-entropy reconciliation: classifying and applying the difference
//! between a local store and a peer's snapshot.
//!
//! Gossip alone eventually converges, but a full snapshot exchange bounds
//! the time-to-convergence after missed rounds or a partition. The diff is
//! computed for observability; application goes through the same merge
//! rules as gossip, so a sync round is idempotent.

use super::store::{MergeOutcome, StateEntry, StateStore};

#[derive(Debug, Default)]
pub struct StateDiff {
    /// Present only on the remote side.
    pub missing: Vec<StateEntry>,
    /// Same origin, remote version is higher.
    pub outdated: Vec<StateEntry>,
    /// Same key claimed by a different origin; resolved by policy.
    pub conflicting: Vec<StateEntry>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.outdated.is_empty() && self.conflicting.is_empty()
    }

    pub fn len(&self) -> usize {
        self.missing.len() + self.outdated.len() + self.conflicting.len()
    }
}

/// Result of applying one sync payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub entries_applied: usize,
    pub conflicts_resolved: usize,
}

pub fn compute_diff(store: &StateStore, remote_entries: &[StateEntry]) -> StateDiff {
    let mut diff = StateDiff::default();
    let local: std::collections::HashMap<&str, &StateEntry> = store
        .snapshot_refs()
        .map(|e| (e.key.as_str(), e))
        .collect();

    for remote in remote_entries {
        match local.get(remote.key.as_str()) {
            None => diff.missing.push(remote.clone()),
            Some(existing) if existing.origin == remote.origin => {
                if remote.version > existing.version {
                    diff.outdated.push(remote.clone());
                }
            }
            Some(_) => diff.conflicting.push(remote.clone()),
        }
    }
    diff
}

/// Apply a batch of replicated entries through the merge rules, counting
/// what actually changed.
pub fn apply_entries(store: &mut StateStore, entries: Vec<StateEntry>) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();
    for entry in entries {
        match store.merge(entry) {
            MergeOutcome::Inserted | MergeOutcome::Replaced => {
                outcome.entries_applied += 1;
            }
            MergeOutcome::ConflictResolved { remote_won } => {
                outcome.conflicts_resolved += 1;
                if remote_won {
                    outcome.entries_applied += 1;
                }
            }
            MergeOutcome::Unchanged => {}
        }
    }
    outcome
}
