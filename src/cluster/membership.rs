//! Membership table and SWIM-style failure detector.
//!
//! Each node keeps one local view of every known peer. Liveness claims are
//! ordered by incarnation: a higher incarnation always wins, and among equal
//! incarnations a more severe state wins but never downgrades without proof.
//! Proof of life is either a message authored by the peer itself
//! (`record_contact`) or a claim at a strictly higher incarnation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// Peer liveness state. Variant order is severity order: a more severe
/// state wins among equal incarnations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Alive,
    Suspect,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub node_id: NodeId,
    pub address: String,
    pub state: PeerState,
    pub incarnation: u64,
    pub last_seen: f64,
    /// Local bookkeeping for the Suspect -> Dead deadline; not gossiped.
    #[serde(skip)]
    pub state_changed_at: f64,
}

impl MembershipEntry {
    fn new(node_id: NodeId, address: String, incarnation: u64, now: f64) -> Self {
        MembershipEntry {
            node_id,
            address,
            state: PeerState::Alive,
            incarnation,
            last_seen: now,
            state_changed_at: now,
        }
    }
}

/// Membership change surfaced to the owning application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeId),
    Suspected(NodeId),
    Failed(NodeId),
    Recovered(NodeId),
}

/// A detector-produced state transition that must be gossiped.
/// `incarnation` is the target's incarnation the claim refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipUpdate {
    pub node_id: NodeId,
    pub state: PeerState,
    pub incarnation: u64,
}

#[derive(Debug)]
pub struct MembershipTable {
    local_id: NodeId,
    members: HashMap<NodeId, MembershipEntry>,
}

impl MembershipTable {
    pub fn new(local_id: NodeId, local_addr: String, now: f64) -> Self {
        let mut members = HashMap::new();
        members.insert(
            local_id.clone(),
            MembershipEntry::new(local_id.clone(), local_addr, 0, now),
        );
        MembershipTable { local_id, members }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn local_incarnation(&self) -> u64 {
        self.members[&self.local_id].incarnation
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&MembershipEntry> {
        self.members.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn addr_of(&self, node_id: &NodeId) -> Option<&str> {
        self.members.get(node_id).map(|m| m.address.as_str())
    }

    /// All Alive peers excluding self, as (id, address) pairs.
    pub fn alive_peers(&self) -> Vec<(NodeId, String)> {
        self.members
            .values()
            .filter(|m| m.state == PeerState::Alive && m.node_id != self.local_id)
            .map(|m| (m.node_id.clone(), m.address.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<MembershipEntry> {
        let mut entries: Vec<MembershipEntry> = self.members.values().cloned().collect();
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        entries
    }

    /// Register a node announced through a Join message.
    pub fn insert_joined(
        &mut self,
        node_id: NodeId,
        address: String,
        incarnation: u64,
        now: f64,
    ) -> Option<MembershipEvent> {
        if node_id == self.local_id {
            return None;
        }
        if !self.members.contains_key(&node_id) {
            self.members.insert(
                node_id.clone(),
                MembershipEntry::new(node_id.clone(), address, incarnation, now),
            );
            return Some(MembershipEvent::Joined(node_id));
        }
        if let Some(existing) = self.members.get_mut(&node_id) {
            existing.address = address;
        }
        self.contact_from(&node_id, incarnation, now)
    }

    /// Direct proof of life: the peer itself authored a message we received.
    /// A Dead entry only revives on a strictly higher incarnation (rebirth);
    /// otherwise any incarnation >= ours for that peer restores Alive.
    pub fn record_contact(
        &mut self,
        node_id: &NodeId,
        incarnation: u64,
        now: f64,
    ) -> Option<MembershipEvent> {
        if *node_id == self.local_id {
            return None;
        }
        self.contact_from(node_id, incarnation, now)
    }

    fn contact_from(
        &mut self,
        node_id: &NodeId,
        incarnation: u64,
        now: f64,
    ) -> Option<MembershipEvent> {
        let entry = self.members.get_mut(node_id)?;
        match entry.state {
            PeerState::Dead => {
                if incarnation > entry.incarnation {
                    entry.state = PeerState::Alive;
                    entry.incarnation = incarnation;
                    entry.last_seen = now;
                    entry.state_changed_at = now;
                    return Some(MembershipEvent::Recovered(node_id.clone()));
                }
                None
            }
            PeerState::Suspect => {
                entry.last_seen = now;
                if incarnation >= entry.incarnation {
                    entry.state = PeerState::Alive;
                    entry.incarnation = entry.incarnation.max(incarnation);
                    entry.state_changed_at = now;
                    return Some(MembershipEvent::Recovered(node_id.clone()));
                }
                None
            }
            PeerState::Alive => {
                entry.last_seen = now;
                entry.incarnation = entry.incarnation.max(incarnation);
                None
            }
        }
    }

    /// Merge a gossiped membership entry. Returns the resulting event, if
    /// the local view changed. Rumors are weaker than direct contact: an
    /// equal-incarnation Alive rumor refreshes an Alive entry but cannot
    /// clear suspicion.
    pub fn merge_remote(&mut self, remote: &MembershipEntry, now: f64) -> Option<MembershipEvent> {
        if remote.node_id == self.local_id {
            return None;
        }
        if !self.members.contains_key(&remote.node_id) {
            let mut inserted = MembershipEntry::new(
                remote.node_id.clone(),
                remote.address.clone(),
                remote.incarnation,
                now,
            );
            inserted.state = remote.state;
            self.members.insert(remote.node_id.clone(), inserted);
            return Some(MembershipEvent::Joined(remote.node_id.clone()));
        }
        let entry = self
            .members
            .get_mut(&remote.node_id)
            .expect("presence checked above");

        let wins = if entry.state == PeerState::Dead {
            remote.incarnation > entry.incarnation
        } else {
            remote.incarnation > entry.incarnation
                || (remote.incarnation == entry.incarnation && remote.state > entry.state)
        };

        if wins {
            let old_state = entry.state;
            entry.incarnation = remote.incarnation;
            entry.state = remote.state;
            entry.state_changed_at = now;
            if remote.state == PeerState::Alive {
                entry.last_seen = now;
            }
            return match (old_state, remote.state) {
                (_, PeerState::Dead) => Some(MembershipEvent::Failed(remote.node_id.clone())),
                (PeerState::Alive, PeerState::Suspect) => {
                    Some(MembershipEvent::Suspected(remote.node_id.clone()))
                }
                (PeerState::Suspect | PeerState::Dead, PeerState::Alive) => {
                    Some(MembershipEvent::Recovered(remote.node_id.clone()))
                }
                _ => None,
            };
        }

        // Equal-incarnation Alive rumor counts as indirect contact for an
        // entry we already believe Alive.
        if entry.state == PeerState::Alive
            && remote.state == PeerState::Alive
            && remote.incarnation >= entry.incarnation
        {
            entry.last_seen = entry.last_seen.max(now);
        }
        None
    }

    /// Apply a targeted liveness claim (a StateChange message). Unknown
    /// targets are ignored; without an address there is nothing to track.
    pub fn apply_claim(
        &mut self,
        target: &NodeId,
        state: PeerState,
        incarnation: u64,
        now: f64,
    ) -> Option<MembershipEvent> {
        if *target == self.local_id || !self.members.contains_key(target) {
            return None;
        }
        let claim = MembershipEntry {
            node_id: target.clone(),
            address: self.members[target].address.clone(),
            state,
            incarnation,
            last_seen: now,
            state_changed_at: now,
        };
        self.merge_remote(&claim, now)
    }

    /// Self-refutation: a rumor claims we are Suspect or Dead at an
    /// incarnation at least as high as our own. Bump past it and reassert
    /// Alive. Returns the new incarnation when a refutation happened.
    pub fn maybe_refute(
        &mut self,
        claimed_state: PeerState,
        claimed_incarnation: u64,
        now: f64,
    ) -> Option<u64> {
        let own = self
            .members
            .get_mut(&self.local_id)
            .expect("local entry always present");
        if claimed_state == PeerState::Alive || claimed_incarnation < own.incarnation {
            return None;
        }
        own.incarnation = claimed_incarnation + 1;
        own.state = PeerState::Alive;
        own.last_seen = now;
        own.state_changed_at = now;
        Some(own.incarnation)
    }

    /// One failure-detector tick: escalate unresponsive peers and return the
    /// transitions that must be gossiped.
    pub fn sweep(
        &mut self,
        now: f64,
        suspicion_timeout: f64,
        failure_timeout: f64,
    ) -> Vec<MembershipUpdate> {
        let mut updates = Vec::new();
        for entry in self.members.values_mut() {
            if entry.node_id == self.local_id || entry.state == PeerState::Dead {
                continue;
            }
            match entry.state {
                PeerState::Alive => {
                    if now - entry.last_seen >= suspicion_timeout {
                        entry.state = PeerState::Suspect;
                        entry.state_changed_at = now;
                        updates.push(MembershipUpdate {
                            node_id: entry.node_id.clone(),
                            state: PeerState::Suspect,
                            incarnation: entry.incarnation,
                        });
                    }
                }
                PeerState::Suspect => {
                    if now - entry.state_changed_at >= failure_timeout {
                        entry.state = PeerState::Dead;
                        entry.state_changed_at = now;
                        updates.push(MembershipUpdate {
                            node_id: entry.node_id.clone(),
                            state: PeerState::Dead,
                            incarnation: entry.incarnation,
                        });
                    }
                }
                PeerState::Dead => unreachable!("dead entries are skipped"),
            }
        }
        updates
    }
}
