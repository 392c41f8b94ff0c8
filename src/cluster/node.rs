//! Per-node runtime: one shared-state lock, three periodic tasks, and the
//! inbound message loop.
//!
//! All tasks mutate the same membership table / state store / version
//! vector behind a single `parking_lot::Mutex`. Merge and sweep work is
//! cheap and happens under the lock; encoding and network I/O always happen
//! after release, so no task blocks on the network while holding it.

use super::anti_entropy::{apply_entries, compute_diff};
use super::config::GossipConfig;
use super::membership::{
    MembershipEntry, MembershipEvent, MembershipTable, MembershipUpdate, NodeId, PeerState,
};
use super::message::{Codec, GossipMessage};
use super::recovery::PartitionRecovery;
use super::stats::{GossipStats, StatsSnapshot};
use super::store::{StateEntry, StateStore};
use super::unix_now;
use crate::transport::Transport;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct NodeInner {
    membership: MembershipTable,
    store: StateStore,
    sync_peers: BTreeSet<NodeId>,
    recovery: PartitionRecovery,
}

impl NodeInner {
    /// Reachability edge for the partition recovery controller. Evaluated
    /// after every mutation that can change a sync peer's liveness.
    fn observe_sync_reachability(&mut self) -> bool {
        let reachable = self.sync_peers.iter().any(|p| {
            self.membership
                .get(p)
                .map(|m| m.state == PeerState::Alive)
                .unwrap_or(false)
        });
        self.recovery.observe(reachable)
    }
}

struct NodeShared {
    config: GossipConfig,
    local_id: NodeId,
    inner: Mutex<NodeInner>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    stats: GossipStats,
    events: broadcast::Sender<MembershipEvent>,
}

pub struct GossipNode {
    shared: Arc<NodeShared>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipNode {
    pub fn new(
        config: GossipConfig,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
    ) -> Result<Self, super::config::ConfigError> {
        config.validate()?;
        let now = unix_now();
        let local_id = NodeId::new(config.node_id.clone());
        let local_addr = transport.local_addr().to_string();
        let (events, _) = broadcast::channel(256);

        let inner = NodeInner {
            membership: MembershipTable::new(local_id.clone(), local_addr, now),
            store: StateStore::new(local_id.clone(), config.conflict_policy),
            sync_peers: BTreeSet::new(),
            recovery: PartitionRecovery::new(),
        };

        Ok(GossipNode {
            shared: Arc::new(NodeShared {
                config,
                local_id,
                inner: Mutex::new(inner),
                transport,
                codec,
                stats: GossipStats::default(),
                events,
            }),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.shared.local_id
    }

    pub fn local_addr(&self) -> &str {
        self.shared.transport.local_addr()
    }

    /// Spawn the failure detector, gossip, and anti-entropy tasks plus the
    /// inbound loop.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        info!(node = %self.shared.local_id, addr = self.local_addr(), "gossip node starting");

        tasks.push(spawn_inbound_loop(self.shared.clone(), self.cancel.clone()));
        tasks.push(spawn_tick_loop(
            self.shared.clone(),
            self.cancel.clone(),
            TickKind::Gossip,
        ));
        tasks.push(spawn_tick_loop(
            self.shared.clone(),
            self.cancel.clone(),
            TickKind::Detector,
        ));
        tasks.push(spawn_tick_loop(
            self.shared.clone(),
            self.cancel.clone(),
            TickKind::IncrementalSync,
        ));
        tasks.push(spawn_tick_loop(
            self.shared.clone(),
            self.cancel.clone(),
            TickKind::FullSync,
        ));
    }

    /// Halt all periodic tasks, then drain: in-flight merges finish before
    /// this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        futures::future::join_all(tasks).await;
        info!(node = %self.shared.local_id, "gossip node stopped");
    }

    /// Announce ourselves to the configured seed nodes.
    pub fn join(&self) {
        let incarnation = self.shared.inner.lock().membership.local_incarnation();
        let msg = GossipMessage::Join {
            sender: self.shared.local_id.clone(),
            sender_incarnation: incarnation,
            address: self.local_addr().to_string(),
        };
        for seed in &self.shared.config.seed_addrs {
            if seed != self.local_addr() {
                self.shared.send_message(seed, &msg);
            }
        }
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.shared.inner.lock().store.put(key, value, unix_now());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.shared
            .inner
            .lock()
            .store
            .get(key)
            .map(|v| v.to_string())
    }

    pub fn delete(&self, key: impl Into<String>) {
        self.shared.inner.lock().store.delete(key, unix_now());
    }

    pub fn add_sync_peer(&self, node_id: NodeId) {
        let trigger = {
            let mut inner = self.shared.inner.lock();
            inner.sync_peers.insert(node_id);
            inner.observe_sync_reachability()
        };
        if trigger {
            self.shared.recovery_full_sync();
        }
    }

    pub fn remove_sync_peer(&self, node_id: &NodeId) {
        let mut inner = self.shared.inner.lock();
        inner.sync_peers.remove(node_id);
        inner.observe_sync_reachability();
    }

    pub fn membership_snapshot(&self) -> Vec<MembershipEntry> {
        self.shared.inner.lock().membership.snapshot()
    }

    pub fn store_snapshot(&self) -> Vec<StateEntry> {
        self.shared.inner.lock().store.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.shared.events.subscribe()
    }
}

enum TickKind {
    Gossip,
    Detector,
    IncrementalSync,
    FullSync,
}

fn spawn_tick_loop(
    shared: Arc<NodeShared>,
    cancel: CancellationToken,
    kind: TickKind,
) -> JoinHandle<()> {
    let period = match kind {
        TickKind::Gossip => shared.config.gossip_interval(),
        TickKind::Detector => shared.config.detector_interval(),
        TickKind::IncrementalSync => shared.config.incremental_sync_interval(),
        TickKind::FullSync => shared.config.full_sync_interval(),
    };
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // The first interval tick completes immediately; skip it so rounds
        // start one full period after startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match kind {
                    TickKind::Gossip => shared.gossip_round(),
                    TickKind::Detector => shared.detector_tick(),
                    TickKind::IncrementalSync => shared.incremental_sync_round(),
                    TickKind::FullSync => shared.full_sync_round(),
                },
            }
        }
    })
}

fn spawn_inbound_loop(shared: Arc<NodeShared>, cancel: CancellationToken) -> JoinHandle<()> {
    let mut inbound = match shared.transport.take_inbound() {
        Some(rx) => rx,
        None => {
            warn!(node = %shared.local_id, "transport inbound stream already taken");
            return tokio::spawn(async {});
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                datagram = inbound.recv() => {
                    let Some(datagram) = datagram else { break };
                    shared.handle_datagram(&datagram.from, &datagram.payload);
                }
            }
        }
    })
}

impl NodeShared {
    fn send_message(&self, dest: &str, msg: &GossipMessage) {
        match self.codec.encode(msg) {
            Ok(bytes) => {
                GossipStats::incr(&self.stats.messages_sent);
                self.transport.send(dest, bytes);
            }
            Err(e) => warn!(kind = msg.kind(), error = %e, "failed to encode message"),
        }
    }

    fn broadcast(&self, targets: &[(NodeId, String)], msg: &GossipMessage) {
        match self.codec.encode(msg) {
            Ok(bytes) => {
                for (_, addr) in targets {
                    GossipStats::incr(&self.stats.messages_sent);
                    self.transport.send(addr, bytes.clone());
                }
            }
            Err(e) => warn!(kind = msg.kind(), error = %e, "failed to encode message"),
        }
    }

    fn emit(&self, event: MembershipEvent) {
        debug!(node = %self.local_id, ?event, "membership event");
        let _ = self.events.send(event);
    }

    /// One gossip round: sample `fanout` alive peers and push the current
    /// membership view plus recently-mutated state entries. Fewer than one
    /// alive peer makes the round a no-op, not an error.
    fn gossip_round(&self) {
        let (peers, msg) = {
            let mut inner = self.inner.lock();
            let peers = inner.membership.alive_peers();
            if peers.is_empty() {
                return;
            }
            let entries = inner.store.drain_dirty(self.config.gossip_sample);
            let msg = GossipMessage::Gossip {
                sender: self.local_id.clone(),
                sender_incarnation: inner.membership.local_incarnation(),
                members: inner.membership.snapshot(),
                entries,
            };
            (peers, msg)
        };

        let targets: Vec<(NodeId, String)> = peers
            .choose_multiple(&mut rand::thread_rng(), self.config.fanout)
            .cloned()
            .collect();
        self.broadcast(&targets, &msg);
        GossipStats::incr(&self.stats.gossip_rounds);
    }

    /// One failure-detector tick: escalate quiet peers and broadcast each
    /// transition immediately rather than waiting for the next gossip round.
    fn detector_tick(&self) {
        let now = unix_now();
        let (updates, peers, incarnation, recovery) = {
            let mut inner = self.inner.lock();
            let updates = inner.membership.sweep(
                now,
                self.config.suspicion_timeout_secs(),
                self.config.failure_timeout_secs(),
            );
            let recovery = if updates.is_empty() {
                false
            } else {
                inner.observe_sync_reachability()
            };
            let peers = inner.membership.alive_peers();
            let incarnation = inner.membership.local_incarnation();
            (updates, peers, incarnation, recovery)
        };

        for update in &updates {
            let MembershipUpdate {
                node_id,
                state,
                incarnation: target_incarnation,
            } = update;
            match state {
                PeerState::Suspect => {
                    info!(node = %self.local_id, peer = %node_id, "peer suspected");
                    self.emit(MembershipEvent::Suspected(node_id.clone()));
                }
                PeerState::Dead => {
                    info!(node = %self.local_id, peer = %node_id, "peer declared dead");
                    GossipStats::incr(&self.stats.failures_detected);
                    self.emit(MembershipEvent::Failed(node_id.clone()));
                }
                PeerState::Alive => {}
            }
            let msg = GossipMessage::StateChange {
                sender: self.local_id.clone(),
                sender_incarnation: incarnation,
                target: node_id.clone(),
                state: *state,
                incarnation: *target_incarnation,
            };
            self.broadcast(&peers, &msg);
        }
        if recovery {
            self.recovery_full_sync();
        }
    }

    /// Incremental anti-entropy: exchange version vectors with a small
    /// random sample of sync peers.
    fn incremental_sync_round(&self) {
        let (targets, msg) = {
            let inner = self.inner.lock();
            let candidates: Vec<(NodeId, String)> = inner
                .membership
                .alive_peers()
                .into_iter()
                .filter(|(id, _)| inner.sync_peers.contains(id))
                .collect();
            if candidates.is_empty() {
                return;
            }
            let msg = GossipMessage::SyncRequest {
                sender: self.local_id.clone(),
                sender_incarnation: inner.membership.local_incarnation(),
                versions: inner.store.versions().clone(),
                snapshot: None,
            };
            (candidates, msg)
        };

        let sample: Vec<(NodeId, String)> = targets
            .choose_multiple(&mut rand::thread_rng(), self.config.max_sync_peers)
            .cloned()
            .collect();
        self.broadcast(&sample, &msg);
        GossipStats::incr(&self.stats.sync_rounds);
    }

    fn full_sync_round(&self) {
        self.full_sync_with_all("scheduled");
    }

    fn recovery_full_sync(&self) {
        info!(node = %self.local_id, "sync peers reachable again, forcing full sync");
        self.full_sync_with_all("partition recovery");
    }

    /// Full anti-entropy: push our complete snapshot and version vector to
    /// every configured sync peer; each answers with its own snapshot, so
    /// one round leaves both sides mutually consistent.
    fn full_sync_with_all(&self, reason: &str) {
        let now = unix_now();
        let (targets, msg) = {
            let mut inner = self.inner.lock();
            let purged = inner
                .store
                .purge_tombstones(now, self.config.tombstone_retention_secs());
            if purged > 0 {
                debug!(node = %self.local_id, purged, "tombstones collected");
            }
            let targets: Vec<(NodeId, String)> = inner
                .sync_peers
                .iter()
                .filter_map(|id| {
                    inner
                        .membership
                        .addr_of(id)
                        .map(|addr| (id.clone(), addr.to_string()))
                })
                .collect();
            if targets.is_empty() {
                return;
            }
            let msg = GossipMessage::SyncRequest {
                sender: self.local_id.clone(),
                sender_incarnation: inner.membership.local_incarnation(),
                versions: inner.store.versions().clone(),
                snapshot: Some(inner.store.snapshot()),
            };
            (targets, msg)
        };

        debug!(node = %self.local_id, peers = targets.len(), reason, "full sync round");
        self.broadcast(&targets, &msg);
        GossipStats::incr(&self.stats.full_syncs);
    }

    fn handle_datagram(&self, from: &str, payload: &[u8]) {
        let msg = match self.codec.decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                GossipStats::incr(&self.stats.messages_rejected);
                warn!(node = %self.local_id, from, error = %e, "discarding undecodable message");
                return;
            }
        };
        GossipStats::incr(&self.stats.messages_received);
        self.handle_message(from, msg);
    }

    /// If the direct sender of a message is still Dead in our view, return
    /// the incarnation we hold for it. Dead entries only revive on a
    /// strictly higher incarnation, so the peer must be told what we
    /// believe before it can refute.
    fn dead_sender_claim(inner: &NodeInner, sender: &NodeId) -> Option<u64> {
        inner
            .membership
            .get(sender)
            .filter(|m| m.state == PeerState::Dead)
            .map(|m| m.incarnation)
    }

    fn handle_message(&self, from: &str, msg: GossipMessage) {
        let now = unix_now();
        let mut events: Vec<MembershipEvent> = Vec::new();
        let mut outbound: Vec<(String, GossipMessage)> = Vec::new();
        let mut refuted: Option<u64> = None;
        let mut recovery = false;
        let mut dead_claim: Option<(NodeId, u64)> = None;

        match msg {
            GossipMessage::Join {
                sender,
                sender_incarnation,
                address,
            } => {
                let mut inner = self.inner.lock();
                events.extend(inner.membership.insert_joined(
                    sender.clone(),
                    address,
                    sender_incarnation,
                    now,
                ));
                dead_claim = Self::dead_sender_claim(&inner, &sender).map(|i| (sender.clone(), i));
                recovery = inner.observe_sync_reachability();
                let reply = GossipMessage::Gossip {
                    sender: self.local_id.clone(),
                    sender_incarnation: inner.membership.local_incarnation(),
                    members: inner.membership.snapshot(),
                    entries: Vec::new(),
                };
                drop(inner);
                info!(node = %self.local_id, peer = %sender, "peer joined");
                outbound.push((from.to_string(), reply));
            }

            GossipMessage::Gossip {
                sender,
                sender_incarnation,
                members,
                entries,
            } => {
                let mut inner = self.inner.lock();
                events.extend(inner.membership.record_contact(&sender, sender_incarnation, now));
                for member in &members {
                    if member.node_id == self.local_id {
                        if let Some(new_incarnation) =
                            inner.membership.maybe_refute(member.state, member.incarnation, now)
                        {
                            refuted = Some(new_incarnation);
                        }
                    } else {
                        events.extend(inner.membership.merge_remote(member, now));
                    }
                }
                let outcome = apply_entries(&mut inner.store, entries);
                GossipStats::add(&self.stats.entries_synced, outcome.entries_applied as u64);
                GossipStats::add(
                    &self.stats.conflicts_resolved,
                    outcome.conflicts_resolved as u64,
                );
                dead_claim = Self::dead_sender_claim(&inner, &sender).map(|i| (sender.clone(), i));
                recovery = inner.observe_sync_reachability();
            }

            GossipMessage::StateChange {
                sender,
                sender_incarnation,
                target,
                state,
                incarnation,
            } => {
                let mut inner = self.inner.lock();
                events.extend(inner.membership.record_contact(&sender, sender_incarnation, now));
                if target == self.local_id {
                    refuted = inner.membership.maybe_refute(state, incarnation, now);
                } else {
                    events.extend(inner.membership.apply_claim(&target, state, incarnation, now));
                }
                dead_claim = Self::dead_sender_claim(&inner, &sender).map(|i| (sender.clone(), i));
                recovery = inner.observe_sync_reachability();
            }

            GossipMessage::SyncRequest {
                sender,
                sender_incarnation,
                versions,
                snapshot,
            } => {
                let mut inner = self.inner.lock();
                events.extend(inner.membership.record_contact(&sender, sender_incarnation, now));
                let reply = match snapshot {
                    Some(remote_snapshot) => {
                        let diff = compute_diff(&inner.store, &remote_snapshot);
                        debug!(
                            node = %self.local_id,
                            peer = %sender,
                            missing = diff.missing.len(),
                            outdated = diff.outdated.len(),
                            conflicting = diff.conflicting.len(),
                            "full sync diff"
                        );
                        let outcome = apply_entries(&mut inner.store, remote_snapshot);
                        GossipStats::add(&self.stats.entries_synced, outcome.entries_applied as u64);
                        GossipStats::add(
                            &self.stats.conflicts_resolved,
                            outcome.conflicts_resolved as u64,
                        );
                        GossipMessage::SyncResponse {
                            sender: self.local_id.clone(),
                            sender_incarnation: inner.membership.local_incarnation(),
                            entries: inner.store.snapshot(),
                            versions: None,
                        }
                    }
                    None => GossipMessage::SyncResponse {
                        sender: self.local_id.clone(),
                        sender_incarnation: inner.membership.local_incarnation(),
                        entries: inner.store.entries_ahead_of(&versions),
                        versions: Some(inner.store.versions().clone()),
                    },
                };
                dead_claim = Self::dead_sender_claim(&inner, &sender).map(|i| (sender.clone(), i));
                recovery = inner.observe_sync_reachability();
                drop(inner);
                outbound.push((from.to_string(), reply));
            }

            GossipMessage::SyncResponse {
                sender,
                sender_incarnation,
                entries,
                versions,
            } => {
                let mut inner = self.inner.lock();
                events.extend(inner.membership.record_contact(&sender, sender_incarnation, now));
                let outcome = apply_entries(&mut inner.store, entries);
                GossipStats::add(&self.stats.entries_synced, outcome.entries_applied as u64);
                GossipStats::add(
                    &self.stats.conflicts_resolved,
                    outcome.conflicts_resolved as u64,
                );
                if let Some(peer_versions) = versions {
                    let push = inner.store.entries_ahead_of(&peer_versions);
                    if !push.is_empty() {
                        outbound.push((
                            from.to_string(),
                            GossipMessage::SyncResponse {
                                sender: self.local_id.clone(),
                                sender_incarnation: inner.membership.local_incarnation(),
                                entries: push,
                                versions: None,
                            },
                        ));
                    }
                }
                dead_claim = Self::dead_sender_claim(&inner, &sender).map(|i| (sender.clone(), i));
                recovery = inner.observe_sync_reachability();
            }
        }

        if let Some((peer, stored_incarnation)) = dead_claim {
            debug!(node = %self.local_id, peer = %peer, "informing dead-marked peer so it can refute");
            let incarnation = self.inner.lock().membership.local_incarnation();
            outbound.push((
                from.to_string(),
                GossipMessage::StateChange {
                    sender: self.local_id.clone(),
                    sender_incarnation: incarnation,
                    target: peer,
                    state: PeerState::Dead,
                    incarnation: stored_incarnation,
                },
            ));
        }

        if let Some(new_incarnation) = refuted {
            GossipStats::incr(&self.stats.refutations);
            info!(node = %self.local_id, incarnation = new_incarnation, "refuting suspicion about self");
            let peers = self.inner.lock().membership.alive_peers();
            let alive_claim = GossipMessage::StateChange {
                sender: self.local_id.clone(),
                sender_incarnation: new_incarnation,
                target: self.local_id.clone(),
                state: PeerState::Alive,
                incarnation: new_incarnation,
            };
            self.broadcast(&peers, &alive_claim);
            // The claimant itself may hold us Dead and thus not be in our
            // alive set; answer it directly.
            if !peers.iter().any(|(_, addr)| addr == from) {
                self.send_message(from, &alive_claim);
            }
        }

        for (dest, msg) in outbound {
            self.send_message(&dest, &msg);
        }
        for event in events {
            self.emit(event);
        }
        if recovery {
            self.recovery_full_sync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::message::JsonCodec;
    use crate::transport::MemoryNetwork;

    fn node(network: &MemoryNetwork, id: &str) -> GossipNode {
        let transport = Arc::new(network.endpoint(format!("addr-{}", id)));
        let config = GossipConfig::new(id, format!("addr-{}", id));
        GossipNode::new(config, transport, Arc::new(JsonCodec)).unwrap()
    }

    #[tokio::test]
    async fn test_local_put_get_delete() {
        let network = MemoryNetwork::new(1);
        let n = node(&network, "a");
        n.put("k", "v");
        assert_eq!(n.get("k"), Some("v".to_string()));
        n.delete("k");
        assert_eq!(n.get("k"), None);
        // The tombstone is retained in the snapshot until GC.
        assert_eq!(n.store_snapshot().len(), 1);
        assert!(n.store_snapshot()[0].tombstone);
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let network = MemoryNetwork::new(1);
        let transport = Arc::new(network.endpoint("addr-x"));
        let mut config = GossipConfig::new("x", "addr-x");
        config.fanout = 0;
        assert!(GossipNode::new(config, transport, Arc::new(JsonCodec)).is_err());
    }

    #[tokio::test]
    async fn test_join_reply_populates_membership() {
        let network = MemoryNetwork::new(1);
        let a = node(&network, "a");
        let b = node(&network, "b");
        a.start();
        b.start();

        // Drive join directly: b announces itself to a.
        b.shared.send_message(
            a.local_addr(),
            &GossipMessage::Join {
                sender: b.node_id().clone(),
                sender_incarnation: 0,
                address: b.local_addr().to_string(),
            },
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let a_view = a.membership_snapshot();
        assert!(a_view.iter().any(|m| m.node_id == NodeId::from("b")));
        let b_view = b.membership_snapshot();
        assert!(b_view.iter().any(|m| m.node_id == NodeId::from("a")));

        a.stop().await;
        b.stop().await;
    }
}
