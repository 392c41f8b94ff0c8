//! In-process message-passing network for tests and simulation.
//!
//! Every endpoint is a real transport: messages cross a channel, never a
//! shared reference, so nodes only see each other through message copies.
//! Drop rate and pairwise partitions are injectable, with a seeded RNG so
//! lossy runs replay deterministically.

use super::{Datagram, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

struct NetworkInner {
    endpoints: HashMap<String, mpsc::UnboundedSender<Datagram>>,
    drop_rate: f64,
    partitions: HashSet<(String, String)>,
    rng: ChaCha8Rng,
}

#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new(seed: u64) -> Self {
        MemoryNetwork {
            inner: Arc::new(Mutex::new(NetworkInner {
                endpoints: HashMap::new(),
                drop_rate: 0.0,
                partitions: HashSet::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
            })),
        }
    }

    /// Register an endpoint and hand back its transport.
    pub fn endpoint(&self, addr: impl Into<String>) -> MemoryTransport {
        let addr = addr.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().endpoints.insert(addr.clone(), tx);
        MemoryTransport {
            addr,
            network: self.inner.clone(),
            inbound: Mutex::new(Some(rx)),
        }
    }

    pub fn set_drop_rate(&self, rate: f64) {
        self.inner.lock().drop_rate = rate.clamp(0.0, 1.0);
    }

    pub fn partition(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock();
        inner.partitions.insert((a.to_string(), b.to_string()));
        inner.partitions.insert((b.to_string(), a.to_string()));
    }

    pub fn heal(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock();
        inner.partitions.remove(&(a.to_string(), b.to_string()));
        inner.partitions.remove(&(b.to_string(), a.to_string()));
    }

    /// Cut every pair crossing the two groups.
    pub fn partition_groups(&self, left: &[&str], right: &[&str]) {
        for a in left {
            for b in right {
                self.partition(a, b);
            }
        }
    }

    pub fn heal_all(&self) {
        self.inner.lock().partitions.clear();
    }
}

pub struct MemoryTransport {
    addr: String,
    network: Arc<Mutex<NetworkInner>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> &str {
        &self.addr
    }

    fn send(&self, dest: &str, payload: Bytes) {
        let mut inner = self.network.lock();
        if inner
            .partitions
            .contains(&(self.addr.clone(), dest.to_string()))
        {
            return;
        }
        let drop_rate = inner.drop_rate;
        if drop_rate > 0.0 && inner.rng.gen_bool(drop_rate) {
            return;
        }
        if let Some(tx) = inner.endpoints.get(dest) {
            let _ = tx.send(Datagram {
                from: self.addr.clone(),
                payload,
            });
        }
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Datagram>> {
        self.inbound.lock().take()
    }
}
