//! Transport seam between the gossip core and the wire.
//!
//! The core only needs best-effort datagram delivery: no acknowledgments,
//! no ordering, no connection state. Failure detection and anti-entropy
//! recover whatever the transport loses.

use bytes::Bytes;
use tokio::sync::mpsc;

pub mod memory;
pub mod udp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: String,
    pub payload: Bytes,
}

pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> &str;

    /// Best-effort, fire-and-forget send. Delivery failures are invisible
    /// to the caller.
    fn send(&self, dest: &str, payload: Bytes);

    /// Take ownership of the inbound stream. Single consumer: the second
    /// call returns None.
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Datagram>>;
}
