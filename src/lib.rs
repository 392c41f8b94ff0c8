pub mod cluster;
pub mod transport;

pub use cluster::{
    ConflictPolicy, GossipConfig, GossipNode, JsonCodec, MembershipEvent, NodeId, PeerState,
};
pub use transport::{MemoryNetwork, Transport, UdpTransport};
