pub mod anti_entropy;
pub mod config;
pub mod membership;
pub mod message;
pub mod node;
pub mod recovery;
pub mod stats;
pub mod store;
pub mod version;

pub use config::{ConflictPolicy, ConfigError, GossipConfig};
pub use membership::{MembershipEntry, MembershipEvent, MembershipTable, NodeId, PeerState};
pub use message::{BincodeCodec, Codec, CodecError, GossipMessage, JsonCodec};
pub use node::GossipNode;
pub use stats::StatsSnapshot;
pub use store::{StateEntry, StateStore};
pub use version::VersionVector;

/// Wall-clock seconds since the Unix epoch, the protocol's timestamp base.
pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
