use super::membership::{MembershipEntry, NodeId, PeerState};
use super::store::StateEntry;
use super::version::VersionVector;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The closed set of message kinds exchanged between nodes. Every message
/// carries the sender's identity and current incarnation, which doubles as
/// proof of life for the failure detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Announce ourselves to a seed node.
    Join {
        sender: NodeId,
        sender_incarnation: u64,
        address: String,
    },
    /// One fire-and-forget gossip round payload: the sender's membership
    /// view plus a bounded sample of recent state entries.
    Gossip {
        sender: NodeId,
        sender_incarnation: u64,
        members: Vec<MembershipEntry>,
        entries: Vec<StateEntry>,
    },
    /// Immediate broadcast of a failure-detector transition, or a
    /// self-refutation (an Alive claim about the sender itself).
    StateChange {
        sender: NodeId,
        sender_incarnation: u64,
        target: NodeId,
        state: PeerState,
        incarnation: u64,
    },
    /// Anti-entropy opener. `snapshot` present means full sync: the
    /// receiver merges it and answers with its own full snapshot. Absent
    /// means incremental: the receiver answers with what the sender's
    /// version vector is missing.
    SyncRequest {
        sender: NodeId,
        sender_incarnation: u64,
        versions: VersionVector,
        snapshot: Option<Vec<StateEntry>>,
    },
    /// Anti-entropy answer. When `versions` is present the receiver closes
    /// the round by pushing back whatever that vector is missing, making
    /// one round symmetric.
    SyncResponse {
        sender: NodeId,
        sender_incarnation: u64,
        entries: Vec<StateEntry>,
        versions: Option<VersionVector>,
    },
}

impl GossipMessage {
    pub fn sender(&self) -> (&NodeId, u64) {
        match self {
            GossipMessage::Join {
                sender,
                sender_incarnation,
                ..
            }
            | GossipMessage::Gossip {
                sender,
                sender_incarnation,
                ..
            }
            | GossipMessage::StateChange {
                sender,
                sender_incarnation,
                ..
            }
            | GossipMessage::SyncRequest {
                sender,
                sender_incarnation,
                ..
            }
            | GossipMessage::SyncResponse {
                sender,
                sender_incarnation,
                ..
            } => (sender, *sender_incarnation),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Join { .. } => "join",
            GossipMessage::Gossip { .. } => "gossip",
            GossipMessage::StateChange { .. } => "state_change",
            GossipMessage::SyncRequest { .. } => "sync_request",
            GossipMessage::SyncResponse { .. } => "sync_response",
        }
    }
}

/// Serialization seam. The core never assumes a concrete wire format;
/// anything with round-trip fidelity for `GossipMessage` works.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, msg: &GossipMessage) -> Result<Bytes, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<GossipMessage, CodecError>;
}

/// Self-describing JSON encoding, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, msg: &GossipMessage) -> Result<Bytes, CodecError> {
        serde_json::to_vec(msg)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<GossipMessage, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Compact binary encoding for bandwidth-sensitive deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode(&self, msg: &GossipMessage) -> Result<Bytes, CodecError> {
        bincode::serialize(msg)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<GossipMessage, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode failed: {}", e),
            CodecError::Decode(e) => write!(f, "decode failed: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> GossipMessage {
        GossipMessage::Gossip {
            sender: NodeId::from("a"),
            sender_incarnation: 2,
            members: vec![MembershipEntry {
                node_id: NodeId::from("b"),
                address: "127.0.0.1:7001".to_string(),
                state: PeerState::Suspect,
                incarnation: 1,
                last_seen: 12.5,
                state_changed_at: 0.0,
            }],
            entries: vec![StateEntry {
                key: "k".to_string(),
                value: None,
                tombstone: true,
                version: 3,
                timestamp: 9.0,
                origin: NodeId::from("a"),
            }],
        }
    }

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;
        let bytes = codec.encode(&sample_message()).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        let (sender, incarnation) = decoded.sender();
        assert_eq!(sender, &NodeId::from("a"));
        assert_eq!(incarnation, 2);
        match decoded {
            GossipMessage::Gossip { members, entries, .. } => {
                assert_eq!(members[0].state, PeerState::Suspect);
                assert!(entries[0].tombstone);
            }
            other => panic!("unexpected kind: {}", other.kind()),
        }
    }

    #[test]
    fn test_bincode_round_trip() {
        let codec = BincodeCodec;
        let bytes = codec.encode(&sample_message()).unwrap();
        assert!(codec.decode(&bytes).is_ok());
    }

    #[test]
    fn test_garbage_is_rejected_not_panicked() {
        assert!(JsonCodec.decode(b"{not json").is_err());
        assert!(BincodeCodec.decode(&[0xff, 0x01]).is_err());
    }
}
