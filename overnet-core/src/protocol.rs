//! Control-plane protocol carried on each peer's connection stream, plus the
//! fork frame embedded in application messages. Encoding is bincode.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::identity::{NodeId, StreamId};
use crate::slice::Slice;
use crate::status::Status;

/// Current protocol version, checked in `Hello`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Delivery contract of a stream, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReliabilityAndOrdering {
    ReliableOrdered,
    ReliableUnordered,
    UnreliableOrdered,
    UnreliableUnordered,
}

impl ReliabilityAndOrdering {
    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            ReliabilityAndOrdering::ReliableOrdered | ReliabilityAndOrdering::ReliableUnordered
        )
    }

    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            ReliabilityAndOrdering::ReliableOrdered | ReliabilityAndOrdering::UnreliableOrdered
        )
    }
}

/// Application descriptor carried by a fork so the receiver can route the new
/// stream to a local service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Introduction {
    pub service_name: String,
    pub metadata: BTreeMap<String, String>,
}

impl Introduction {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Request to open `stream_id` on the sender's side of the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkFrame {
    pub stream_id: StreamId,
    pub reliability: ReliabilityAndOrdering,
    pub introduction: Introduction,
}

impl ForkFrame {
    pub fn encode(&self) -> Result<Slice, Status> {
        bincode::serialize(self)
            .map(Slice::from)
            .map_err(|e| Status::internal(format!("encoding fork frame: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Status> {
        bincode::deserialize(bytes)
            .map_err(|e| Status::failed_precondition(format!("malformed fork frame: {}", e)))
    }
}

/// What a node exposes. `version` increases on every local change so stale
/// gossip never overwrites a newer description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub version: u64,
    pub label: Option<String>,
    pub services: BTreeSet<String>,
}

/// One direct link as reported by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDescription {
    pub from: NodeId,
    pub to: NodeId,
    pub rtt_us: Option<u64>,
}

/// Messages on the connection stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// First message on a connection.
    Hello {
        protocol_version: u8,
        description: NodeDescription,
    },
    /// Peer-initiated stream introduction (`initiate_stream`).
    Fork(ForkFrame),
    /// The sender closed its end of `stream_id` after sending `final_seq`
    /// messages on it.
    CloseStream {
        stream_id: StreamId,
        final_seq: u64,
        status: Status,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    /// Gossip: description of `node` (the sender itself or a node it knows).
    Describe {
        node: NodeId,
        description: NodeDescription,
    },
    /// Gossip: the sender's direct links.
    LinkState {
        links: Vec<LinkDescription>,
    },
    /// The sender is tearing the connection down.
    Goodbye {
        status: Status,
    },
}

impl PeerMessage {
    pub fn encode(&self) -> Result<Slice, Status> {
        bincode::serialize(self)
            .map(Slice::from)
            .map_err(|e| Status::internal(format!("encoding peer message: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Status> {
        bincode::deserialize(bytes)
            .map_err(|e| Status::failed_precondition(format!("malformed peer message: {}", e)))
    }
}
