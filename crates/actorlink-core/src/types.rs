//! Core identifiers and the envelope type.
//!
//! Field order of every serialized type is part of the wire format:
//! bodies are MessagePack arrays in Rust struct field order.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// NODE IDENTITY
// =============================================================================

/// Cluster-wide node identifier.
///
/// Zero is reserved so that the null address stays unambiguous.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct NodeId(u16);

impl NodeId {
    pub fn new(value: u16) -> Result<Self> {
        if value == 0 {
            return Err(Error::InvalidNodeId(value));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for NodeId {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Self::new(value)
    }
}

impl From<NodeId> for u16 {
    fn from(id: NodeId) -> u16 {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Randomly generated identifier of one launch of a node.
///
/// Distinguishes a restarted node from its previous incarnation even though
/// both use the same [`NodeId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchId(u64);

impl LaunchId {
    /// Generate a fresh non-zero launch id
    pub fn generate() -> Self {
        loop {
            let value: u64 = rand::random();
            if value != 0 {
                return Self(value);
            }
        }
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn into_bits(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Actor group number inside a node. Never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupNo(u8);

impl GroupNo {
    pub fn new(value: u8) -> Result<Self> {
        if value == 0 {
            return Err(Error::InvalidGroupNo(value));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

// =============================================================================
// ACTOR ADDRESS
// =============================================================================

const NODE_SHIFT: u32 = 48;
const GROUP_SHIFT: u32 = 40;
const SLOT_MASK: u64 = (1 << GROUP_SHIFT) - 1;

/// Globally unique actor address.
///
/// Packed into 64 bits:
///
/// ```text
/// 64        48        40                     0
/// +---------+---------+----------------------+
/// | node_id | group   |         slot         |
/// |   16b   |   8b    |         40b          |
/// +---------+---------+----------------------+
/// ```
///
/// On the wire an address is exactly this `u64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ActorAddr(u64);

impl ActorAddr {
    /// Build an address from its parts
    pub fn new(node: NodeId, group: GroupNo, slot: u64) -> Result<Self> {
        if slot > SLOT_MASK {
            return Err(Error::SlotOutOfRange(slot));
        }
        Ok(Self(
            (u64::from(node.get()) << NODE_SHIFT) | (u64::from(group.get()) << GROUP_SHIFT) | slot,
        ))
    }

    /// Parse raw bits. Both the node and the group part must be non-zero.
    pub fn from_bits(bits: u64) -> Result<Self> {
        let node = (bits >> NODE_SHIFT) as u16;
        let group = ((bits >> GROUP_SHIFT) & 0xff) as u8;
        if node == 0 || group == 0 {
            return Err(Error::InvalidAddr(bits));
        }
        Ok(Self(bits))
    }

    pub fn into_bits(self) -> u64 {
        self.0
    }

    /// Node owning this actor
    pub fn node(self) -> NodeId {
        NodeId((self.0 >> NODE_SHIFT) as u16)
    }

    pub fn group(self) -> GroupNo {
        GroupNo(((self.0 >> GROUP_SHIFT) & 0xff) as u8)
    }

    pub fn slot(self) -> u64 {
        self.0 & SLOT_MASK
    }

    /// Whether the actor lives on `node`
    pub fn is_on(self, node: NodeId) -> bool {
        self.node() == node
    }
}

impl TryFrom<u64> for ActorAddr {
    type Error = Error;

    fn try_from(bits: u64) -> Result<Self> {
        Self::from_bits(bits)
    }
}

impl From<ActorAddr> for u64 {
    fn from(addr: ActorAddr) -> u64 {
        addr.0
    }
}

impl fmt::Display for ActorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node(), self.group().get(), self.slot())
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Correlation id attached to every envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Maximum length of a message kind tag in bytes
pub const MAX_KIND_LEN: usize = 255;

/// Application-defined message kind tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageKind(String);

impl MessageKind {
    pub fn new(kind: impl Into<String>) -> Result<Self> {
        let kind = kind.into();
        if kind.is_empty() || kind.len() > MAX_KIND_LEN {
            return Err(Error::InvalidMessageKind(kind));
        }
        Ok(Self(kind))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageKind {
    type Error = Error;

    fn try_from(kind: String) -> Result<Self> {
        Self::new(kind)
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> String {
        kind.0
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable addressed unit of application payload.
///
/// Cloning is cheap: the payload is a reference-counted [`Bytes`] view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    sender: ActorAddr,
    destination: ActorAddr,
    correlation_id: CorrelationId,
    payload: Bytes,
    kind: MessageKind,
}

impl Envelope {
    pub fn new(
        sender: ActorAddr,
        destination: ActorAddr,
        kind: MessageKind,
        payload: impl Into<Bytes>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            sender,
            destination,
            correlation_id,
            payload: payload.into(),
            kind,
        }
    }

    pub fn sender(&self) -> ActorAddr {
        self.sender
    }

    pub fn destination(&self) -> ActorAddr {
        self.destination
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Build the reply envelope: sender and destination swapped, same correlation id
    pub fn reply(&self, kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self::new(
            self.destination,
            self.sender,
            kind,
            payload,
            self.correlation_id,
        )
    }
}
