//! Error types for actorlink core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// actorlink core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    /// Node identifier out of range (zero is reserved for the null address)
    #[error("invalid node id: {0}")]
    InvalidNodeId(u16),

    /// Group number out of range (zero is reserved for the null address)
    #[error("invalid group number: {0}")]
    InvalidGroupNo(u8),

    /// Slot does not fit into the 40-bit slot field of an address
    #[error("slot {0:#x} does not fit into 40 bits")]
    SlotOutOfRange(u64),

    /// Raw bits do not form a valid actor address
    #[error("invalid actor address bits: {0:#018x}")]
    InvalidAddr(u64),

    /// Message kind tag is empty or too long
    #[error("invalid message kind: {0:?}")]
    InvalidMessageKind(String),
}
