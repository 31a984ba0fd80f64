//! Message framing for network transport
//!
//! Wire format of every frame:
//!
//! ```text
//! +----------------+---------+------------------------+
//! | length (u32be) | type u8 | body (MessagePack)     |
//! +----------------+---------+------------------------+
//! ```
//!
//! `length` covers the type byte and the body. Bodies are rmp-serde compact
//! encodings: structs are arrays in field order.

use crate::handshake::{HandshakeInfo, Reject};
use actorlink_core::{ActorAddr, Envelope};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum frame size (16 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size
const LENGTH_BYTES: usize = 4;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("malformed {frame_type:?} body: {source}")]
    MalformedBody {
        frame_type: FrameType,
        #[source]
        source: rmp_serde::decode::Error,
    },
    #[error("failed to encode {frame_type:?} body: {source}")]
    Encode {
        frame_type: FrameType,
        #[source]
        source: rmp_serde::encode::Error,
    },
    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame type discriminants
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Hello = 1,
    HelloAck = 2,
    HelloReject = 3,
    Data = 4,
    Heartbeat = 5,
    TopologyUpdate = 6,
    Goodbye = 7,
}

impl FrameType {
    /// Whether this frame belongs to the handshake exchange
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Hello | Self::HelloAck | Self::HelloReject)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Hello),
            2 => Ok(Self::HelloAck),
            3 => Ok(Self::HelloReject),
            4 => Ok(Self::Data),
            5 => Ok(Self::Heartbeat),
            6 => Ok(Self::TopologyUpdate),
            7 => Ok(Self::Goodbye),
            _ => Err(ProtocolError::UnknownFrameType(value)),
        }
    }
}

/// Keepalive sent when the outbound side has been idle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender wall clock, unix millis
    pub sent_at_millis: u64,
}

/// Address advertisement from a peer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyUpdate {
    /// Replace everything previously advertised by the sender
    pub full: bool,
    pub advertised: Vec<ActorAddr>,
    pub withdrawn: Vec<ActorAddr>,
}

/// Graceful close notice
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    pub reason: String,
}

/// A decoded frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Hello(HandshakeInfo),
    HelloAck(HandshakeInfo),
    HelloReject(Reject),
    Data(Envelope),
    Heartbeat(Heartbeat),
    TopologyUpdate(TopologyUpdate),
    Goodbye(Goodbye),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Hello(_) => FrameType::Hello,
            Self::HelloAck(_) => FrameType::HelloAck,
            Self::HelloReject(_) => FrameType::HelloReject,
            Self::Data(_) => FrameType::Data,
            Self::Heartbeat(_) => FrameType::Heartbeat,
            Self::TopologyUpdate(_) => FrameType::TopologyUpdate,
            Self::Goodbye(_) => FrameType::Goodbye,
        }
    }

    /// Create a heartbeat frame stamped with the current time
    pub fn heartbeat() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        Self::Heartbeat(Heartbeat {
            sent_at_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        })
    }

    /// Create a goodbye frame
    pub fn goodbye(reason: impl Into<String>) -> Self {
        Self::Goodbye(Goodbye {
            reason: reason.into(),
        })
    }

    fn encode_body(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        match self {
            Self::Hello(info) | Self::HelloAck(info) => rmp_serde::to_vec(info),
            Self::HelloReject(reject) => rmp_serde::to_vec(reject),
            Self::Data(envelope) => rmp_serde::to_vec(envelope),
            Self::Heartbeat(heartbeat) => rmp_serde::to_vec(heartbeat),
            Self::TopologyUpdate(update) => rmp_serde::to_vec(update),
            Self::Goodbye(goodbye) => rmp_serde::to_vec(goodbye),
        }
    }

    fn decode_body(frame_type: FrameType, body: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        Ok(match frame_type {
            FrameType::Hello => Self::Hello(rmp_serde::from_slice(body)?),
            FrameType::HelloAck => Self::HelloAck(rmp_serde::from_slice(body)?),
            FrameType::HelloReject => Self::HelloReject(rmp_serde::from_slice(body)?),
            FrameType::Data => Self::Data(rmp_serde::from_slice(body)?),
            FrameType::Heartbeat => Self::Heartbeat(rmp_serde::from_slice(body)?),
            FrameType::TopologyUpdate => Self::TopologyUpdate(rmp_serde::from_slice(body)?),
            FrameType::Goodbye => Self::Goodbye(rmp_serde::from_slice(body)?),
        })
    }
}

/// Codec for length-prefixed frames
///
/// Decoding yields `Result<Frame, ProtocolError>` items. An `Err` returned by
/// [`Decoder::decode`] itself is fatal for the stream; an `Err` *item* is the
/// recoverable [`ProtocolError::UnknownFrameType`], whose bytes have already
/// been consumed so the stream stays aligned.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec rejecting frames longer than `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, ProtocolError>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_BYTES {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length == 0 {
            return Err(ProtocolError::Malformed("zero-length frame".into()));
        }
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        // Need full frame
        if src.len() < LENGTH_BYTES + length {
            src.reserve(LENGTH_BYTES + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_BYTES);
        let mut frame = src.split_to(length);
        let type_byte = frame.get_u8();

        let frame_type = match FrameType::try_from(type_byte) {
            Ok(frame_type) => frame_type,
            Err(unknown) => return Ok(Some(Err(unknown))),
        };

        let frame = Frame::decode_body(frame_type, &frame)
            .map_err(|source| ProtocolError::MalformedBody { frame_type, source })?;

        Ok(Some(Ok(frame)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_type = item.frame_type();
        let body = item
            .encode_body()
            .map_err(|source| ProtocolError::Encode { frame_type, source })?;

        let length = 1 + body.len();
        if length > self.max_frame_size || length > u32::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_BYTES + length);
        dst.put_u32(length as u32);
        dst.put_u8(frame_type as u8);
        dst.put_slice(&body);

        Ok(())
    }
}
