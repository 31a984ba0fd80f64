//! Connection handshake
//!
//! Both ends send `Hello` as soon as the transport is up and answer the
//! peer's `Hello` with either `HelloAck` or `HelloReject`. A side considers
//! the connection established once it has acknowledged the peer's `Hello`
//! and received the peer's `HelloAck`.
//!
//! [`Handshake`] is a pure state machine; [`perform_handshake`] drives it over
//! framed halves with a deadline.

use crate::framing::{Frame, FrameCodec, FrameType, ProtocolError};
use actorlink_core::{LaunchId, NodeId};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Protocol versions spoken by this build
pub const PROTOCOL_VERSIONS: VersionRange = VersionRange { min: 1, max: 1 };

/// Bound on writing the shutdown reject to a peer that may not be reading
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_millis(200);

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("incompatible protocol versions: local {local}, remote {remote}")]
    IncompatibleVersion {
        local: VersionRange,
        remote: VersionRange,
    },
    #[error("handshake timed out")]
    Timeout,
    #[error("rejected by peer ({code:?}): {message}")]
    Rejected { code: RejectCode, message: String },
    #[error("connected to self")]
    SelfConnection,
    #[error("expected node {expected}, peer is node {actual}")]
    UnexpectedNode { expected: NodeId, actual: NodeId },
    #[error("unexpected {0:?} frame during handshake")]
    UnexpectedFrame(FrameType),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection closed during handshake")]
    Closed,
    #[error("handshake cancelled")]
    Cancelled,
}

/// Inclusive range of protocol versions, `[min, max]` on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: u8,
    pub max: u8,
}

impl VersionRange {
    /// Returns `None` if `min > max`
    pub fn new(min: u8, max: u8) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    /// Pick the version both sides speak: the lower of the two maxima
    pub fn negotiate(&self, remote: &VersionRange) -> Result<u8, HandshakeError> {
        if self.max < remote.min || remote.max < self.min {
            return Err(HandshakeError::IncompatibleVersion {
                local: *self,
                remote: *remote,
            });
        }
        Ok(self.max.min(remote.max))
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Body of `Hello` and `HelloAck`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    pub versions: VersionRange,
    pub node_id: NodeId,
    pub launch_id: LaunchId,
    pub node_name: String,
    pub capabilities: BTreeSet<String>,
    /// Digest of the sender's view of the cluster, informational
    pub topology_digest: Bytes,
}

/// Reason code carried by `HelloReject`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum RejectCode {
    IncompatibleVersion,
    SelfConnection,
    UnexpectedNode,
    ShuttingDown,
    /// Code not known to this build
    Other(u8),
}

impl From<u8> for RejectCode {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::IncompatibleVersion,
            2 => Self::SelfConnection,
            3 => Self::UnexpectedNode,
            4 => Self::ShuttingDown,
            other => Self::Other(other),
        }
    }
}

impl From<RejectCode> for u8 {
    fn from(code: RejectCode) -> u8 {
        match code {
            RejectCode::IncompatibleVersion => 1,
            RejectCode::SelfConnection => 2,
            RejectCode::UnexpectedNode => 3,
            RejectCode::ShuttingDown => 4,
            RejectCode::Other(other) => other,
        }
    }
}

/// Body of `HelloReject`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub code: RejectCode,
    pub message: String,
}

impl Reject {
    pub fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Handshake progress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Initiated,
    HelloSent,
    AwaitingAck,
    Established,
    Closed,
}

/// Outcome of a successful handshake
#[derive(Clone, Debug)]
pub struct Session {
    /// Negotiated protocol version
    pub version: u8,
    /// What the peer announced about itself
    pub peer: HandshakeInfo,
}

/// What the driver should do after feeding a frame
#[derive(Debug)]
pub enum Step {
    /// Write `reply` if present and keep reading
    Continue { reply: Option<Frame> },
    /// Write `reply` if present; the connection is up
    Established {
        reply: Option<Frame>,
        session: Session,
    },
    /// Write `reply` if present, then drop the transport
    Failed {
        reply: Option<Frame>,
        error: HandshakeError,
    },
}

/// Handshake state machine for one connection
#[derive(Debug)]
pub struct Handshake {
    local: HandshakeInfo,
    expected_peer: Option<NodeId>,
    state: HandshakeState,
    /// Peer's `Hello`, once acknowledged
    peer: Option<(HandshakeInfo, u8)>,
    /// Identity carried by the peer's `HelloAck`
    acked: Option<(NodeId, LaunchId)>,
}

impl Handshake {
    pub fn new(local: HandshakeInfo, expected_peer: Option<NodeId>) -> Self {
        Self {
            local,
            expected_peer,
            state: HandshakeState::Initiated,
            peer: None,
            acked: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Produce our `Hello`
    pub fn start(&mut self) -> Frame {
        debug_assert_eq!(self.state, HandshakeState::Initiated);
        self.state = HandshakeState::HelloSent;
        Frame::Hello(self.local.clone())
    }

    /// Our `Hello` reached the transport
    pub fn hello_written(&mut self) {
        if self.state == HandshakeState::HelloSent {
            self.state = HandshakeState::AwaitingAck;
        }
    }

    /// Feed a frame received before the connection is established
    pub fn on_frame(&mut self, frame: Frame) -> Step {
        if self.state != HandshakeState::AwaitingAck {
            return self.fail(None, HandshakeError::UnexpectedFrame(frame.frame_type()));
        }

        match frame {
            Frame::Hello(info) => self.on_hello(info),
            Frame::HelloAck(info) => self.on_ack(info),
            Frame::HelloReject(reject) => self.fail(
                None,
                HandshakeError::Rejected {
                    code: reject.code,
                    message: reject.message,
                },
            ),
            other => self.fail(None, HandshakeError::UnexpectedFrame(other.frame_type())),
        }
    }

    fn on_hello(&mut self, info: HandshakeInfo) -> Step {
        if self.peer.is_some() {
            return self.fail(None, HandshakeError::UnexpectedFrame(FrameType::Hello));
        }
        if let Some(acked) = self.acked {
            if acked != (info.node_id, info.launch_id) {
                return self.fail(None, identity_mismatch());
            }
        }

        if info.node_id == self.local.node_id {
            return self.fail(
                Some(reject(RejectCode::SelfConnection, "connected to self")),
                HandshakeError::SelfConnection,
            );
        }

        if let Some(expected) = self.expected_peer {
            if expected != info.node_id {
                let message = format!("expected node {expected}, got {}", info.node_id);
                return self.fail(
                    Some(reject(RejectCode::UnexpectedNode, message)),
                    HandshakeError::UnexpectedNode {
                        expected,
                        actual: info.node_id,
                    },
                );
            }
        }

        let version = match self.local.versions.negotiate(&info.versions) {
            Ok(version) => version,
            Err(err) => {
                return self.fail(
                    Some(reject(RejectCode::IncompatibleVersion, err.to_string())),
                    err,
                )
            }
        };

        if info.topology_digest != self.local.topology_digest {
            debug!(
                "Topology digest differs from node {}: {} vs {}",
                info.node_id,
                actorlink_core::digest::short_hex(&info.topology_digest),
                actorlink_core::digest::short_hex(&self.local.topology_digest),
            );
        }

        self.peer = Some((info, version));
        let reply = Some(Frame::HelloAck(self.local.clone()));
        self.maybe_established(reply)
    }

    fn on_ack(&mut self, info: HandshakeInfo) -> Step {
        if self.acked.is_some() {
            return self.fail(None, HandshakeError::UnexpectedFrame(FrameType::HelloAck));
        }
        if let Some((hello, _)) = &self.peer {
            if hello.node_id != info.node_id || hello.launch_id != info.launch_id {
                return self.fail(None, identity_mismatch());
            }
        }
        self.acked = Some((info.node_id, info.launch_id));
        self.maybe_established(None)
    }

    fn maybe_established(&mut self, reply: Option<Frame>) -> Step {
        match (&self.peer, self.acked) {
            (Some((peer, version)), Some(_)) => {
                self.state = HandshakeState::Established;
                Step::Established {
                    reply,
                    session: Session {
                        version: *version,
                        peer: peer.clone(),
                    },
                }
            }
            _ => Step::Continue { reply },
        }
    }

    fn fail(&mut self, reply: Option<Frame>, error: HandshakeError) -> Step {
        self.state = HandshakeState::Closed;
        Step::Failed { reply, error }
    }
}

fn reject(code: RejectCode, message: impl Into<String>) -> Frame {
    Frame::HelloReject(Reject::new(code, message))
}

fn identity_mismatch() -> HandshakeError {
    ProtocolError::Malformed("HelloAck identity differs from Hello".into()).into()
}

/// Run the handshake over framed transport halves
///
/// Fails with [`HandshakeError::Timeout`] if not established within
/// `timeout`. Any frame that is not part of the handshake, including an
/// unknown frame type, aborts it. When `cancel` fires first the peer is told
/// with a `ShuttingDown` reject.
pub async fn perform_handshake<R, W>(
    reader: &mut FramedRead<R, FrameCodec>,
    writer: &mut FramedWrite<W, FrameCodec>,
    handshake: Handshake,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Session, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        result = tokio::time::timeout(timeout, drive(reader, writer, handshake)) => {
            Some(result.unwrap_or(Err(HandshakeError::Timeout)))
        }
    };

    match outcome {
        Some(result) => result,
        None => {
            let frame = reject(RejectCode::ShuttingDown, "node is shutting down");
            if let Ok(Err(err)) = tokio::time::timeout(REJECT_WRITE_TIMEOUT, writer.send(frame)).await {
                debug!("Failed to send shutdown reject: {}", err);
            }
            Err(HandshakeError::Cancelled)
        }
    }
}

async fn drive<R, W>(
    reader: &mut FramedRead<R, FrameCodec>,
    writer: &mut FramedWrite<W, FrameCodec>,
    mut handshake: Handshake,
) -> Result<Session, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.send(handshake.start()).await?;
    handshake.hello_written();

    loop {
        let frame = match reader.next().await {
            None => return Err(HandshakeError::Closed),
            Some(Err(err)) => return Err(err.into()),
            Some(Ok(Err(unknown))) => return Err(unknown.into()),
            Some(Ok(Ok(frame))) => frame,
        };

        match handshake.on_frame(frame) {
            Step::Continue { reply } => {
                if let Some(reply) = reply {
                    writer.send(reply).await?;
                }
            }
            Step::Established { reply, session } => {
                if let Some(reply) = reply {
                    writer.send(reply).await?;
                }
                return Ok(session);
            }
            Step::Failed { reply, error } => {
                if let Some(reply) = reply {
                    // best effort, the error below is what matters
                    let _ = writer.send(reply).await;
                }
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(node: u16, versions: (u8, u8)) -> HandshakeInfo {
        HandshakeInfo {
            versions: VersionRange::new(versions.0, versions.1).unwrap(),
            node_id: NodeId::new(node).unwrap(),
            launch_id: LaunchId::from_bits(u64::from(node) * 1000),
            node_name: format!("node-{node}"),
            capabilities: BTreeSet::new(),
            topology_digest: Bytes::from_static(&[0; 32]),
        }
    }

    fn started(local: HandshakeInfo, expected: Option<u16>) -> Handshake {
        let mut hs = Handshake::new(local, expected.map(|n| NodeId::new(n).unwrap()));
        assert!(matches!(hs.start(), Frame::Hello(_)));
        hs.hello_written();
        assert_eq!(hs.state(), HandshakeState::AwaitingAck);
        hs
    }

    #[test]
    fn test_negotiate_picks_lower_max() {
        let local = VersionRange::new(1, 3).unwrap();
        let remote = VersionRange::new(2, 5).unwrap();
        assert_eq!(local.negotiate(&remote).unwrap(), 3);
        assert_eq!(remote.negotiate(&local).unwrap(), 3);

        let narrow = VersionRange::new(2, 2).unwrap();
        assert_eq!(local.negotiate(&narrow).unwrap(), 2);
    }

    #[test]
    fn test_negotiate_disjoint() {
        let local = VersionRange::new(1, 2).unwrap();
        let remote = VersionRange::new(3, 4).unwrap();
        assert!(matches!(
            local.negotiate(&remote),
            Err(HandshakeError::IncompatibleVersion { .. })
        ));
        assert!(VersionRange::new(3, 2).is_none());
    }

    #[test]
    fn test_hello_then_ack() {
        let mut hs = started(info(1, (1, 3)), None);

        let step = hs.on_frame(Frame::Hello(info(2, (2, 5))));
        assert!(matches!(
            step,
            Step::Continue {
                reply: Some(Frame::HelloAck(_))
            }
        ));
        assert_eq!(hs.state(), HandshakeState::AwaitingAck);

        match hs.on_frame(Frame::HelloAck(info(2, (2, 5)))) {
            Step::Established { reply, session } => {
                assert!(reply.is_none());
                assert_eq!(session.version, 3);
                assert_eq!(session.peer.node_id, NodeId::new(2).unwrap());
            }
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(hs.state(), HandshakeState::Established);
    }

    #[test]
    fn test_ack_then_hello() {
        let mut hs = started(info(1, (1, 1)), Some(2));
        assert!(matches!(
            hs.on_frame(Frame::HelloAck(info(2, (1, 1)))),
            Step::Continue { reply: None }
        ));
        assert!(matches!(
            hs.on_frame(Frame::Hello(info(2, (1, 1)))),
            Step::Established {
                reply: Some(Frame::HelloAck(_)),
                ..
            }
        ));
    }

    #[test]
    fn test_ack_identity_checked_in_either_order() {
        let mut other_launch = info(2, (1, 1));
        other_launch.launch_id = LaunchId::from_bits(42);

        // Hello first, then a HelloAck from another incarnation
        let mut hs = started(info(1, (1, 1)), None);
        hs.on_frame(Frame::Hello(info(2, (1, 1))));
        assert!(matches!(
            hs.on_frame(Frame::HelloAck(other_launch.clone())),
            Step::Failed {
                error: HandshakeError::Protocol(ProtocolError::Malformed(_)),
                ..
            }
        ));

        // HelloAck first, then a Hello from another incarnation
        let mut hs = started(info(1, (1, 1)), None);
        hs.on_frame(Frame::HelloAck(other_launch));
        assert!(matches!(
            hs.on_frame(Frame::Hello(info(2, (1, 1)))),
            Step::Failed {
                reply: None,
                error: HandshakeError::Protocol(ProtocolError::Malformed(_)),
            }
        ));
        assert_eq!(hs.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let mut hs = started(info(1, (1, 2)), None);
        match hs.on_frame(Frame::Hello(info(2, (3, 4)))) {
            Step::Failed {
                reply: Some(Frame::HelloReject(reject)),
                error: HandshakeError::IncompatibleVersion { .. },
            } => assert_eq!(reject.code, RejectCode::IncompatibleVersion),
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(hs.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_self_connection_rejected() {
        let mut hs = started(info(1, (1, 1)), None);
        assert!(matches!(
            hs.on_frame(Frame::Hello(info(1, (1, 1)))),
            Step::Failed {
                reply: Some(Frame::HelloReject(Reject {
                    code: RejectCode::SelfConnection,
                    ..
                })),
                error: HandshakeError::SelfConnection,
            }
        ));
    }

    #[test]
    fn test_unexpected_node_rejected() {
        let mut hs = started(info(1, (1, 1)), Some(3));
        assert!(matches!(
            hs.on_frame(Frame::Hello(info(2, (1, 1)))),
            Step::Failed {
                error: HandshakeError::UnexpectedNode { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_data_before_established_is_violation() {
        let mut hs = started(info(1, (1, 1)), None);
        assert!(matches!(
            hs.on_frame(Frame::heartbeat()),
            Step::Failed {
                reply: None,
                error: HandshakeError::UnexpectedFrame(FrameType::Heartbeat),
            }
        ));
    }

    #[test]
    fn test_peer_reject_surfaces_code() {
        let mut hs = started(info(1, (1, 1)), None);
        match hs.on_frame(Frame::HelloReject(Reject::new(RejectCode::Other(99), "nope"))) {
            Step::Failed {
                error: HandshakeError::Rejected { code, message },
                ..
            } => {
                assert_eq!(code, RejectCode::Other(99));
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_hello_is_violation() {
        let mut hs = started(info(1, (1, 1)), None);
        hs.on_frame(Frame::Hello(info(2, (1, 1))));
        assert!(matches!(
            hs.on_frame(Frame::Hello(info(2, (1, 1)))),
            Step::Failed {
                error: HandshakeError::UnexpectedFrame(FrameType::Hello),
                ..
            }
        ));
    }

    fn framed(
        stream: tokio::io::DuplexStream,
    ) -> (
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, FrameCodec>,
        FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, FrameCodec>,
    ) {
        let (r, w) = tokio::io::split(stream);
        (
            FramedRead::new(r, FrameCodec::new()),
            FramedWrite::new(w, FrameCodec::new()),
        )
    }

    #[tokio::test]
    async fn test_perform_handshake_over_duplex() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut ar, mut aw) = framed(a);
        let (mut br, mut bw) = framed(b);
        let cancel = CancellationToken::new();
        let timeout = Duration::from_secs(5);

        let (left, right) = tokio::join!(
            perform_handshake(
                &mut ar,
                &mut aw,
                Handshake::new(info(1, (1, 2)), Some(NodeId::new(2).unwrap())),
                timeout,
                &cancel,
            ),
            perform_handshake(
                &mut br,
                &mut bw,
                Handshake::new(info(2, (1, 1)), None),
                timeout,
                &cancel,
            ),
        );

        let left = left.unwrap();
        let right = right.unwrap();
        assert_eq!(left.version, 1);
        assert_eq!(right.version, 1);
        assert_eq!(left.peer.node_id, NodeId::new(2).unwrap());
        assert_eq!(right.peer.node_id, NodeId::new(1).unwrap());
    }

    #[tokio::test]
    async fn test_perform_handshake_times_out() {
        let (a, _silent) = tokio::io::duplex(64 * 1024);
        let (mut ar, mut aw) = framed(a);

        let err = perform_handshake(
            &mut ar,
            &mut aw,
            Handshake::new(info(1, (1, 1)), None),
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, HandshakeError::Timeout));
    }

    #[tokio::test]
    async fn test_unknown_frame_before_established_is_fatal() {
        use tokio::io::AsyncWriteExt;

        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let (mut ar, mut aw) = framed(a);
        // type 0x7f with a one byte body
        raw.write_all(&[0, 0, 0, 2, 0x7f, 0]).await.unwrap();

        let err = perform_handshake(
            &mut ar,
            &mut aw,
            Handshake::new(info(1, (1, 1)), None),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            HandshakeError::Protocol(ProtocolError::UnknownFrameType(0x7f))
        ));
    }

    #[tokio::test]
    async fn test_cancel_sends_shutting_down_reject() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut ar, mut aw) = framed(a);
        let (mut br, _bw) = framed(b);
        let cancel = CancellationToken::new();

        let local = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                perform_handshake(
                    &mut ar,
                    &mut aw,
                    Handshake::new(info(1, (1, 1)), None),
                    Duration::from_secs(30),
                    &cancel,
                )
                .await
            }
        });

        assert!(matches!(br.next().await, Some(Ok(Ok(Frame::Hello(_))))));
        cancel.cancel();

        match br.next().await {
            Some(Ok(Ok(Frame::HelloReject(reject)))) => {
                assert_eq!(reject.code, RejectCode::ShuttingDown)
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(matches!(
            local.await.unwrap(),
            Err(HandshakeError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_rejected_peer_sees_reason() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut ar, mut aw) = framed(a);
        let (mut br, mut bw) = framed(b);
        let cancel = CancellationToken::new();
        let timeout = Duration::from_secs(5);

        let (left, right) = tokio::join!(
            perform_handshake(
                &mut ar,
                &mut aw,
                Handshake::new(info(1, (1, 1)), None),
                timeout,
                &cancel,
            ),
            perform_handshake(
                &mut br,
                &mut bw,
                Handshake::new(info(2, (2, 2)), None),
                timeout,
                &cancel,
            ),
        );

        assert!(matches!(
            left.unwrap_err(),
            HandshakeError::IncompatibleVersion { .. } | HandshakeError::Rejected { .. }
        ));
        assert!(matches!(
            right.unwrap_err(),
            HandshakeError::IncompatibleVersion { .. } | HandshakeError::Rejected { .. }
        ));
    }
}
