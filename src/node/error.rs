//! Error taxonomy of the exchange core.
//!
//! Recoverable errors are returned to the originating caller; protocol
//! violations close the connection and become its close reason.

use thiserror::Error;

use crate::container::ContainerError;
use crate::core::ObjectKey;

use super::msg::MsgDecodeError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// A request did not receive its reply in time.
    #[error("timeout")]
    Timeout,
    /// Operation attempted on a closed connection or node.
    #[error("connection closed")]
    Closed,
    /// The remote peer refused our subscription.
    #[error("subscription rejected by remote peer: {0}")]
    SubscriptionRejected(String),
    /// The remote peer does not serve its feed list.
    #[error("request list of feeds from non-public peer")]
    NonPublicPeer,
    /// A reply's type did not match its request's contract.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// An error string sent by the remote peer.
    #[error("remote error: {0}")]
    Remote(String),
    #[error("dial failed: {0}")]
    Dial(String),
    /// Fatal to the connection.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Container(#[from] ContainerError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error(transparent)]
    Decode(#[from] MsgDecodeError),
    #[error("blank feed in control message")]
    BlankFeed,
    #[error("object hash mismatch for {key}")]
    ObjectHashMismatch { key: ObjectKey },
    #[error("unexpected handshake message")]
    UnexpectedHandshake,
    #[error("unsupported protocol version {got}, ours is {ours}")]
    VersionMismatch { got: u32, ours: u32 },
}

impl NodeError {
    /// Whether this error closes the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Protocol(_))
    }
}
