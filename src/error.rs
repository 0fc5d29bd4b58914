//! Error types for the table network and the shuffle protocol

use crate::deck::CardError;
use crate::p2p::{GameVariant, ProtocolVersion};

/// Reasons a handshake is refused. Only the connection that produced it is dropped.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("game variant mismatch: ours {ours}, theirs {theirs}")]
    VariantMismatch { ours: GameVariant, theirs: GameVariant },
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        ours: ProtocolVersion,
        theirs: ProtocolVersion,
    },
    #[error("expected handshake, received {0}")]
    Unexpected(&'static str),
    #[error("peer announced our own listen address {0}")]
    SelfConnection(String),
    #[error("peer announced an invalid listen address {0:?}")]
    InvalidAddress(String),
    #[error("no handshake within {0:?}")]
    Timeout(std::time::Duration),
}

/// Violations of the game state's own bookkeeping.
///
/// These indicate a logic bug rather than a network condition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    #[error("player {0} is not seated at the table")]
    PlayerNotFound(String),
    #[error("own address {0} is missing from the seating list")]
    NotSeated(String),
    #[error("address {0:?} has no numeric port")]
    InvalidAddress(String),
    #[error("deck encoding failed: {0}")]
    Deck(#[from] CardError),
}

/// Errors surfaced by the transport, peers and the node loop.
#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("failed to connect to {addr} after {attempts} attempts: {source}")]
    Connection {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] bincode::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] bincode::Error),
    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
    #[error("protocol invariant violated: {0}")]
    Protocol(#[from] GameError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("node is shut down")]
    Shutdown,
}

impl NodeError {
    /// True for errors that point at a bug in the protocol bookkeeping instead
    /// of a transient network failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, NodeError::Protocol(_))
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_is_distinguishable() {
        let fatal: NodeError = GameError::PlayerNotFound("127.0.0.1:3000".into()).into();
        assert!(fatal.is_protocol_violation());

        let transient: NodeError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(!transient.is_protocol_violation());

        let rejected: NodeError = HandshakeError::VariantMismatch {
            ours: GameVariant::TexasHoldem,
            theirs: GameVariant::Omaha,
        }
        .into();
        assert!(!rejected.is_protocol_violation());
        assert_eq!(
            rejected.to_string(),
            "handshake failed: game variant mismatch: ours Texas Hold'em, theirs Omaha"
        );
    }
}
