//! Wire-format types exchanged between table peers

use super::status::GameStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Listen address of a peer in `host:port` form
pub type PeerAddr = String;

/// Protocol version string; peers must match exactly
pub type ProtocolVersion = String;

/// Poker variant a node is configured to play
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GameVariant {
    #[default]
    TexasHoldem,
    Omaha,
}

impl fmt::Display for GameVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameVariant::TexasHoldem => f.write_str("Texas Hold'em"),
            GameVariant::Omaha => f.write_str("Omaha"),
        }
    }
}

/// Every frame on the wire is one envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: PeerAddr,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(from: impl Into<PeerAddr>, payload: Payload) -> Self {
        Self {
            from: from.into(),
            payload,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// First message on every connection, sent by both sides
    Handshake(Handshake),

    /// Known listen addresses, pushed once by the accepting side
    PeerList(PeerList),

    /// The deck in flight around the table
    EncryptedDeck(EncryptedDeck),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Handshake(_) => MessageType::Handshake,
            Payload::PeerList(_) => MessageType::PeerList,
            Payload::EncryptedDeck(_) => MessageType::EncryptedDeck,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub game_variant: GameVariant,
    pub version: ProtocolVersion,
    pub game_status: GameStatus,
    pub listen_addr: PeerAddr,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerList {
    pub peers: Vec<PeerAddr>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct EncryptedDeck {
    pub deck: Vec<Vec<u8>>,
}

impl fmt::Debug for EncryptedDeck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedDeck({} cards)", self.deck.len())
    }
}

/// Directive from the game state to the node: send `payload` to each address in `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastTo {
    pub to: Vec<PeerAddr>,
    pub payload: Payload,
}

/// Message classification, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Handshake,
    PeerList,
    EncryptedDeck,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::PeerList => "peer list",
            MessageType::EncryptedDeck => "encrypted deck",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
