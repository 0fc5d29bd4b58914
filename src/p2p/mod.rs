//! Peer-to-peer table network
//!
//! Every node is a full peer: it listens for players, dials the ones it learns
//! about and keeps one connection to each. There is no coordinator; the seating
//! order is derived independently on every node from the listen ports.
//!
//! # Architecture
//!
//! ```text
//!  accept loop ──┐                       ┌── status ticker
//!  dial/gossip ──┤ add-peer              │
//!                ▼                       │
//!          handshake task ──► event loop ◄── receive tasks (one per peer)
//!                              │      ▲
//!                              ▼      │ broadcast directives
//!                          peer map  GameState
//! ```
//!
//! # Round Phases
//!
//! 1. **Join**: a node dials any table member, handshakes, and learns the
//!    rest of the table through peer-list gossip
//! 2. **Gate**: the dealer waits until every seated player reports
//!    `WAITING FOR CARDS`
//! 3. **Rotation**: the encrypted deck travels once around the ring, each
//!    seat re-encrypting and re-shuffling it, and ends back at the dealer

pub mod addr;
pub mod game_state;
pub mod gossip;
pub mod messages;
pub mod network;
pub mod peer;
pub mod status;
pub mod transport;

pub use game_state::{GameState, PlayerRecord, ShuffleStep};
pub use gossip::PeerListGossip;
pub use messages::{
    BroadcastTo, EncryptedDeck, Envelope, GameVariant, Handshake, MessageType, Payload, PeerAddr,
    PeerList, ProtocolVersion,
};
pub use network::{NetworkConfig, Node};
pub use peer::{Direction, Peer, PeerHandle};
pub use status::GameStatus;
pub use transport::{DialPolicy, TcpTransport};
