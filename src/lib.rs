//! Mental Poker Table Network
//!
//! Peer-to-peer networking for a mental-poker table: players find each other,
//! agree on a seating order without a coordinator, and pass an encrypted deck
//! around the ring so that every player shuffles and encrypts it once before
//! any card is dealt.
//!
//! ## Key Components
//!
//! - **Transport**: TCP accept and dial with bounded retry
//! - **Peers**: length-prefixed bincode envelopes, one receive task per connection
//! - **Node**: handshake, peer-list gossip and the central event loop
//! - **Game state**: seating by port, the round-start gate and the shuffle rotation
//! - **Deck and cipher**: the card encoding and the commutative cipher each seat applies
//!
//! ## Example
//!
//! ```rust,no_run
//! use mental_poker_p2p::p2p::{NetworkConfig, Node};
//!
//! # async fn run() -> mental_poker_p2p::error::NodeResult<()> {
//! let dealer = Node::start(NetworkConfig {
//!     dealer: true,
//!     ..NetworkConfig::default()
//! })
//! .await?;
//! let player = Node::start(NetworkConfig::default()).await?;
//!
//! // joining any one member is enough; gossip does the rest
//! player.connect(dealer.listen_addr()).await?;
//! # Ok(())
//! # }
//! ```

pub mod deck;
pub mod encryption;
pub mod error;
pub mod p2p;

pub use error::{GameError, HandshakeError, NodeError, NodeResult};
