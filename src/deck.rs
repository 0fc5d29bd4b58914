//! Playing cards and the 52-card deck that travels around the table

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of cards in a full deck.
pub const DECK_SIZE: usize = 52;

/// Highest rank; aces are rank 1.
pub const MAX_RANK: u8 = 13;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CardError {
    #[error("card rank {0} is outside 1..=13")]
    InvalidRank(u8),
    #[error("card encoding error: {0}")]
    Encoding(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Suit {
    Spades,
    Hearts,
    Diamonds,
    Clubs,
}

impl Suit {
    pub const ALL: [Suit; 4] = [Suit::Spades, Suit::Hearts, Suit::Diamonds, Suit::Clubs];

    pub fn symbol(self) -> char {
        match self {
            Suit::Spades => '♠',
            Suit::Hearts => '♥',
            Suit::Diamonds => '♦',
            Suit::Clubs => '♣',
        }
    }
}

impl fmt::Display for Suit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Suit::Spades => "SPADES",
            Suit::Hearts => "HEARTS",
            Suit::Diamonds => "DIAMONDS",
            Suit::Clubs => "CLUBS",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Card {
    suit: Suit,
    rank: u8,
}

impl Card {
    pub fn new(suit: Suit, rank: u8) -> Result<Self, CardError> {
        if !(1..=MAX_RANK).contains(&rank) {
            return Err(CardError::InvalidRank(rank));
        }
        Ok(Self { suit, rank })
    }

    pub fn suit(&self) -> Suit {
        self.suit
    }

    pub fn rank(&self) -> u8 {
        self.rank
    }

    /// Serialize into the opaque block carried by an encrypted deck.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CardError> {
        bincode::serialize(self).map_err(|e| CardError::Encoding(e.to_string()))
    }

    /// Inverse of [`Card::to_bytes`]; rejects blocks that decode to an invalid rank.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CardError> {
        let card: Card =
            bincode::deserialize(bytes).map_err(|e| CardError::Encoding(e.to_string()))?;
        Card::new(card.suit, card.rank)
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rank == 1 {
            write!(f, "ACE of {} {}", self.suit, self.suit.symbol())
        } else {
            write!(f, "{} of {} {}", self.rank, self.suit, self.suit.symbol())
        }
    }
}

/// A full deck of 52 unique cards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deck {
    cards: Vec<Card>,
}

impl Deck {
    /// Suit-major, rank-minor order.
    pub fn ordered() -> Self {
        let cards = Suit::ALL
            .iter()
            .flat_map(|&suit| (1..=MAX_RANK).map(move |rank| Card { suit, rank }))
            .collect();
        Self { cards }
    }

    pub fn new_shuffled() -> Self {
        Self::shuffled_with(&mut rand::rng())
    }

    pub fn shuffled_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut deck = Self::ordered();
        deck.cards.shuffle(rng);
        deck
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// One opaque block per card, in deck order.
    pub fn encode(&self) -> Result<Vec<Vec<u8>>, CardError> {
        self.cards.iter().map(Card::to_bytes).collect()
    }
}
