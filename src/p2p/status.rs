//! Per-player progress through a hand

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a player is in the current hand. Ordered from the start of a hand.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum GameStatus {
    #[default]
    WaitingForCards,
    ShuffleAndDeal,
    ReceivingCards,
    Dealing,
    PreFlop,
    Flop,
    Turn,
    River,
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GameStatus::WaitingForCards => "WAITING FOR CARDS",
            GameStatus::ShuffleAndDeal => "SHUFFLE AND DEAL",
            GameStatus::ReceivingCards => "RECEIVING CARDS",
            GameStatus::Dealing => "DEALING",
            GameStatus::PreFlop => "PREFLOP",
            GameStatus::Flop => "FLOP",
            GameStatus::Turn => "TURN",
            GameStatus::River => "RIVER",
        };
        f.write_str(s)
    }
}
