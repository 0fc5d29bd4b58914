//! Distributed game state: who is seated, in what order, and where the shuffle
//! rotation stands.
//!
//! The table is a ring sorted by listen port. A round starts at the dealer once
//! every seated player reports [`GameStatus::WaitingForCards`]; the dealer sends
//! the encrypted deck to the next seat, every other seat re-shuffles and
//! re-encrypts it and passes it on, and the round's shuffle phase ends when the
//! deck comes back to the dealer from its predecessor.
//!
//! All mutation happens on the node's event loop, so a status update and the
//! round-start check that follows it form one unit.

use super::addr;
use super::messages::{BroadcastTo, EncryptedDeck, Payload, PeerAddr};
use super::status::GameStatus;
use crate::deck::Deck;
use crate::encryption::{self, DeckCipher};
use crate::error::GameError;
use blake2::{Blake2b512, Digest};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A seated player as seen from this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub listen_addr: PeerAddr,
    pub status: GameStatus,
}

impl fmt::Display for PlayerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.listen_addr, self.status)
    }
}

/// What happened to an incoming encrypted deck
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShuffleStep {
    /// Re-encrypted and passed to the next seat
    Forwarded { to: PeerAddr },
    /// Back at the dealer: every seat has shuffled once
    Completed,
}

pub struct GameState {
    listen_addr: PeerAddr,
    is_dealer: bool,
    min_players: usize,
    status: GameStatus,

    /// Lookup by listen address
    players: HashMap<PeerAddr, PlayerRecord>,

    /// Seating order; always holds exactly the keys of `players`
    table: Vec<PeerAddr>,

    broadcast_tx: mpsc::UnboundedSender<BroadcastTo>,
    cipher: Arc<dyn DeckCipher>,

    rounds_started: usize,
    completed_deck: Option<Vec<Vec<u8>>>,
}

impl GameState {
    pub fn new(
        listen_addr: &str,
        is_dealer: bool,
        min_players: usize,
        cipher: Arc<dyn DeckCipher>,
        broadcast_tx: mpsc::UnboundedSender<BroadcastTo>,
    ) -> Result<Self, GameError> {
        let listen_addr = normalize(listen_addr)?;
        let mut state = Self {
            listen_addr: listen_addr.clone(),
            is_dealer,
            // a ring of one has nobody to pass the deck to
            min_players: min_players.max(2),
            status: GameStatus::WaitingForCards,
            players: HashMap::new(),
            table: Vec::new(),
            broadcast_tx,
            cipher,
            rounds_started: 0,
            completed_deck: None,
        };
        state.add_player(&listen_addr, GameStatus::WaitingForCards)?;
        Ok(state)
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    pub fn is_dealer(&self) -> bool {
        self.is_dealer
    }

    pub fn rounds_started(&self) -> usize {
        self.rounds_started
    }

    /// The deck as it returned to the dealer at the end of the last rotation
    pub fn completed_deck(&self) -> Option<&[Vec<u8>]> {
        self.completed_deck.as_deref()
    }

    /// Seating order
    pub fn table(&self) -> &[PeerAddr] {
        &self.table
    }

    /// Seated players in seating order
    pub fn players(&self) -> Vec<PlayerRecord> {
        self.table
            .iter()
            .filter_map(|a| self.players.get(a).cloned())
            .collect()
    }

    pub fn len_players(&self) -> usize {
        self.players.len()
    }

    pub fn player_status(&self, addr: &str) -> Option<GameStatus> {
        let addr = addr::normalize(addr)?;
        self.players.get(&addr).map(|p| p.status)
    }

    /// Mark this node as dealer and re-check the round-start gate.
    pub fn set_dealer(&mut self, is_dealer: bool) -> Result<bool, GameError> {
        self.is_dealer = is_dealer;
        self.check_status()
    }

    /// Seat a player, or refresh its status if already seated.
    pub fn add_player(&mut self, addr: &str, status: GameStatus) -> Result<(), GameError> {
        let addr = normalize(addr)?;
        if !self.players.contains_key(&addr) {
            self.players.insert(
                addr.clone(),
                PlayerRecord {
                    listen_addr: addr.clone(),
                    status,
                },
            );
            self.table.push(addr.clone());
            self.table.sort_by(|a, b| addr::seat_key(a).cmp(&addr::seat_key(b)));
            info!(addr = %addr, status = %status, "new player joined");
        }
        self.set_player_status(&addr, status)
    }

    /// Unseat a player whose connection is gone, then re-check the gate.
    ///
    /// Returns whether a record was removed. Our own seat is never removed.
    pub fn remove_player(&mut self, addr: &str) -> Result<bool, GameError> {
        let addr = normalize(addr)?;
        if addr == self.listen_addr || self.players.remove(&addr).is_none() {
            return Ok(false);
        }
        self.table.retain(|a| a != &addr);
        info!(addr = %addr, players = self.table.len(), "player left the table");
        self.check_status()?;
        Ok(true)
    }

    /// Update a seated player's status and re-check the round-start gate.
    pub fn set_player_status(&mut self, addr: &str, status: GameStatus) -> Result<(), GameError> {
        let key = addr::normalize(addr).unwrap_or_else(|| addr.to_string());
        let player = self
            .players
            .get_mut(&key)
            .ok_or(GameError::PlayerNotFound(key.clone()))?;
        player.status = status;
        self.check_status()?;
        Ok(())
    }

    /// Update our own status.
    pub fn set_status(&mut self, status: GameStatus) -> Result<(), GameError> {
        if self.status != status {
            self.status = status;
            let own = self.listen_addr.clone();
            self.set_player_status(&own, status)?;
        }
        Ok(())
    }

    pub fn players_waiting_for_cards(&self) -> usize {
        self.players
            .values()
            .filter(|p| p.status == GameStatus::WaitingForCards)
            .count()
    }

    /// Seated players in `status`, in seating order
    pub fn players_with_status(&self, status: GameStatus) -> Vec<PeerAddr> {
        self.table
            .iter()
            .filter(|a| self.players.get(*a).map(|p| p.status) == Some(status))
            .cloned()
            .collect()
    }

    /// Round-start gate. Returns true if this call started a round.
    pub fn check_status(&mut self) -> Result<bool, GameError> {
        let total = self.players.len();
        let ready = self.is_dealer
            && self.status == GameStatus::WaitingForCards
            && total >= self.min_players
            && self.players_waiting_for_cards() == total;

        if !ready {
            return Ok(false);
        }

        info!(addr = %self.listen_addr, players = total, "deal cards");
        self.initiate_shuffle_and_deal()?;
        Ok(true)
    }

    pub fn position_on_table(&self) -> Result<usize, GameError> {
        self.table
            .iter()
            .position(|a| a == &self.listen_addr)
            .ok_or_else(|| GameError::NotSeated(self.listen_addr.clone()))
    }

    pub fn next_position_on_table(&self) -> Result<usize, GameError> {
        let i = self.position_on_table()?;
        Ok((i + 1) % self.table.len())
    }

    pub fn prev_position_on_table(&self) -> Result<usize, GameError> {
        let i = self.position_on_table()?;
        let n = self.table.len();
        Ok((i + n - 1) % n)
    }

    fn next_player(&self) -> Result<PeerAddr, GameError> {
        Ok(self.table[self.next_position_on_table()?].clone())
    }

    fn prev_player(&self) -> Result<PeerAddr, GameError> {
        Ok(self.table[self.prev_position_on_table()?].clone())
    }

    /// Dealer side: seed the rotation and hand the deck to the next seat.
    pub fn initiate_shuffle_and_deal(&mut self) -> Result<(), GameError> {
        let deal_to = self.next_player()?;
        let plain = Deck::new_shuffled().encode()?;
        let deck = encryption::shuffle_and_encrypt(&*self.cipher, &plain, &mut rand::rng());

        self.rounds_started += 1;
        self.completed_deck = None;
        self.set_status(GameStatus::ShuffleAndDeal)?;
        self.send_to_player(&deal_to, Payload::EncryptedDeck(EncryptedDeck { deck }));
        Ok(())
    }

    /// Handle an encrypted deck arriving from `from`.
    pub fn shuffle_and_encrypt(
        &mut self,
        from: &str,
        deck: Vec<Vec<u8>>,
    ) -> Result<ShuffleStep, GameError> {
        self.set_player_status(from, GameStatus::ShuffleAndDeal)?;
        let from = normalize(from)?;

        if self.is_dealer && self.prev_player()? == from {
            info!(
                addr = %self.listen_addr,
                cards = deck.len(),
                fingerprint = %fingerprint(&deck),
                "end shuffle cycle"
            );
            self.completed_deck = Some(deck);
            return Ok(ShuffleStep::Completed);
        }
        if self.is_dealer {
            warn!(from = %from, "deck reached the dealer out of turn");
        }

        let deal_to = self.next_player()?;
        let deck = encryption::shuffle_and_encrypt(&*self.cipher, &deck, &mut rand::rng());
        self.send_to_player(&deal_to, Payload::EncryptedDeck(EncryptedDeck { deck }));
        self.set_status(GameStatus::ShuffleAndDeal)?;
        Ok(ShuffleStep::Forwarded { to: deal_to })
    }

    pub fn send_to_player(&self, addr: &str, payload: Payload) {
        debug!(player = %addr, kind = %payload.message_type(), "sending payload to player");
        self.broadcast(vec![addr.to_string()], payload);
    }

    pub fn send_to_players_with_status(&self, payload: Payload, status: GameStatus) {
        let players: Vec<PeerAddr> = self
            .players_with_status(status)
            .into_iter()
            .filter(|a| a != &self.listen_addr)
            .collect();
        debug!(players = ?players, kind = %payload.message_type(), "sending to players");
        self.broadcast(players, payload);
    }

    fn broadcast(&self, to: Vec<PeerAddr>, payload: Payload) {
        if self.broadcast_tx.send(BroadcastTo { to, payload }).is_err() {
            warn!(addr = %self.listen_addr, "broadcast channel closed");
        }
    }
}

impl fmt::Debug for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameState")
            .field("listen_addr", &self.listen_addr)
            .field("is_dealer", &self.is_dealer)
            .field("status", &self.status)
            .field("players", &self.players())
            .finish()
    }
}

fn normalize(addr: &str) -> Result<PeerAddr, GameError> {
    addr::normalize(addr).ok_or_else(|| GameError::InvalidAddress(addr.to_string()))
}

/// Short digest of a deck for log lines
fn fingerprint(deck: &[Vec<u8>]) -> String {
    let mut hasher = Blake2b512::new();
    for block in deck {
        hasher.update((block.len() as u32).to_be_bytes());
        hasher.update(block);
    }
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deck::{Card, DECK_SIZE};
    use crate::encryption::{decrypt_deck, XorStreamCipher};
    use std::collections::{HashSet, VecDeque};

    fn state(
        addr: &str,
        is_dealer: bool,
        min_players: usize,
    ) -> (GameState, mpsc::UnboundedReceiver<BroadcastTo>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = GameState::new(
            addr,
            is_dealer,
            min_players,
            Arc::new(XorStreamCipher::random()),
            tx,
        )
        .unwrap();
        (state, rx)
    }

    fn addrs(ports: &[u16]) -> Vec<String> {
        ports.iter().map(|p| format!("127.0.0.1:{p}")).collect()
    }

    #[test]
    fn test_seating_sorted_by_port() {
        let (mut a, _rx) = state("127.0.0.1:5000", false, 2);
        for addr in addrs(&[8000, 3000, 40000, 4000]) {
            a.add_player(&addr, GameStatus::WaitingForCards).unwrap();
        }
        assert_eq!(a.table(), addrs(&[3000, 4000, 5000, 8000, 40000]).as_slice());
        assert_eq!(a.position_on_table().unwrap(), 2);
        assert_eq!(a.next_position_on_table().unwrap(), 3);
        assert_eq!(a.prev_position_on_table().unwrap(), 1);
    }

    #[test]
    fn test_seating_identical_on_every_node() {
        let all = addrs(&[7000, 3000, 5000, 4000, 6000]);
        let mut tables = Vec::new();
        for (i, own) in all.iter().enumerate() {
            let (mut s, _rx) = state(own, false, 2);
            // every node learns the others in a different order
            for other in all.iter().cycle().skip(i).take(all.len()) {
                s.add_player(other, GameStatus::WaitingForCards).unwrap();
            }
            tables.push(s.table().to_vec());
        }
        assert!(tables.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(tables[0], addrs(&[3000, 4000, 5000, 6000, 7000]));
    }

    #[test]
    fn test_duplicate_and_unnormalized_addresses_seat_once() {
        let (mut a, _rx) = state("127.0.0.1:3000", false, 2);
        a.add_player(" 127.0.0.1:4000", GameStatus::WaitingForCards).unwrap();
        a.add_player("127.0.0.1:4000", GameStatus::PreFlop).unwrap();
        assert_eq!(a.table().len(), 2);
        assert_eq!(a.len_players(), 2);
        assert_eq!(a.player_status("127.0.0.1:4000"), Some(GameStatus::PreFlop));
    }

    #[test]
    fn test_wrap_around_positions() {
        let (mut a, _rx) = state("127.0.0.1:9000", false, 2);
        a.add_player("127.0.0.1:1000", GameStatus::WaitingForCards).unwrap();
        assert_eq!(a.position_on_table().unwrap(), 1);
        assert_eq!(a.next_position_on_table().unwrap(), 0);
        assert_eq!(a.prev_position_on_table().unwrap(), 0);
    }

    #[test]
    fn test_unknown_player_is_protocol_error() {
        let (mut a, _rx) = state("127.0.0.1:3000", false, 2);
        assert_eq!(
            a.set_player_status("127.0.0.1:4000", GameStatus::Flop),
            Err(GameError::PlayerNotFound("127.0.0.1:4000".into()))
        );
        assert!(matches!(
            a.shuffle_and_encrypt("127.0.0.1:4000", vec![]),
            Err(GameError::PlayerNotFound(_))
        ));
        assert_eq!(
            a.add_player("nowhere", GameStatus::WaitingForCards),
            Err(GameError::InvalidAddress("nowhere".into()))
        );
    }

    #[test]
    fn test_gate_needs_dealer() {
        let (mut a, mut rx) = state("127.0.0.1:3000", false, 2);
        a.add_player("127.0.0.1:4000", GameStatus::WaitingForCards).unwrap();
        assert!(!a.check_status().unwrap());
        assert_eq!(a.status(), GameStatus::WaitingForCards);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_gate_waits_for_last_player() {
        let (mut a, mut rx) = state("127.0.0.1:3000", true, 2);
        a.add_player("127.0.0.1:4000", GameStatus::WaitingForCards).unwrap();
        // that seated the second player and fired; start a fresh round to check the short case
        assert_eq!(a.rounds_started(), 1);
        rx.try_recv().unwrap();

        let (mut d, mut rx) = state("127.0.0.1:3000", true, 2);
        d.add_player("127.0.0.1:4000", GameStatus::Flop).unwrap();
        d.add_player("127.0.0.1:5000", GameStatus::WaitingForCards).unwrap();
        assert_eq!(d.players_waiting_for_cards(), 2);
        assert!(!d.check_status().unwrap());
        assert!(rx.try_recv().is_err());

        d.set_player_status("127.0.0.1:4000", GameStatus::WaitingForCards)
            .unwrap();
        assert_eq!(d.rounds_started(), 1);
        assert_eq!(d.status(), GameStatus::ShuffleAndDeal);

        let directive = rx.try_recv().unwrap();
        assert_eq!(directive.to, vec!["127.0.0.1:4000".to_string()]);
        match directive.payload {
            Payload::EncryptedDeck(deck) => assert_eq!(deck.deck.len(), DECK_SIZE),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_gate_fires_once() {
        let (mut d, mut rx) = state("127.0.0.1:3000", true, 3);
        d.add_player("127.0.0.1:4000", GameStatus::WaitingForCards).unwrap();
        assert_eq!(d.rounds_started(), 0);
        d.add_player("127.0.0.1:5000", GameStatus::WaitingForCards).unwrap();
        assert_eq!(d.rounds_started(), 1);

        for _ in 0..3 {
            assert!(!d.check_status().unwrap());
        }
        d.set_player_status("127.0.0.1:5000", GameStatus::WaitingForCards)
            .unwrap();
        assert_eq!(d.rounds_started(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_gate_needs_min_players() {
        let (mut d, mut rx) = state("127.0.0.1:3000", true, 2);
        assert!(!d.check_status().unwrap());
        assert!(rx.try_recv().is_err());

        assert!(!d.set_dealer(true).unwrap());
        d.add_player("127.0.0.1:4000", GameStatus::WaitingForCards).unwrap();
        assert_eq!(d.rounds_started(), 1);
    }

    #[test]
    fn test_set_dealer_rechecks_gate() {
        let (mut d, mut rx) = state("127.0.0.1:3000", false, 2);
        d.add_player("127.0.0.1:4000", GameStatus::WaitingForCards).unwrap();
        assert!(rx.try_recv().is_err());

        assert!(d.set_dealer(true).unwrap());
        assert!(d.is_dealer());
        assert_eq!(rx.try_recv().unwrap().to, vec!["127.0.0.1:4000".to_string()]);
    }

    #[test]
    fn test_send_to_players_with_status() {
        let (mut a, mut rx) = state("127.0.0.1:3000", false, 2);
        a.add_player("127.0.0.1:5000", GameStatus::Flop).unwrap();
        a.add_player("127.0.0.1:4000", GameStatus::Flop).unwrap();
        a.add_player("127.0.0.1:6000", GameStatus::Turn).unwrap();

        a.send_to_players_with_status(Payload::EncryptedDeck(EncryptedDeck::default()), GameStatus::Flop);
        let directive = rx.try_recv().unwrap();
        assert_eq!(directive.to, addrs(&[4000, 5000]));
    }

    #[test]
    fn test_remove_player_keeps_table_in_sync() {
        let (mut a, _rx) = state("127.0.0.1:4000", false, 2);
        a.add_player("127.0.0.1:3000", GameStatus::WaitingForCards).unwrap();
        a.add_player("127.0.0.1:5000", GameStatus::WaitingForCards).unwrap();
        assert_eq!(a.position_on_table().unwrap(), 1);

        assert!(a.remove_player(" 127.0.0.1:3000").unwrap());
        assert_eq!(a.table(), addrs(&[4000, 5000]).as_slice());
        assert_eq!(a.len_players(), 2);
        assert_eq!(a.player_status("127.0.0.1:3000"), None);
        assert_eq!(a.position_on_table().unwrap(), 0);
        assert_eq!(a.prev_position_on_table().unwrap(), 1);

        assert!(!a.remove_player("127.0.0.1:3000").unwrap());
        assert!(!a.remove_player("127.0.0.1:4000").unwrap());
        assert_eq!(a.table().len(), 2);
    }

    #[test]
    fn test_departed_player_leaves_the_ring() {
        // 3000 leaves before 5000 joins, then 4000 becomes dealer
        let (mut b, mut rx) = state("127.0.0.1:4000", false, 2);
        b.add_player("127.0.0.1:3000", GameStatus::WaitingForCards).unwrap();
        b.remove_player("127.0.0.1:3000").unwrap();
        b.add_player("127.0.0.1:5000", GameStatus::WaitingForCards).unwrap();

        assert!(b.set_dealer(true).unwrap());
        let directive = rx.try_recv().unwrap();
        assert_eq!(directive.to, addrs(&[5000]));

        let deck = match directive.payload {
            Payload::EncryptedDeck(deck) => deck.deck,
            other => panic!("unexpected payload {other:?}"),
        };
        assert_eq!(
            b.shuffle_and_encrypt("127.0.0.1:5000", deck).unwrap(),
            ShuffleStep::Completed
        );
        assert!(b.completed_deck().is_some());
        assert!(rx.try_recv().is_err());

        // a deck from a player who already left is refused
        assert!(matches!(
            b.shuffle_and_encrypt("127.0.0.1:3000", vec![]),
            Err(GameError::PlayerNotFound(_))
        ));
    }

    struct Seat {
        state: GameState,
        rx: mpsc::UnboundedReceiver<BroadcastTo>,
        cipher: Arc<XorStreamCipher>,
    }

    /// Seat `n` players, make `dealer` the dealer and pump directives between
    /// them until the rotation stops. Returns the hop log and the seats.
    fn run_rotation(ports: &[u16], dealer: usize) -> (Vec<(String, String)>, Vec<Seat>) {
        let all = addrs(ports);
        let mut seats: Vec<Seat> = all
            .iter()
            .map(|own| {
                let (tx, rx) = mpsc::unbounded_channel();
                let cipher = Arc::new(XorStreamCipher::random());
                let mut state =
                    GameState::new(own, false, all.len(), cipher.clone(), tx).unwrap();
                for other in &all {
                    state.add_player(other, GameStatus::WaitingForCards).unwrap();
                }
                Seat { state, rx, cipher }
            })
            .collect();

        assert!(seats[dealer].state.set_dealer(true).unwrap());

        let mut hops = Vec::new();
        let mut pending: VecDeque<(String, BroadcastTo)> = VecDeque::new();
        let mut completed = 0;
        loop {
            for seat in seats.iter_mut() {
                while let Ok(directive) = seat.rx.try_recv() {
                    pending.push_back((seat.state.listen_addr().to_string(), directive));
                }
            }
            let Some((from, directive)) = pending.pop_front() else {
                break;
            };
            assert_eq!(directive.to.len(), 1, "rotation is unicast");
            let to = directive.to[0].clone();
            hops.push((from.clone(), to.clone()));

            let deck = match directive.payload {
                Payload::EncryptedDeck(d) => d.deck,
                other => panic!("unexpected payload {other:?}"),
            };
            let target = seats
                .iter_mut()
                .find(|s| s.state.listen_addr() == to)
                .unwrap();
            if target.state.shuffle_and_encrypt(&from, deck).unwrap() == ShuffleStep::Completed {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        (hops, seats)
    }

    fn check_ring(ports: &[u16], dealer: usize) {
        let (hops, seats) = run_rotation(ports, dealer);
        let n = ports.len();
        let table = seats[0].state.table().to_vec();
        let dealer_addr = seats[dealer].state.listen_addr().to_string();
        let start = table.iter().position(|a| a == &dealer_addr).unwrap();

        // dealer -> seat+1 -> ... -> dealer, each hop exactly once
        assert_eq!(hops.len(), n);
        for (k, (from, to)) in hops.iter().enumerate() {
            assert_eq!(from, &table[(start + k) % n]);
            assert_eq!(to, &table[(start + k + 1) % n]);
        }
        let visited: HashSet<&String> = hops.iter().map(|(_, to)| to).collect();
        assert_eq!(visited.len(), n);

        for seat in &seats {
            assert_eq!(seat.state.status(), GameStatus::ShuffleAndDeal);
        }

        // strip every layer, in seat order this time
        let mut deck = seats[dealer].state.completed_deck().unwrap().to_vec();
        for seat in &seats {
            deck = decrypt_deck(&*seat.cipher, &deck);
        }
        let cards: HashSet<Card> = deck.iter().map(|b| Card::from_bytes(b).unwrap()).collect();
        assert_eq!(cards.len(), DECK_SIZE);
    }

    #[test]
    fn test_ring_two_players() {
        check_ring(&[3000, 4000], 0);
    }

    #[test]
    fn test_ring_three_players() {
        check_ring(&[5000, 3000, 4000], 1);
    }

    #[test]
    fn test_ring_five_players() {
        check_ring(&[3000, 4000, 5000, 6000, 7000], 2);
        check_ring(&[3000, 4000, 5000, 6000, 7000], 4);
    }
}
