//! Commutative deck encryption used by the shuffle rotation.
//!
//! Every seated player applies its own transform to the deck as it passes by.
//! For the mental poker guarantee the transform must commute: layers added by
//! different players can be removed in any order. The default [`XorStreamCipher`]
//! satisfies that by XOR-ing a per-player keystream; it is a placeholder, not a
//! hardened scheme, and can be swapped for any other [`DeckCipher`].

use crate::deck::{Card, CardError};
use blake2::{Blake2b512, Digest};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a player secret in bytes.
pub const SECRET_LEN: usize = 32;

/// Per-block transform applied by one player.
///
/// Implementations must be commutative with every other player's instance.
pub trait DeckCipher: Send + Sync {
    fn encrypt_block(&self, block: &[u8]) -> Vec<u8>;
    fn decrypt_block(&self, block: &[u8]) -> Vec<u8>;
}

/// A player's private shuffle key. Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PlayerSecret {
    bytes: [u8; SECRET_LEN],
}

impl PlayerSecret {
    pub fn random() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self { bytes }
    }

    pub fn expose_secret(&self) -> &[u8; SECRET_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for PlayerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PlayerSecret(..)")
    }
}

/// XOR stream cipher keyed by BLAKE2b-512 of the player secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct XorStreamCipher {
    keystream: [u8; 64],
}

impl XorStreamCipher {
    pub fn new(secret: &PlayerSecret) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update(b"mental-poker-p2p/keystream");
        hasher.update(secret.expose_secret());
        let digest = hasher.finalize();

        let mut keystream = [0u8; 64];
        keystream.copy_from_slice(&digest);
        Self { keystream }
    }

    pub fn random() -> Self {
        Self::new(&PlayerSecret::random())
    }

    fn apply(&self, block: &[u8]) -> Vec<u8> {
        block
            .iter()
            .zip(self.keystream.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl DeckCipher for XorStreamCipher {
    fn encrypt_block(&self, block: &[u8]) -> Vec<u8> {
        self.apply(block)
    }

    fn decrypt_block(&self, block: &[u8]) -> Vec<u8> {
        self.apply(block)
    }
}

/// One hop of the rotation: encrypt every card block, then permute the order.
pub fn shuffle_and_encrypt<R: Rng + ?Sized>(
    cipher: &dyn DeckCipher,
    deck: &[Vec<u8>],
    rng: &mut R,
) -> Vec<Vec<u8>> {
    let mut out: Vec<Vec<u8>> = deck.iter().map(|b| cipher.encrypt_block(b)).collect();
    out.shuffle(rng);
    out
}

/// Remove one player's layer from every block, keeping the order.
pub fn decrypt_deck(cipher: &dyn DeckCipher, deck: &[Vec<u8>]) -> Vec<Vec<u8>> {
    deck.iter().map(|b| cipher.decrypt_block(b)).collect()
}

pub fn encrypt_card(cipher: &dyn DeckCipher, card: &Card) -> Result<Vec<u8>, CardError> {
    Ok(cipher.encrypt_block(&card.to_bytes()?))
}

pub fn decrypt_card(cipher: &dyn DeckCipher, block: &[u8]) -> Result<Card, CardError> {
    Card::from_bytes(&cipher.decrypt_block(block))
}
