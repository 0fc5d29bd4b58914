//! Peer-list gossip.
//!
//! A node that accepts a newcomer pushes the listen addresses it already knows,
//! once, right after the handshake. The newcomer dials every address it is not
//! yet connected to, and the accepting side of each of those connections pushes
//! its own list in turn, so a node joining through any one peer ends up
//! connected to the whole table.

use super::addr;
use super::messages::{PeerAddr, PeerList};
use std::collections::BTreeSet;

/// Gossip rules for one node
#[derive(Debug, Clone)]
pub struct PeerListGossip {
    local_addr: PeerAddr,
}

impl PeerListGossip {
    pub fn new(local_addr: impl Into<PeerAddr>) -> Self {
        Self {
            local_addr: local_addr.into(),
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// List to push to `recipient`: every known address except ours and theirs.
    pub fn outgoing<'a, I>(&self, known: I, recipient: &str) -> PeerList
    where
        I: IntoIterator<Item = &'a str>,
    {
        let peers: BTreeSet<PeerAddr> = known
            .into_iter()
            .filter_map(addr::normalize)
            .filter(|a| a != &self.local_addr && a != recipient)
            .collect();

        PeerList {
            peers: peers.into_iter().collect(),
        }
    }

    /// Addresses from a received list that are worth dialing.
    ///
    /// Malformed entries, our own address and anything `is_known` reports
    /// (connected or already being dialed) are dropped; duplicates collapse.
    pub fn to_dial<F>(&self, list: &PeerList, is_known: F) -> Vec<PeerAddr>
    where
        F: Fn(&str) -> bool,
    {
        let candidates: BTreeSet<PeerAddr> = list
            .peers
            .iter()
            .filter_map(|a| addr::normalize(a))
            .filter(|a| a != &self.local_addr)
            .filter(|a| !is_known(a))
            .collect();

        candidates.into_iter().collect()
    }
}
