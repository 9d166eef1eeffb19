// Piece selection and request bookkeeping for one torrent.
//
// Pure state, no I/O. The torrent holds it behind its lock and turns the
// returned decisions into wire messages.

use std::collections::{HashMap, HashSet};

use kraken_core::PeerId;
use tokio::time::{Duration, Instant};

use crate::{config::PieceSelectionPolicy, type_aliases::BF};

#[derive(Debug, Clone, Copy)]
struct InFlight {
    peer: PeerId,
    sent_at: Instant,
}

#[derive(Debug)]
struct DispatchPeer {
    bitfield: BF,
    outstanding: HashSet<u32>,
    // Pieces this connection stalled on. Forgotten with the connection.
    stalled: HashSet<u32>,
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    have: BF,
    // Number of connected peers holding each piece.
    availability: Vec<u32>,
    in_flight: HashMap<u32, InFlight>,
    peers: HashMap<PeerId, DispatchPeer>,
    // Peers that sent a corrupt copy of the piece. Survives reconnects.
    mismatched: HashMap<u32, HashSet<PeerId>>,
}

impl Dispatcher {
    pub fn new(have: BF) -> Self {
        let len = have.len();
        Self {
            have,
            availability: vec![0; len],
            in_flight: HashMap::new(),
            peers: HashMap::new(),
            mismatched: HashMap::new(),
        }
    }

    pub fn have(&self) -> &BF {
        &self.have
    }

    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    #[cfg(test)]
    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn outstanding(&self, peer: &PeerId) -> usize {
        self.peers.get(peer).map(|p| p.outstanding.len()).unwrap_or(0)
    }

    pub fn add_peer(&mut self, peer: PeerId, mut bitfield: BF) {
        // Drops padding bits and tolerates short bitfields.
        bitfield.resize(self.have.len(), false);
        self.remove_peer(&peer);
        for idx in bitfield.iter_ones() {
            self.availability[idx] += 1;
        }
        self.peers.insert(
            peer,
            DispatchPeer {
                bitfield,
                outstanding: HashSet::new(),
                stalled: HashSet::new(),
            },
        );
    }

    /// Forgets the peer, returning the pieces it had in flight. They become requestable again.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Vec<u32> {
        let Some(p) = self.peers.remove(peer) else {
            return Vec::new();
        };
        for idx in p.bitfield.iter_ones() {
            self.availability[idx] -= 1;
        }
        let mut freed: Vec<u32> = p.outstanding.into_iter().collect();
        freed.sort_unstable();
        for idx in freed.iter() {
            if self.in_flight.get(idx).is_some_and(|f| f.peer == *peer) {
                self.in_flight.remove(idx);
            }
        }
        freed
    }

    /// Returns false if the index is out of range or already known.
    pub fn on_peer_has(&mut self, peer: &PeerId, index: u32) -> bool {
        let Some(p) = self.peers.get_mut(peer) else {
            return false;
        };
        match p.bitfield.get_mut(index as usize) {
            Some(mut bit) if !*bit => {
                bit.set(true);
                self.availability[index as usize] += 1;
                true
            }
            _ => false,
        }
    }

    pub fn peer_has_everything(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|p| p.bitfield.all())
    }

    fn is_excluded(&self, index: u32, peer: &PeerId) -> bool {
        self.mismatched
            .get(&index)
            .is_some_and(|peers| peers.contains(peer))
            || self
                .peers
                .get(peer)
                .is_some_and(|p| p.stalled.contains(&index))
    }

    /// Reserves up to `pipeline_limit - outstanding` pieces for the peer and returns them
    /// in the order they should be requested.
    pub fn next_requests(
        &mut self,
        peer: &PeerId,
        pipeline_limit: usize,
        policy: PieceSelectionPolicy,
        now: Instant,
    ) -> Vec<u32> {
        let Some(p) = self.peers.get(peer) else {
            return Vec::new();
        };
        let budget = pipeline_limit.saturating_sub(p.outstanding.len());
        if budget == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<u32> = p
            .bitfield
            .iter_ones()
            .map(|idx| idx as u32)
            .filter(|idx| {
                !self.have[*idx as usize]
                    && !self.in_flight.contains_key(idx)
                    && !self.is_excluded(*idx, peer)
            })
            .collect();
        match policy {
            PieceSelectionPolicy::RarestFirst => {
                candidates.sort_unstable_by_key(|idx| (self.availability[*idx as usize], *idx))
            }
            // iter_ones() is ascending already.
            PieceSelectionPolicy::Sequential => {}
        }
        candidates.truncate(budget);

        if let Some(p) = self.peers.get_mut(peer) {
            for idx in candidates.iter().copied() {
                p.outstanding.insert(idx);
                self.in_flight.insert(
                    idx,
                    InFlight {
                        peer: *peer,
                        sent_at: now,
                    },
                );
            }
        }
        candidates
    }

    /// Clears the request for a received payload. False if we never asked this peer for it
    /// (or gave up waiting), in which case the payload is to be ignored.
    pub fn on_piece_received(&mut self, peer: &PeerId, index: u32) -> bool {
        let Some(p) = self.peers.get_mut(peer) else {
            return false;
        };
        if !p.outstanding.remove(&index) {
            return false;
        }
        if self.in_flight.get(&index).is_some_and(|f| f.peer == *peer) {
            self.in_flight.remove(&index);
        }
        !self.have[index as usize]
    }

    /// Returns false if the piece was already marked.
    pub fn mark_verified(&mut self, index: u32) -> bool {
        if self.have[index as usize] {
            return false;
        }
        self.have.set(index as usize, true);
        self.mismatched.remove(&index);
        if let Some(f) = self.in_flight.remove(&index)
            && let Some(p) = self.peers.get_mut(&f.peer)
        {
            p.outstanding.remove(&index);
        }
        true
    }

    pub fn on_hash_mismatch(&mut self, peer: &PeerId, index: u32) {
        self.mismatched.entry(index).or_default().insert(*peer);
    }

    /// The peer said it doesn't have the piece after all.
    pub fn on_not_found(&mut self, peer: &PeerId, index: u32) {
        let Some(p) = self.peers.get_mut(peer) else {
            return;
        };
        p.outstanding.remove(&index);
        if let Some(mut bit) = p.bitfield.get_mut(index as usize)
            && *bit
        {
            bit.set(false);
            self.availability[index as usize] -= 1;
        }
        if self.in_flight.get(&index).is_some_and(|f| f.peer == *peer) {
            self.in_flight.remove(&index);
        }
    }

    /// Requests older than `timeout`, oldest first.
    pub fn expired_requests(&self, now: Instant, timeout: Duration) -> Vec<(u32, PeerId)> {
        let mut v: Vec<_> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.duration_since(f.sent_at) >= timeout)
            .map(|(idx, f)| (f.sent_at, *idx, f.peer))
            .collect();
        v.sort_unstable_by_key(|(sent_at, idx, _)| (*sent_at, *idx));
        v.into_iter().map(|(_, idx, peer)| (idx, peer)).collect()
    }

    /// Takes a stalled request away from `peer` and hands it to another peer holding the
    /// piece, preferring the least loaded one. Returns that peer, or `None` if nobody else
    /// can serve it.
    ///
    /// `peer` is not asked for the piece again on this connection. A reconnect starts over.
    pub fn reassign_expired(&mut self, index: u32, peer: &PeerId, now: Instant) -> Option<PeerId> {
        if let Some(p) = self.peers.get_mut(peer) {
            p.outstanding.remove(&index);
            p.stalled.insert(index);
        }
        if self.in_flight.get(&index).is_some_and(|f| f.peer == *peer) {
            self.in_flight.remove(&index);
        }
        if self.have[index as usize] {
            return None;
        }

        let (alt, _) = self
            .peers
            .iter()
            .filter(|(id, p)| {
                *id != peer
                    && p.bitfield[index as usize]
                    && !self.is_excluded(index, id)
            })
            .map(|(id, p)| (*id, p.outstanding.len()))
            .min_by_key(|(id, outstanding)| (*outstanding, *id))?;

        if let Some(p) = self.peers.get_mut(&alt) {
            p.outstanding.insert(index);
        }
        self.in_flight.insert(
            index,
            InFlight {
                peer: alt,
                sent_at: now,
            },
        );
        Some(alt)
    }
}

#[cfg(test)]
mod tests {
    use bitvec::{bitvec, order::Msb0};

    use super::*;

    fn peer(b: u8) -> PeerId {
        PeerId::new([b; 20])
    }

    fn full(len: usize) -> BF {
        bitvec![u8, Msb0; 1; len]
    }

    fn bf(bits: &[u8]) -> BF {
        bits.iter().map(|b| *b == 1).collect()
    }

    #[test]
    fn test_rarest_first_ties_lowest_index() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 4]);
        d.add_peer(peer(1), full(4));
        d.add_peer(peer(2), bf(&[1, 0, 1, 0]));
        let now = Instant::now();

        // Pieces 1 and 3 are held by one peer, 0 and 2 by two.
        let reqs = d.next_requests(&peer(1), 10, PieceSelectionPolicy::RarestFirst, now);
        assert_eq!(reqs, vec![1, 3, 0, 2]);
        assert_eq!(d.num_in_flight(), 4);

        // Nothing left for peer 2, everything is in flight.
        assert!(
            d.next_requests(&peer(2), 10, PieceSelectionPolicy::RarestFirst, now)
                .is_empty()
        );
    }

    #[test]
    fn test_sequential_and_pipeline_limit() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 6]);
        d.add_peer(peer(1), full(6));
        d.add_peer(peer(2), bf(&[0, 0, 0, 0, 0, 1]));
        let now = Instant::now();
        let reqs = d.next_requests(&peer(1), 2, PieceSelectionPolicy::Sequential, now);
        assert_eq!(reqs, vec![0, 1]);
        assert!(
            d.next_requests(&peer(1), 2, PieceSelectionPolicy::Sequential, now)
                .is_empty()
        );
        assert!(d.on_piece_received(&peer(1), 0));
        assert!(d.mark_verified(0));
        assert_eq!(
            d.next_requests(&peer(1), 2, PieceSelectionPolicy::Sequential, now),
            vec![2]
        );
        assert_eq!(d.outstanding(&peer(1)), 2);
    }

    #[test]
    fn test_remove_peer_frees_in_flight() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 3]);
        d.add_peer(peer(1), full(3));
        d.add_peer(peer(2), full(3));
        let now = Instant::now();
        assert_eq!(
            d.next_requests(&peer(1), 2, PieceSelectionPolicy::RarestFirst, now),
            vec![0, 1]
        );
        assert_eq!(d.remove_peer(&peer(1)), vec![0, 1]);
        assert_eq!(d.num_in_flight(), 0);
        assert_eq!(
            d.next_requests(&peer(2), 5, PieceSelectionPolicy::RarestFirst, now),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_padding_bits_ignored() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 3]);
        d.add_peer(peer(1), full(8));
        assert!(d.peer_has_everything(&peer(1)));
        assert_eq!(
            d.next_requests(&peer(1), 8, PieceSelectionPolicy::RarestFirst, Instant::now())
                .len(),
            3
        );
    }

    #[test]
    fn test_announce_updates_availability() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 2]);
        d.add_peer(peer(1), bf(&[1, 0]));
        assert!(!d.peer_has_everything(&peer(1)));
        assert!(d.on_peer_has(&peer(1), 1));
        assert!(!d.on_peer_has(&peer(1), 1));
        assert!(!d.on_peer_has(&peer(1), 7));
        assert!(d.peer_has_everything(&peer(1)));
    }

    #[test]
    fn test_unsolicited_payload_ignored() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 2]);
        d.add_peer(peer(1), full(2));
        assert!(!d.on_piece_received(&peer(1), 0));
        assert!(!d.on_piece_received(&peer(9), 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_request_reassigned() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 4]);
        d.add_peer(peer(1), full(4));
        let t0 = Instant::now();
        assert_eq!(
            d.next_requests(&peer(1), 4, PieceSelectionPolicy::RarestFirst, t0),
            vec![0, 1, 2, 3]
        );
        d.add_peer(peer(2), full(4));
        for idx in [0, 1, 3] {
            assert!(d.on_piece_received(&peer(1), idx));
            d.mark_verified(idx);
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        let now = Instant::now();
        assert!(d.expired_requests(now, Duration::from_secs(2)).is_empty());
        let expired = d.expired_requests(now, Duration::from_secs(1));
        assert_eq!(expired, vec![(2, peer(1))]);

        assert_eq!(d.reassign_expired(2, &peer(1), now), Some(peer(2)));
        assert_eq!(d.outstanding(&peer(1)), 0);
        assert_eq!(d.outstanding(&peer(2)), 1);
        // Peer 1 won't be asked for piece 2 again.
        assert!(
            d.next_requests(&peer(1), 4, PieceSelectionPolicy::RarestFirst, now)
                .is_empty()
        );
        // A late answer from peer 1 is ignored.
        assert!(!d.on_piece_received(&peer(1), 2));
        assert!(d.on_piece_received(&peer(2), 2));
        assert!(d.mark_verified(2));
        assert!(d.is_complete());
    }

    #[test]
    fn test_reassign_without_alternative() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 2]);
        d.add_peer(peer(1), full(2));
        d.add_peer(peer(2), bf(&[1, 0]));
        let now = Instant::now();
        d.next_requests(&peer(1), 2, PieceSelectionPolicy::Sequential, now);
        assert_eq!(d.reassign_expired(1, &peer(1), now), None);
        assert_eq!(d.num_in_flight(), 1);
    }

    #[test]
    fn test_stalled_piece_requested_again_after_reconnect() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 2]);
        d.add_peer(peer(1), full(2));
        let now = Instant::now();
        assert_eq!(
            d.next_requests(&peer(1), 2, PieceSelectionPolicy::RarestFirst, now),
            vec![0, 1]
        );
        assert_eq!(d.reassign_expired(1, &peer(1), now), None);
        assert!(
            d.next_requests(&peer(1), 2, PieceSelectionPolicy::RarestFirst, now)
                .is_empty()
        );

        // The only holder of piece 1 comes back on a new connection.
        assert_eq!(d.remove_peer(&peer(1)), vec![0]);
        d.add_peer(peer(1), full(2));
        assert_eq!(
            d.next_requests(&peer(1), 2, PieceSelectionPolicy::RarestFirst, now),
            vec![0, 1]
        );
    }

    #[test]
    fn test_hash_mismatch_survives_reconnect() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 2]);
        d.add_peer(peer(1), full(2));
        let now = Instant::now();
        d.next_requests(&peer(1), 1, PieceSelectionPolicy::Sequential, now);
        assert!(d.on_piece_received(&peer(1), 0));
        d.on_hash_mismatch(&peer(1), 0);
        d.remove_peer(&peer(1));
        d.add_peer(peer(1), full(2));
        assert_eq!(
            d.next_requests(&peer(1), 2, PieceSelectionPolicy::Sequential, now),
            vec![1]
        );
    }

    #[test]
    fn test_hash_mismatch_excludes_peer() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 1]);
        d.add_peer(peer(1), full(1));
        d.add_peer(peer(2), full(1));
        let now = Instant::now();
        assert_eq!(
            d.next_requests(&peer(1), 1, PieceSelectionPolicy::RarestFirst, now),
            vec![0]
        );
        assert!(d.on_piece_received(&peer(1), 0));
        d.on_hash_mismatch(&peer(1), 0);
        assert!(
            d.next_requests(&peer(1), 1, PieceSelectionPolicy::RarestFirst, now)
                .is_empty()
        );
        assert_eq!(
            d.next_requests(&peer(2), 1, PieceSelectionPolicy::RarestFirst, now),
            vec![0]
        );
    }

    #[test]
    fn test_not_found_clears_bit() {
        let mut d = Dispatcher::new(bitvec![u8, Msb0; 0; 2]);
        d.add_peer(peer(1), full(2));
        let now = Instant::now();
        d.next_requests(&peer(1), 1, PieceSelectionPolicy::Sequential, now);
        d.on_not_found(&peer(1), 0);
        assert_eq!(d.num_in_flight(), 0);
        assert_eq!(
            d.next_requests(&peer(1), 2, PieceSelectionPolicy::Sequential, now),
            vec![1]
        );
        assert!(!d.peer_has_everything(&peer(1)));
    }
}
