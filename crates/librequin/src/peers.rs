use std::{collections::HashSet, time::Duration};

use crate::{
    pending::PendingRequests,
    type_aliases::{RequestIndex, BF},
};

/// Stable opaque peer identity, allocated by the embedder, one per
/// connection. Totally ordered so it can serve as the final deterministic
/// tiebreak when ranking peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

/// One connected peer as a scheduling pass sees it. All fields are observed
/// atomically at the start of the pass.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: PeerId,
    /// Pieces the peer claims to have. An embedder that bans a peer hands
    /// the scheduler a cleared bitfield.
    pub bitfield: BF,
    /// Requests this peer had outstanding when the snapshot was taken.
    pub existing_requests: HashSet<RequestIndex>,
    pub choking: bool,
    /// Pieces the peer will serve even while choking (BEP-6).
    pub allowed_fast: HashSet<u32>,
    pub download_rate: f64,
    /// Time since the connection was established.
    pub age: Duration,
    /// Hard cap on outstanding requests.
    pub max_requests: usize,
    /// Cap suggested by the transport layer; the effective cap is
    /// [`PeerSnapshot::request_cap`].
    pub nominal_max_requests: usize,
}

impl PeerSnapshot {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            bitfield: BF::default(),
            existing_requests: Default::default(),
            choking: false,
            allowed_fast: Default::default(),
            download_rate: 0.,
            age: Duration::ZERO,
            max_requests: 0,
            nominal_max_requests: usize::MAX,
        }
    }

    pub fn can_request_piece(&self, piece_index: u32) -> bool {
        self.bitfield
            .get(piece_index as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    pub fn is_allowed_fast(&self, piece_index: u32) -> bool {
        self.allowed_fast.contains(&piece_index)
    }

    pub fn request_cap(&self) -> usize {
        self.nominal_max_requests.min(self.max_requests)
    }
}

/// The wire-visible request state of one peer, mutated as passes apply
/// deltas and as the peer answers.
///
/// With the fast extension a cancelled request stays outstanding (and keeps
/// its pending count) until the peer answers with the piece or an explicit
/// reject.
#[derive(Debug, Clone, Default)]
pub struct PeerRequestState {
    /// Requests currently outstanding on the wire.
    pub actual: HashSet<RequestIndex>,
    /// Outstanding requests we have asked the peer to forget.
    pub cancelled: HashSet<RequestIndex>,
    pub interested: bool,
    /// Why the next pass is needed; None means the peer is up to date.
    pub needs_update: Option<&'static str>,
}

impl PeerRequestState {
    /// Records why a re-pass is needed. The first reason wins until a pass
    /// fully applies.
    pub fn mark_needs_update(&mut self, reason: &'static str) {
        if self.needs_update.is_none() {
            self.needs_update = Some(reason);
        }
    }

    /// The peer sent the chunk. Returns true if we had it outstanding.
    pub fn on_piece_received(
        &mut self,
        r: RequestIndex,
        pending: &mut PendingRequests,
    ) -> bool {
        self.retire(r, pending)
    }

    /// The peer explicitly rejected the request (BEP-6).
    pub fn on_request_rejected(
        &mut self,
        r: RequestIndex,
        pending: &mut PendingRequests,
    ) -> bool {
        self.retire(r, pending)
    }

    /// The peer choked us. Without the fast extension every outstanding
    /// request is implicitly dropped; with it, requests for allowed-fast
    /// pieces survive. `keep` decides per request index.
    pub fn on_choked(
        &mut self,
        pending: &mut PendingRequests,
        keep: impl Fn(RequestIndex) -> bool,
    ) {
        let dropped: Vec<RequestIndex> =
            self.actual.iter().copied().filter(|&r| !keep(r)).collect();
        for r in dropped {
            self.retire(r, pending);
        }
    }

    fn retire(&mut self, r: RequestIndex, pending: &mut PendingRequests) -> bool {
        if self.actual.remove(&r) {
            self.cancelled.remove(&r);
            pending.dec(r);
            true
        } else {
            false
        }
    }
}
