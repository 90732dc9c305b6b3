use std::collections::HashMap;

use requin_core::Id20;
use tracing::{debug, debug_span};

use crate::{
    allocator::{allocate_pending_chunks, AllocPeer, RequestablePiece},
    apply::{apply_request_state, RequestSink, UpdateTimer},
    desired::desired_request_state,
    input::{SchedulerInput, TorrentSnapshot},
    peers::{PeerRequestState, PeerSnapshot},
    pending::PendingRequests,
    piece_order::{PieceOrderKey, PieceOrderState, PieceRequestOrder},
    selector::{for_each_requestable_piece, PieceSortCache},
};

#[derive(Debug, Clone, Copy)]
struct TorrentEntry {
    num_pieces: u32,
}

/// Owns the cross-pass scheduling state for all torrents sharing one storage
/// capacity: the piece ordering, the sort-permutation cache and the
/// per-torrent pending-request multisets. One per client; no globals.
///
/// Torrent and piece lifecycle mistakes (double add, unknown torrent) mean
/// the embedder's bookkeeping is corrupted, and panic.
#[derive(Default)]
pub struct Scheduler {
    piece_order: PieceRequestOrder,
    sort_cache: PieceSortCache,
    pending: HashMap<Id20, PendingRequests>,
    torrents: HashMap<Id20, TorrentEntry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a torrent, seeding the piece order from the snapshot.
    pub fn add_torrent(&mut self, t: &TorrentSnapshot) {
        if self
            .torrents
            .insert(
                t.info_hash,
                TorrentEntry {
                    num_pieces: t.pieces.len() as u32,
                },
            )
            .is_some()
        {
            panic!("torrent {:?} added twice", t.info_hash);
        }
        self.pending
            .insert(t.info_hash, PendingRequests::new(t.total_request_indices()));
        for (i, piece) in t.pieces.iter().enumerate() {
            self.piece_order.add(
                PieceOrderKey {
                    info_hash: t.info_hash,
                    index: i as u32,
                },
                piece.order_state(),
            );
        }
        self.sort_cache.clear();
        debug!(info_hash = ?t.info_hash, pieces = t.pieces.len(), "torrent added");
    }

    /// Drops a torrent and every piece it contributed to the order.
    pub fn remove_torrent(&mut self, info_hash: &Id20) {
        let entry = match self.torrents.remove(info_hash) {
            Some(entry) => entry,
            None => panic!("removing unknown torrent {info_hash:?}"),
        };
        for index in 0..entry.num_pieces {
            self.piece_order.delete(PieceOrderKey {
                info_hash: *info_hash,
                index,
            });
        }
        self.pending.remove(info_hash);
        self.sort_cache.clear();
        debug!(?info_hash, "torrent removed");
    }

    /// Re-keys one piece after a priority/partial/availability change.
    pub fn update_piece(&mut self, key: PieceOrderKey, state: PieceOrderState) {
        self.piece_order.update(key, state);
    }

    pub fn piece_order(&self) -> &PieceRequestOrder {
        &self.piece_order
    }

    pub fn sort_cache(&self) -> &PieceSortCache {
        &self.sort_cache
    }

    pub fn pending(&self, info_hash: &Id20) -> &PendingRequests {
        match self.pending.get(info_hash) {
            Some(p) => p,
            None => panic!("no pending table for torrent {info_hash:?}"),
        }
    }

    pub fn pending_mut(&mut self, info_hash: &Id20) -> &mut PendingRequests {
        match self.pending.get_mut(info_hash) {
            Some(p) => p,
            None => panic!("no pending table for torrent {info_hash:?}"),
        }
    }

    /// The whole-client planning pass: walk the requestable pieces in order
    /// and assign every pending chunk across each torrent's peers. After
    /// this, every `AllocPeer` carries its proposed next request set, with
    /// at most one peer per chunk and every peer within its cap.
    pub fn allocate_next_requests(
        &self,
        input: &SchedulerInput,
        peers: &mut HashMap<Id20, Vec<AllocPeer>>,
    ) {
        let mut requestable = Vec::new();
        for_each_requestable_piece(input, &self.piece_order, |t, piece, index| {
            requestable.push((t, piece, index));
        });

        for (info_hash, torrent_peers) in peers.iter_mut() {
            for ap in torrent_peers.iter_mut() {
                ap.next = Default::default();
                ap.requestable_pieces_remaining = requestable
                    .iter()
                    .filter(|(t, _, index)| {
                        t.info_hash == *info_hash && ap.peer.can_request_piece(*index)
                    })
                    .count() as u32;
            }
        }

        for (t, piece, index) in requestable {
            let Some(torrent_peers) = peers.get_mut(&t.info_hash) else {
                continue;
            };
            allocate_pending_chunks(&RequestablePiece::new(t, piece, index), torrent_peers);
        }
    }

    /// Runs one peer's full pass (desired state, then application) if an
    /// update reason is set. Returns true when the peer is up to date.
    pub fn maybe_update_peer(
        &mut self,
        input: &SchedulerInput,
        info_hash: Id20,
        peer: &PeerSnapshot,
        state: &mut PeerRequestState,
        sink: &mut impl RequestSink,
        timer: &mut impl UpdateTimer,
    ) -> bool {
        let Some(reason) = state.needs_update else {
            return true;
        };
        let span = debug_span!("update_requests", reason);
        let _guard = span.enter();
        let pending = match self.pending.get_mut(&info_hash) {
            Some(p) => p,
            None => panic!("no pending table for torrent {info_hash:?}"),
        };
        let desired =
            desired_request_state(input, &self.piece_order, info_hash, peer, state, pending);
        apply_request_state(
            &desired,
            state,
            pending,
            peer.request_cap(),
            sink,
            timer,
        )
    }
}
