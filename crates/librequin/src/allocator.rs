use std::{cmp::Ordering, collections::HashSet};

use itertools::Itertools;
use tracing::trace;

use crate::{
    input::{PieceSnapshot, TorrentSnapshot},
    peers::PeerSnapshot,
    type_aliases::{ChunkIndex, RequestIndex},
};

/// The request set being built for one peer during an allocation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NextRequestState {
    pub requests: HashSet<RequestIndex>,
    pub interested: bool,
}

/// A connected peer participating in an allocation pass.
#[derive(Debug, Clone)]
pub struct AllocPeer {
    pub peer: PeerSnapshot,
    pub next: NextRequestState,
    /// How many pieces yielded this pass the peer can still contribute to,
    /// counting the piece currently being allocated. 1 means this is its
    /// last chance.
    pub requestable_pieces_remaining: u32,
}

impl AllocPeer {
    pub fn new(peer: PeerSnapshot) -> Self {
        Self {
            peer,
            next: Default::default(),
            requestable_pieces_remaining: 0,
        }
    }

    fn can_fit_request(&self) -> bool {
        self.next.requests.len() < self.peer.max_requests
    }

    fn add_next_request(&mut self, r: RequestIndex) {
        assert!(
            self.next.requests.insert(r),
            "request {r} allocated twice to peer {:?}",
            self.peer.id
        );
    }
}

/// A piece admitted by the selector, ready for chunk allocation.
pub struct RequestablePiece<'a> {
    pub index: u32,
    pub chunks_per_piece: u32,
    pub always_reallocate: bool,
    pub piece: &'a PieceSnapshot,
}

impl<'a> RequestablePiece<'a> {
    pub fn new(t: &'a TorrentSnapshot, piece: &'a PieceSnapshot, index: u32) -> Self {
        Self {
            index,
            chunks_per_piece: t.chunks_per_piece,
            always_reallocate: piece.always_reallocate,
            piece,
        }
    }

    fn request_index(&self, chunk: ChunkIndex) -> RequestIndex {
        self.chunks_per_piece * self.index + chunk
    }
}

// Ranks two candidates (indices into `peers`) for one piece. `req` is set on
// the re-balance pass to the contested request index.
//
// The ordering, first rule to decide wins:
//   1. unless the piece forces reallocation, a peer on its last requestable
//      piece goes first;
//   2. when striping applies (forced, or the loser is on its last piece),
//      fewer requests already taken in this piece goes first;
//   3. otherwise, on re-balance, the peer already holding the contested
//      request goes first, keeping assignments sticky;
//   4. fewer requestable pieces remaining goes first;
//   5. higher download rate goes first;
//   6. rule 3 again if striping skipped it;
//   7. older connection goes first;
//   8. smaller peer id.
fn peer_cmp(
    a: usize,
    b: usize,
    peers: &[AllocPeer],
    requests_in_piece: &[u32],
    always_reallocate: bool,
    req: Option<RequestIndex>,
) -> Ordering {
    let (i, j) = (&peers[a], &peers[b]);
    let by_has_request = || match req {
        Some(r) => {
            let i_has = i.next.requests.contains(&r);
            let j_has = j.next.requests.contains(&r);
            j_has.cmp(&i_has)
        }
        None => Ordering::Equal,
    };
    let i_last = i.requestable_pieces_remaining == 1;
    let j_last = j.requestable_pieces_remaining == 1;

    let mut ord = Ordering::Equal;
    if !always_reallocate {
        ord = j_last.cmp(&i_last);
    }
    if ord == Ordering::Equal {
        ord = if always_reallocate || j_last {
            requests_in_piece[a].cmp(&requests_in_piece[b])
        } else {
            by_has_request()
        };
    }
    ord = ord
        .then_with(|| {
            i.requestable_pieces_remaining
                .cmp(&j.requestable_pieces_remaining)
        })
        .then_with(|| j.peer.download_rate.total_cmp(&i.peer.download_rate));
    if ord != Ordering::Equal {
        return ord;
    }
    by_has_request()
        // TODO: peer priority (BEP-40) probably belongs before age.
        .then_with(|| j.peer.age.cmp(&i.peer.age))
        .then_with(|| i.peer.id.cmp(&j.peer.id))
}

fn sort_candidates(
    candidates: &mut [usize],
    peers: &[AllocPeer],
    requests_in_piece: &[u32],
    always_reallocate: bool,
    req: Option<RequestIndex>,
) {
    candidates.sort_by(|&a, &b| peer_cmp(a, b, peers, requests_in_piece, always_reallocate, req));
    debug_assert!(candidates.iter().all_unique());
    debug_assert!(candidates.is_sorted_by(|&a, &b| peer_cmp(
        a,
        b,
        peers,
        requests_in_piece,
        always_reallocate,
        req
    ) != Ordering::Greater));
}

/// Assigns every pending chunk of `piece` to at most one of `peers`,
/// mutating their [`NextRequestState`]s.
///
/// Three passes: keep what peers already have outstanding (pre-allocation),
/// hand out chunks nobody holds (fresh assignment), then re-rank and settle
/// the chunks that were pre-allocated, possibly to several peers at once
/// when earlier passes went unacknowledged.
pub fn allocate_pending_chunks(p: &RequestablePiece, peers: &mut [AllocPeer]) {
    let mut candidates: Vec<usize> = Vec::with_capacity(peers.len());
    let mut requests_in_piece = vec![0u32; peers.len()];
    for (idx, ap) in peers.iter_mut().enumerate() {
        if !ap.peer.can_request_piece(p.index) {
            continue;
        }
        if !ap.can_fit_request() {
            // Full peers drop out of this piece but still burn one of their
            // remaining chances.
            ap.requestable_pieces_remaining -= 1;
            continue;
        }
        candidates.push(idx);
    }

    // Chunks can arrive here pre-assigned several times over, when peers
    // haven't caught their "actual" state up with "next" between passes.
    let mut preallocated: Vec<Vec<usize>> = vec![Vec::new(); p.chunks_per_piece as usize];
    for chunk in p.piece.iter_pending_chunks() {
        let req = p.request_index(chunk);
        for &pi in &candidates {
            let ap = &mut peers[pi];
            if !ap.peer.existing_requests.contains(&req) {
                continue;
            }
            if !ap.can_fit_request() {
                continue;
            }
            preallocated[chunk as usize].push(pi);
            ap.add_next_request(req);
            requests_in_piece[pi] += 1;
        }
    }

    let mut pending_chunks_remaining = p.piece.num_pending_chunks();

    for chunk in p.piece.iter_pending_chunks() {
        if !preallocated[chunk as usize].is_empty() {
            continue;
        }
        pending_chunks_remaining -= 1;
        let req = p.request_index(chunk);
        sort_candidates(
            &mut candidates,
            peers,
            &requests_in_piece,
            p.always_reallocate,
            None,
        );
        for &pi in &candidates {
            let ap = &mut peers[pi];
            if !ap.can_fit_request() {
                continue;
            }
            if !ap.peer.is_allowed_fast(p.index) {
                // Interest must be on the wire before this request can be
                // served. TODO: verify it's okay to stay uninterested when
                // only allowed-fast pieces are being requested.
                ap.next.interested = true;
                if ap.peer.choking {
                    continue;
                }
            }
            ap.add_next_request(req);
            requests_in_piece[pi] += 1;
            break;
        }
    }

    for chunk in 0..preallocated.len() {
        let pre = std::mem::take(&mut preallocated[chunk]);
        if pre.is_empty() {
            continue;
        }
        pending_chunks_remaining -= 1;
        #[allow(clippy::cast_possible_truncation)]
        let req = p.request_index(chunk as ChunkIndex);
        for &pi in &pre {
            requests_in_piece[pi] -= 1;
        }
        // Rank while the holders still carry the request, then strip it and
        // hand it to the best candidate that fits.
        sort_candidates(
            &mut candidates,
            peers,
            &requests_in_piece,
            p.always_reallocate,
            Some(req),
        );
        for &pi in &pre {
            assert!(
                peers[pi].next.requests.remove(&req),
                "pre-allocated request {req} missing from peer {:?}",
                peers[pi].peer.id
            );
        }
        for &pi in &candidates {
            let ap = &mut peers[pi];
            if !ap.can_fit_request() {
                continue;
            }
            if !ap.peer.is_allowed_fast(p.index) {
                ap.next.interested = true;
                if ap.peer.choking {
                    continue;
                }
            }
            ap.add_next_request(req);
            requests_in_piece[pi] += 1;
            break;
        }
    }

    assert_eq!(
        pending_chunks_remaining, 0,
        "chunk accounting broken allocating piece {}",
        p.index
    );

    trace!(
        piece = p.index,
        candidates = candidates.len(),
        "allocated pending chunks"
    );
    for pi in candidates {
        peers[pi].requestable_pieces_remaining -= 1;
    }
}
