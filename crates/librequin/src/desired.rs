use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

use requin_core::Id20;
use tracing::trace;

use crate::{
    input::SchedulerInput,
    peers::{PeerRequestState, PeerSnapshot},
    pending::PendingRequests,
    piece_order::{PiecePriority, PieceRequestOrder},
    selector::for_each_requestable_piece,
    type_aliases::RequestIndex,
};

/// What one peer's outstanding request set should become, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredRequestState {
    pub requests: Vec<RequestIndex>,
    pub interested: bool,
}

// One candidate request with its ordering captured at heap-build time. The
// pending multiset is not touched between build and pop, so the captured
// counts stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RequestHeapEntry {
    // Only ever true while the peer is choking: such requests can't be
    // served right now, but are kept at the end rather than thrown away in
    // case we get unchoked.
    choked_and_not_fast: bool,
    // How many other peers are fetching the same chunk.
    other_pending: u32,
    current: bool,
    priority: PiecePriority,
    availability: i64,
    piece_index: u32,
    request_index: RequestIndex,
}

impl Ord for RequestHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.choked_and_not_fast
            .cmp(&other.choked_and_not_fast)
            .then_with(|| self.other_pending.cmp(&other.other_pending))
            .then_with(|| other.current.cmp(&self.current))
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.availability.cmp(&other.availability))
            .then_with(|| self.piece_index.cmp(&other.piece_index))
            .then_with(|| self.request_index.cmp(&other.request_index))
    }
}

impl PartialOrd for RequestHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `pending(r)` minus our own outstanding request, i.e. how many *other*
/// peers are fetching the chunk. Our own request must be counted or the
/// accounting is corrupted.
pub(crate) fn adjusted_pending(pending: &PendingRequests, r: RequestIndex, current: bool) -> u32 {
    let mut n = pending.get(r);
    if current {
        assert!(
            n > 0,
            "pending count for request {r} misses our own outstanding request"
        );
        n -= 1;
    }
    n
}

/// Builds the peer's desired request list: walk the requestable pieces the
/// peer has, gather its candidate chunk requests, and keep the best
/// `request_cap()` of them according to the secondary ordering.
pub fn desired_request_state(
    input: &SchedulerInput,
    order: &PieceRequestOrder,
    info_hash: Id20,
    peer: &PeerSnapshot,
    state: &PeerRequestState,
    pending: &PendingRequests,
) -> DesiredRequestState {
    let mut desired = DesiredRequestState::default();
    let mut heap: BinaryHeap<Reverse<RequestHeapEntry>> = BinaryHeap::new();

    for_each_requestable_piece(input, order, |t, piece, piece_index| {
        if t.info_hash != info_hash {
            return;
        }
        if !peer.can_request_piece(piece_index) {
            return;
        }
        let allowed_fast = peer.is_allowed_fast(piece_index);
        for chunk in piece.iter_pending_chunks() {
            let r = t.request_index(piece_index, chunk);
            if !allowed_fast {
                // Interest must be signalled to request this.
                desired.interested = true;
                // While choked we can only sustain requests made before the
                // choke; the fast extension keeps those alive.
                if peer.choking && !state.actual.contains(&r) {
                    continue;
                }
            }
            let current = state.actual.contains(&r);
            heap.push(Reverse(RequestHeapEntry {
                choked_and_not_fast: peer.choking && !allowed_fast,
                other_pending: adjusted_pending(pending, r, current),
                current,
                priority: piece.priority,
                availability: piece.availability,
                piece_index,
                request_index: r,
            }));
        }
    });

    let cap = peer.request_cap();
    while let Some(Reverse(entry)) = heap.pop() {
        if desired.requests.len() >= cap {
            break;
        }
        desired.requests.push(entry.request_index);
    }
    trace!(
        peer = ?peer.id,
        requests = desired.requests.len(),
        interested = desired.interested,
        "built desired request state"
    );
    desired
}
