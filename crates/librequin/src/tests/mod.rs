use std::collections::{HashMap, HashSet};

use requin_core::{lengths::Lengths, Id20};

use crate::{
    allocator::AllocPeer,
    apply::{apply_request_state, NullTimer, RequestSink},
    desired::desired_request_state,
    input::{SchedulerInput, TorrentSnapshot},
    peers::{PeerId, PeerRequestState, PeerSnapshot},
    piece_order::{PieceOrderKey, PieceOrderState, PiecePriority},
    scheduler::Scheduler,
    type_aliases::{RequestIndex, BF},
};

fn hash(b: u8) -> Id20 {
    let mut id = Id20::default();
    id.0[0] = b;
    id
}

fn torrent(h: u8, num_pieces: u32) -> TorrentSnapshot {
    let lengths = Lengths::new(num_pieces as u64 * 32768, 32768, None).unwrap();
    TorrentSnapshot::new(hash(h), &lengths)
}

fn peer(id: u64, num_pieces: usize) -> PeerSnapshot {
    let mut p = PeerSnapshot::new(PeerId(id));
    p.bitfield = BF::repeat(true, num_pieces);
    p.max_requests = 32;
    p
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
struct WireLog {
    lines: Vec<String>,
}

impl RequestSink for WireLog {
    fn set_interested(&mut self, value: bool) -> bool {
        self.lines.push(format!("interested {value}"));
        true
    }
    fn cancel(&mut self, r: RequestIndex) -> bool {
        self.lines.push(format!("cancel {r}"));
        true
    }
    fn request(&mut self, r: RequestIndex) -> bool {
        self.lines.push(format!("request {r}"));
        true
    }
}

#[test]
fn test_identical_snapshots_emit_identical_requests() {
    // Two passes over the same snapshot, no contention (so the shuffle never
    // triggers), starting from the same peer state: byte-identical output.
    let run = || {
        let mut s = Scheduler::new();
        let t = torrent(1, 4);
        s.add_torrent(&t);
        let input = SchedulerInput {
            torrents: vec![t],
            capacity: None,
            max_unverified_bytes: 0,
        };
        let peer = peer(1, 4);
        let mut state = PeerRequestState::default();
        state.mark_needs_update("test");
        let mut sink = WireLog::default();
        assert!(s.maybe_update_peer(
            &input,
            hash(1),
            &peer,
            &mut state,
            &mut sink,
            &mut NullTimer,
        ));
        sink.lines
    };
    assert_eq!(run(), run());
}

#[test]
fn test_cross_torrent_order_flows_through_desired_state() {
    // Torrent 1 has budget for a single unverified piece. The partially
    // downloaded piece 1 ranks first in piece-order, so it is the one that
    // gets the budget, and the peer's desired list holds only its chunks.
    // Torrent 2's high-priority piece walks first overall but spends
    // neither torrent 1's budget nor shows up for a torrent-1 peer.
    let mut s = Scheduler::new();
    let mut t1 = torrent(1, 2);
    t1.pieces[1].partial = true;
    t1.max_unverified_bytes = 32768;
    let mut t2 = torrent(2, 1);
    t2.pieces[0].priority = PiecePriority::High;
    s.add_torrent(&t1);
    s.add_torrent(&t2);

    let input = SchedulerInput {
        torrents: vec![t1, t2],
        capacity: None,
        max_unverified_bytes: 0,
    };

    let p = peer(1, 2);
    let state = PeerRequestState::default();
    let desired = desired_request_state(
        &input,
        s.piece_order(),
        hash(1),
        &p,
        &state,
        s.pending(&hash(1)),
    );
    assert_eq!(desired.requests, vec![2, 3]);
}

#[test]
fn test_requests_of_one_peer_deprioritized_for_another() {
    // Peer A takes piece 0's chunks. In peer B's next desired list those
    // chunks sink below piece 1's, spreading the swarm's requests.
    let mut s = Scheduler::new();
    let t = torrent(1, 2);
    s.add_torrent(&t);
    let input = SchedulerInput {
        torrents: vec![t],
        capacity: None,
        max_unverified_bytes: 0,
    };

    // cap peer A so it only takes piece 0's two chunks
    let mut peer_a = peer(1, 2);
    peer_a.nominal_max_requests = 2;
    let mut state_a = PeerRequestState::default();
    state_a.mark_needs_update("test");
    let mut sink_a = WireLog::default();
    assert!(s.maybe_update_peer(
        &input,
        hash(1),
        &peer_a,
        &mut state_a,
        &mut sink_a,
        &mut NullTimer,
    ));
    assert_eq!(state_a.actual, HashSet::from_iter([0, 1]));

    let peer_b = peer(2, 2);
    let state_b = PeerRequestState::default();
    let desired_b = desired_request_state(
        &input,
        s.piece_order(),
        hash(1),
        &peer_b,
        &state_b,
        s.pending(&hash(1)),
    );
    assert_eq!(&desired_b.requests[..2], &[2, 3]);
}

#[test]
fn test_piece_lifecycle_retires_requests_and_reorders() {
    let mut s = Scheduler::new();
    let t = torrent(1, 2);
    s.add_torrent(&t);
    let input = SchedulerInput {
        torrents: vec![t.clone()],
        capacity: None,
        max_unverified_bytes: 0,
    };

    let p = peer(1, 2);
    let mut state = PeerRequestState::default();
    state.mark_needs_update("test");
    let mut sink = WireLog::default();
    assert!(s.maybe_update_peer(&input, hash(1), &p, &mut state, &mut sink, &mut NullTimer));
    assert_eq!(state.actual.len(), 4);

    // the peer answers piece 0's chunks; the hashing pipeline flips the
    // piece's availability state
    for r in [0, 1] {
        assert!(state.on_piece_received(r, s.pending_mut(&hash(1))));
    }
    assert_eq!(state.actual.len(), 2);
    s.update_piece(
        PieceOrderKey {
            info_hash: hash(1),
            index: 0,
        },
        PieceOrderState {
            priority: PiecePriority::None,
            partial: true,
            availability: 0,
        },
    );

    // next pass: piece 0 no longer requestable in the snapshot, piece 1
    // requests stay put (no cancels, no re-requests)
    let mut input = input;
    input.torrents[0].pieces[0].request = false;
    input.torrents[0].pieces[0].pending_chunks.fill(false);
    state.mark_needs_update("piece done");
    sink.lines.clear();
    assert!(s.maybe_update_peer(&input, hash(1), &p, &mut state, &mut sink, &mut NullTimer));
    assert!(sink.lines.is_empty(), "unexpected wire traffic: {:?}", sink.lines);
    assert_eq!(state.actual, HashSet::from_iter([2, 3]));
}

#[test]
fn test_batch_allocation_then_per_peer_application() {
    // The planning pass proposes disjoint chunk sets; applying each peer's
    // bounded desired state never exceeds caps and covers what was planned.
    let mut s = Scheduler::new();
    let t = torrent(1, 4);
    s.add_torrent(&t);
    let input = SchedulerInput {
        torrents: vec![t],
        capacity: None,
        max_unverified_bytes: 0,
    };

    let mut peers = HashMap::new();
    peers.insert(
        hash(1),
        vec![
            AllocPeer::new(peer(1, 4)),
            AllocPeer::new(peer(2, 4)),
        ],
    );
    s.allocate_next_requests(&input, &mut peers);

    let mut seen = HashSet::new();
    for ap in &peers[&hash(1)] {
        for &r in &ap.next.requests {
            assert!(seen.insert(r), "chunk {r} planned twice");
        }
        assert!(ap.next.requests.len() <= ap.peer.max_requests);
    }
    assert_eq!(seen.len(), 8);

    for ap in &peers[&hash(1)] {
        let mut state = PeerRequestState::default();
        state.mark_needs_update("planned");
        let mut sink = WireLog::default();
        assert!(s.maybe_update_peer(
            &input,
            hash(1),
            &ap.peer,
            &mut state,
            &mut sink,
            &mut NullTimer,
        ));
        assert!(state.actual.len() <= ap.peer.request_cap());
    }
}

#[test]
fn test_unverified_budget_holds_back_low_ranked_pieces() {
    let mut s = Scheduler::new();
    let mut t = torrent(1, 3);
    t.max_unverified_bytes = 65536; // room for two 32 KiB pieces
    t.pieces[2].priority = PiecePriority::High;
    s.add_torrent(&t);
    let input = SchedulerInput {
        torrents: vec![t],
        capacity: None,
        max_unverified_bytes: 0,
    };

    let p = peer(1, 3);
    let state = PeerRequestState::default();
    let desired = desired_request_state(
        &input,
        s.piece_order(),
        hash(1),
        &p,
        &state,
        s.pending(&hash(1)),
    );
    // high-priority piece 2 and piece 0 fit the budget; piece 1 is held back
    let pieces: HashSet<u32> = desired.requests.iter().map(|r| r / 2).collect();
    assert_eq!(pieces, HashSet::from_iter([0, 2]));
}

#[test]
fn test_apply_is_idempotent_when_nothing_changed() {
    let mut s = Scheduler::new();
    let t = torrent(1, 2);
    s.add_torrent(&t);
    let input = SchedulerInput {
        torrents: vec![t],
        capacity: None,
        max_unverified_bytes: 0,
    };
    let p = peer(1, 2);
    let mut state = PeerRequestState::default();
    state.mark_needs_update("first");
    let mut sink = WireLog::default();
    assert!(s.maybe_update_peer(&input, hash(1), &p, &mut state, &mut sink, &mut NullTimer));
    let after_first = state.actual.clone();

    // second pass over the identical snapshot: no wire traffic at all
    state.mark_needs_update("second");
    sink.lines.clear();
    let desired = desired_request_state(
        &input,
        s.piece_order(),
        hash(1),
        &p,
        &state,
        s.pending(&hash(1)),
    );
    assert!(apply_request_state(
        &desired,
        &mut state,
        s.pending_mut(&hash(1)),
        p.request_cap(),
        &mut sink,
        &mut NullTimer,
    ));
    assert!(sink.lines.is_empty());
    assert_eq!(state.actual, after_first);
}
