use std::{collections::HashSet, time::Duration};

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::{
    desired::{adjusted_pending, DesiredRequestState},
    peers::PeerRequestState,
    pending::PendingRequests,
    type_aliases::RequestIndex,
};

/// How long until an idle peer with outstanding requests is re-passed.
pub const REQUEST_UPDATE_INTERVAL: Duration = Duration::from_secs(3);

/// Writes a pass's side effects to one peer connection. Each call returns
/// whether the write went through; `false` aborts the pass, leaving the
/// already-applied state intact, and the peer is re-passed later.
pub trait RequestSink {
    fn set_interested(&mut self, value: bool) -> bool;
    fn cancel(&mut self, r: RequestIndex) -> bool;
    fn request(&mut self, r: RequestIndex) -> bool;
}

/// The per-peer re-pass timer the applier arms and disarms.
pub trait UpdateTimer {
    fn stop(&mut self);
    fn reset(&mut self, after: Duration);
}

/// A no-op timer for callers driving passes themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTimer;

impl UpdateTimer for NullTimer {
    fn stop(&mut self) {}
    fn reset(&mut self, _after: Duration) {}
}

fn set_interested(
    state: &mut PeerRequestState,
    sink: &mut impl RequestSink,
    value: bool,
) -> bool {
    if state.interested == value {
        return true;
    }
    if !sink.set_interested(value) {
        return false;
    }
    state.interested = value;
    true
}

fn cancel_request(
    state: &mut PeerRequestState,
    sink: &mut impl RequestSink,
    r: RequestIndex,
) -> bool {
    if state.cancelled.contains(&r) {
        return true;
    }
    if !sink.cancel(r) {
        return false;
    }
    // The request stays outstanding (and pending) until the peer answers
    // with the chunk or a reject.
    state.cancelled.insert(r);
    true
}

/// Transmits `desired` to the peer: interest toggle, then cancels for
/// everything outstanding but no longer wanted, then requests in desired
/// order. Returns false as soon as a write blocks.
pub fn apply_request_state(
    desired: &DesiredRequestState,
    state: &mut PeerRequestState,
    pending: &mut PendingRequests,
    cap: usize,
    sink: &mut impl RequestSink,
    timer: &mut impl UpdateTimer,
) -> bool {
    if !set_interested(state, sink, desired.interested) {
        return false;
    }

    let mut more = true;
    let desired_set: HashSet<RequestIndex> = desired.requests.iter().copied().collect();
    let to_cancel: Vec<RequestIndex> = state
        .actual
        .iter()
        .copied()
        .filter(|r| !desired_set.contains(r))
        .collect();
    for r in to_cancel {
        if !cancel_request(state, sink, r) {
            more = false;
            break;
        }
    }

    if more {
        let mut requests = desired.requests.clone();
        let mut shuffled = false;
        let mut last_pending = 0u32;
        let mut i = 0;
        while i < requests.len() {
            let r = requests[i];
            if state.cancelled.contains(&r) {
                // A reject or piece message for this will retrigger an
                // update; nothing to do now.
                i += 1;
                continue;
            }
            // Outstanding cancels the peer hasn't answered yet can leave
            // more requests on the wire than we are about to desire.
            if state.actual.len() >= cap {
                break;
            }
            let current = state.actual.contains(&r);
            let other_pending = adjusted_pending(pending, r, current);
            if !shuffled {
                // Pending counts should only rise along the desired list;
                // it is the strongest ordering criterion after the
                // allowed-fast rule.
                assert!(
                    other_pending >= last_pending,
                    "desired requests out of pending order: {other_pending} after {last_pending}"
                );
                last_pending = other_pending;
                if other_pending > 0 {
                    // Everything from here on is already being fetched by
                    // some other peer; randomize to spread the contention.
                    requests[i..].shuffle(&mut rand::thread_rng());
                    debug!(from = i, total = requests.len(), "shuffled desired requests");
                    shuffled = true;
                    continue;
                }
            }
            if !current {
                if !sink.request(r) {
                    more = false;
                    break;
                }
                state.actual.insert(r);
                pending.inc(r);
            }
            i += 1;
        }
    }

    timer.stop();
    if more {
        state.needs_update = None;
        if !state.actual.is_empty() {
            timer.reset(REQUEST_UPDATE_INTERVAL);
        }
    }
    trace!(
        more,
        outstanding = state.actual.len(),
        "applied request state"
    );
    more
}
