//! The request scheduling core of a swarm download client: given a snapshot of
//! every torrent, every connected peer and every pending chunk, decide which
//! pieces may be requested next and which exact chunk requests each peer
//! should have outstanding.
//!
//! ## Architecture
//! The pipeline runs leaves-first over an immutable per-pass snapshot:
//!
//! - [`piece_order`] maintains the incrementally updated piece ordering
//!   (priority, partial-first, rarest-first) across all torrents sharing a
//!   storage capacity.
//! - [`selector`] walks that order applying storage-capacity and
//!   unverified-byte budgets, yielding the pieces that may have chunks
//!   requested this pass.
//! - [`allocator`] assigns every pending chunk of a yielded piece to at most
//!   one peer, honoring per-peer caps, choking, allowed-fast and
//!   load-balancing.
//! - [`desired`] bounds one peer's candidate requests to its request cap
//!   through a min-heap over a secondary ordering.
//! - [`apply`] diffs the desired set against the peer's outstanding requests
//!   and emits `interested`/`cancel`/`request`, backing off when the
//!   transport blocks.
//!
//! [`scheduler::Scheduler`] owns the cross-pass state (the piece order, the
//! sort-permutation cache, the per-torrent pending-request multisets);
//! [`updater`] drives per-peer re-passes off notifications and a 3-second
//! fallback timer.
//!
//! Scheduler-internal invariant violations are bugs and panic; transport
//! backpressure is a plain `bool`. No error type crosses a component
//! boundary.

#![warn(clippy::cast_possible_truncation)]

pub mod allocator;
pub mod apply;
pub mod desired;
pub mod input;
pub mod peers;
pub mod pending;
pub mod piece_order;
pub mod scheduler;
pub mod selector;
mod type_aliases;
pub mod updater;

pub use allocator::{allocate_pending_chunks, AllocPeer, NextRequestState, RequestablePiece};
pub use apply::{apply_request_state, NullTimer, RequestSink, UpdateTimer, REQUEST_UPDATE_INTERVAL};
pub use desired::{desired_request_state, DesiredRequestState};
pub use input::{PieceSnapshot, SchedulerInput, TorrentSnapshot};
pub use peers::{PeerId, PeerRequestState, PeerSnapshot};
pub use pending::PendingRequests;
pub use piece_order::{PieceOrderKey, PieceOrderState, PiecePriority, PieceRequestOrder};
pub use scheduler::Scheduler;
pub use selector::{for_each_requestable_piece, PieceSortCache};
pub use type_aliases::{ChunkIndex, RequestIndex, BF};

#[cfg(test)]
mod tests;

/// The cargo version of librequin.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
