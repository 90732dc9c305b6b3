use requin_core::{lengths::Lengths, Id20};

use crate::{
    piece_order::{PieceOrderState, PiecePriority},
    type_aliases::{ChunkIndex, RequestIndex, BF},
};

/// One piece of the per-pass snapshot.
#[derive(Debug, Clone)]
pub struct PieceSnapshot {
    /// False while the piece is ignored for requests (e.g. being hashed).
    pub request: bool,
    pub priority: PiecePriority,
    pub partial: bool,
    pub availability: i64,
    pub length: u64,
    /// Force even striping across peers regardless of the last-piece rule.
    pub always_reallocate: bool,
    /// One bit per chunk still needed.
    pub pending_chunks: BF,
}

impl PieceSnapshot {
    pub fn num_pending_chunks(&self) -> u32 {
        self.pending_chunks.count_ones() as u32
    }

    pub fn iter_pending_chunks(&self) -> impl Iterator<Item = ChunkIndex> + '_ {
        self.pending_chunks.iter_ones().map(|i| i as ChunkIndex)
    }

    pub fn order_state(&self) -> PieceOrderState {
        PieceOrderState {
            priority: self.priority,
            partial: self.partial,
            availability: self.availability,
        }
    }
}

/// Immutable view of one torrent for a scheduling pass.
#[derive(Debug, Clone)]
pub struct TorrentSnapshot {
    pub info_hash: Id20,
    /// Request-index stride; uniform within the torrent.
    pub chunks_per_piece: u32,
    /// Cap on bytes requested but not yet hash-verified. 0 = unlimited.
    pub max_unverified_bytes: u64,
    pub pieces: Vec<PieceSnapshot>,
}

impl TorrentSnapshot {
    /// A fresh snapshot from the torrent's geometry: every piece requestable
    /// at normal priority with all chunks pending.
    pub fn new(info_hash: Id20, lengths: &Lengths) -> Self {
        let pieces = lengths
            .iter_piece_infos()
            .map(|pi| PieceSnapshot {
                request: true,
                priority: PiecePriority::Normal,
                partial: false,
                availability: 0,
                length: pi.len as u64,
                always_reallocate: false,
                pending_chunks: BF::repeat(true, lengths.chunks_per_piece(pi.piece_index) as usize),
            })
            .collect();
        Self {
            info_hash,
            chunks_per_piece: lengths.default_chunks_per_piece(),
            max_unverified_bytes: 0,
            pieces,
        }
    }

    pub fn request_index(&self, piece_index: u32, chunk: ChunkIndex) -> RequestIndex {
        self.chunks_per_piece * piece_index + chunk
    }

    pub fn piece_of_request_index(&self, request_index: RequestIndex) -> u32 {
        request_index / self.chunks_per_piece
    }

    pub fn total_request_indices(&self) -> u32 {
        self.pieces.len() as u32 * self.chunks_per_piece
    }
}

/// All torrents sharing one storage capacity, observed atomically for one
/// scheduling pass.
#[derive(Debug, Clone, Default)]
pub struct SchedulerInput {
    pub torrents: Vec<TorrentSnapshot>,
    /// Remaining storage capacity shared by all torrents. None = unlimited.
    pub capacity: Option<u64>,
    /// Unverified-byte cap across the whole set. 0 = unlimited.
    pub max_unverified_bytes: u64,
}

impl SchedulerInput {
    pub fn torrent(&self, info_hash: &Id20) -> Option<&TorrentSnapshot> {
        self.torrents.iter().find(|t| t.info_hash == *info_hash)
    }
}
