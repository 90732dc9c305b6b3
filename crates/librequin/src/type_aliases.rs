pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// `piece_index * chunks_per_piece + chunk_index`; unique within one torrent.
pub type RequestIndex = u32;
pub type ChunkIndex = u32;
