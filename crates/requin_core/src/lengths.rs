use crate::constants::CHUNK_SIZE;

const fn is_power_of_two(x: u64) -> bool {
    (x != 0) && ((x & (x - 1)) == 0)
}

pub const fn ceil_div_u64(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

pub const fn last_element_size_u64(total: u64, element_size: u64) -> u64 {
    let rem = total % element_size;
    if rem == 0 {
        return element_size;
    }
    rem
}

/// A piece index that has been validated against a torrent's geometry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub piece_index: ValidPieceIndex,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub piece_index: ValidPieceIndex,
    pub chunk_index: u32,
    // request_index == piece_index * default_chunks_per_piece + chunk_index.
    pub request_index: u32,
    pub size: u32,
    pub offset: u32,
}

/// The piece/chunk geometry of a single torrent.
///
/// Request indices are laid out with the *default* chunks-per-piece as the
/// stride, so the last piece's range stays fully addressable even when it
/// holds fewer chunks.
#[derive(Debug, Clone, Copy)]
pub struct Lengths {
    chunk_length: u32,
    total_length: u64,
    piece_length: u32,
    last_piece_id: u32,
    last_piece_length: u32,
    chunks_per_piece: u32,
}

impl Lengths {
    pub fn new(total_length: u64, piece_length: u32, chunk_length: Option<u32>) -> anyhow::Result<Self> {
        let chunk_length = chunk_length.unwrap_or(CHUNK_SIZE);
        if !is_power_of_two(chunk_length as u64) {
            anyhow::bail!("chunk length {} is not a power of 2", chunk_length);
        }
        if chunk_length > piece_length {
            anyhow::bail!(
                "chunk length {} should be <= piece length {}",
                chunk_length,
                piece_length
            );
        }
        if total_length == 0 {
            anyhow::bail!("torrent with 0 length")
        }
        let total_pieces_u64 = ceil_div_u64(total_length, piece_length as u64);
        let chunks_per_piece = ceil_div_u64(piece_length as u64, chunk_length as u64);
        // Request indices are u32; refuse geometries that would overflow.
        if total_pieces_u64
            .checked_mul(chunks_per_piece)
            .is_none_or(|total| total > u32::MAX as u64)
        {
            anyhow::bail!(
                "torrent would have more than {} addressable chunks",
                u32::MAX
            );
        }
        let total_pieces = total_pieces_u64 as u32;
        Ok(Self {
            chunk_length,
            piece_length,
            total_length,
            chunks_per_piece: chunks_per_piece as u32,
            last_piece_id: total_pieces - 1,
            last_piece_length: last_element_size_u64(total_length, piece_length as u64) as u32,
        })
    }

    pub const fn total_length(&self) -> u64 {
        self.total_length
    }

    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }

    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }

    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }

    pub const fn default_chunk_length(&self) -> u32 {
        self.chunk_length
    }

    /// The request-index stride. Uniform across the torrent.
    pub const fn default_chunks_per_piece(&self) -> u32 {
        self.chunks_per_piece
    }

    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }

    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_length
    }

    pub const fn chunks_per_piece(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return (self.last_piece_length + self.chunk_length - 1) / self.chunk_length;
        }
        self.chunks_per_piece
    }

    /// First request index of the given piece.
    pub const fn request_index_offset(&self, index: ValidPieceIndex) -> u32 {
        index.0 * self.chunks_per_piece
    }

    pub const fn request_index(&self, index: ValidPieceIndex, chunk_index: u32) -> u32 {
        self.request_index_offset(index) + chunk_index
    }

    pub const fn piece_of_request_index(&self, request_index: u32) -> u32 {
        request_index / self.chunks_per_piece
    }

    pub const fn chunk_of_request_index(&self, request_index: u32) -> u32 {
        request_index % self.chunks_per_piece
    }

    /// Size of the per-torrent request-index space. Indices of the last
    /// piece's trailing gap (if any) are addressable but never pending.
    pub const fn total_request_indices(&self) -> u32 {
        self.total_pieces() * self.chunks_per_piece
    }

    pub fn chunk_size(&self, piece_index: ValidPieceIndex, chunk_index: u32) -> Option<u32> {
        if chunk_index >= self.chunks_per_piece(piece_index) {
            return None;
        }
        let offset = chunk_index * self.chunk_length;
        Some(std::cmp::min(
            self.chunk_length,
            self.piece_length(piece_index) - offset,
        ))
    }

    pub fn iter_piece_infos(&self) -> impl Iterator<Item = PieceInfo> {
        let last_id = self.last_piece_id;
        let last_len = self.last_piece_length;
        let pl = self.piece_length;
        (0..self.total_pieces()).map(move |idx| PieceInfo {
            piece_index: ValidPieceIndex(idx),
            len: if idx == last_id { last_len } else { pl },
        })
    }

    pub fn iter_chunk_infos(&self, index: ValidPieceIndex) -> impl Iterator<Item = ChunkInfo> {
        let mut remaining = self.piece_length(index);
        let chunk_size = self.chunk_length;
        let first_request_index = self.request_index_offset(index);
        (0u32..).scan(0, move |offset, idx| {
            if remaining == 0 {
                return None;
            }
            let s = std::cmp::min(remaining, chunk_size);
            let result = ChunkInfo {
                piece_index: index,
                chunk_index: idx,
                request_index: first_request_index + idx,
                size: s,
                offset: *offset,
            };
            *offset += s;
            remaining -= s;
            Some(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lengths() -> Lengths {
        Lengths::new(1174243328, 262144, None).unwrap()
    }

    #[test]
    fn test_total_pieces() {
        let l = make_lengths();
        assert_eq!(l.total_pieces(), 4480);
    }

    #[test]
    fn test_piece_length() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();

        assert_eq!(l.piece_length(l.validate_piece_index(0).unwrap()), 262144);
        assert_eq!(l.piece_length(p), 100352);
    }

    #[test]
    fn test_chunks_in_piece() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();

        assert_eq!(l.chunks_per_piece(l.validate_piece_index(0).unwrap()), 16);
        assert_eq!(l.chunks_per_piece(p), 7);
    }

    #[test]
    fn test_request_index_math() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();

        assert_eq!(l.request_index_offset(p), 71664);
        assert_eq!(l.request_index(p, 6), 71670);
        assert_eq!(l.piece_of_request_index(71670), 4479);
        assert_eq!(l.chunk_of_request_index(71670), 6);
        // the last piece has 7 real chunks but a stride of 16
        assert_eq!(l.total_request_indices(), 4480 * 16);
    }

    #[test]
    fn test_chunk_infos() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();

        let mut it = l.iter_chunk_infos(p);
        let first = it.next().unwrap();
        let last = it.last().unwrap();

        assert_eq!(
            first,
            ChunkInfo {
                piece_index: p,
                chunk_index: 0,
                request_index: 71664,
                size: 16384,
                offset: 0,
            }
        );

        assert_eq!(
            last,
            ChunkInfo {
                piece_index: p,
                chunk_index: 6,
                request_index: 71670,
                size: 2048,
                offset: 98304,
            }
        );
    }

    #[test]
    fn test_invalid_piece_index() {
        let l = make_lengths();
        assert!(l.validate_piece_index(4480).is_none());
    }

    #[test]
    fn test_rejects_unaddressable_chunk_count() {
        // request indices are u32; 2^32 chunks don't fit
        let total = (u32::MAX as u64 + 1) * 16384;
        assert!(Lengths::new(total, 16384, None).is_err());
    }
}
