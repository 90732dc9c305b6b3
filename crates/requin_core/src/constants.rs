/// The wire-level unit of a request ("block" in BEP-3 terms).
pub const CHUNK_SIZE: u32 = 16384;
