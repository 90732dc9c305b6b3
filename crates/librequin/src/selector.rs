use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use requin_core::Id20;
use serde::Serialize;
use tracing::trace;

use crate::{
    input::{PieceSnapshot, SchedulerInput, TorrentSnapshot},
    piece_order::{piece_order_cmp, PieceOrderKey, PieceRequestOrder},
};

// Tracks the capacity and unverified-byte budgets across one walk.
struct BudgetWalk {
    // Storage left for this pass. None disables the check.
    storage_left: Option<u64>,
    global_limit: u64,
    global_unverified: u64,
    per_torrent_unverified: HashMap<Id20, u64>,
}

impl BudgetWalk {
    fn new(input: &SchedulerInput) -> Self {
        Self {
            storage_left: input.capacity,
            global_limit: input.max_unverified_bytes,
            global_unverified: 0,
            per_torrent_unverified: HashMap::new(),
        }
    }

    // Whether the piece may have chunks allocated this pass, debiting the
    // budgets it consumes.
    fn admit(&mut self, t: &TorrentSnapshot, piece: &PieceSnapshot) -> bool {
        if let Some(left) = self.storage_left.as_mut() {
            if *left < piece.length {
                return false;
            }
            // Debited before the requestable test on purpose: storage stays
            // reserved for pieces currently being hashed.
            *left -= piece.length;
        }
        if !piece.request || piece.num_pending_chunks() == 0 {
            return false;
        }
        if t.max_unverified_bytes != 0 {
            let used = self
                .per_torrent_unverified
                .get(&t.info_hash)
                .copied()
                .unwrap_or(0);
            if used + piece.length > t.max_unverified_bytes {
                return false;
            }
        }
        if self.global_limit != 0 && self.global_unverified + piece.length > self.global_limit {
            return false;
        }
        *self
            .per_torrent_unverified
            .entry(t.info_hash)
            .or_insert(0) += piece.length;
        self.global_unverified += piece.length;
        true
    }
}

/// Calls `f` exactly once per piece eligible for chunk allocation this pass,
/// in piece-order as maintained by `order`.
pub fn for_each_requestable_piece<'a>(
    input: &'a SchedulerInput,
    order: &PieceRequestOrder,
    mut f: impl FnMut(&'a TorrentSnapshot, &'a PieceSnapshot, u32),
) {
    let by_hash: HashMap<Id20, &TorrentSnapshot> = input
        .torrents
        .iter()
        .map(|t| (t.info_hash, t))
        .collect();
    let mut walk = BudgetWalk::new(input);
    for (key, _state) in order.iter() {
        // The order may span torrents not present in this snapshot.
        let Some(&t) = by_hash.get(&key.info_hash) else {
            continue;
        };
        let Some(piece) = t.pieces.get(key.index as usize) else {
            continue;
        };
        if walk.admit(t, piece) {
            f(t, piece, key.index);
        }
    }
}

/// Same walk driven by a one-shot sort of the snapshot itself, with the sort
/// permutation memoized in `cache`. For callers without a live
/// [`PieceRequestOrder`].
pub fn for_each_requestable_piece_oneshot<'a>(
    input: &'a SchedulerInput,
    cache: &PieceSortCache,
    mut f: impl FnMut(&'a TorrentSnapshot, &'a PieceSnapshot, u32),
) {
    let mut pieces: Vec<(&TorrentSnapshot, u32)> = Vec::new();
    for t in &input.torrents {
        for index in 0..t.pieces.len() as u32 {
            pieces.push((t, index));
        }
    }
    let order = cache.sort_permutation(&pieces);
    let mut walk = BudgetWalk::new(input);
    for i in order {
        let (t, index) = pieces[i];
        let piece = &t.pieces[index as usize];
        if walk.admit(t, piece) {
            f(t, piece, index);
        }
    }
}

// The fields the piece comparator looks at, captured per entry. Two walks
// over inputs with equal fingerprints sort identically, so the permutation
// can be reused.
#[derive(Clone, Copy, PartialEq, Eq)]
struct SortFingerprintEntry {
    key: PieceOrderKey,
    priority: crate::piece_order::PiecePriority,
    partial: bool,
    availability: i64,
}

impl SortFingerprintEntry {
    fn order_state(&self) -> crate::piece_order::PieceOrderState {
        crate::piece_order::PieceOrderState {
            priority: self.priority,
            partial: self.partial,
            availability: self.availability,
        }
    }
}

struct SortCacheEntry {
    fingerprint: Vec<SortFingerprintEntry>,
    order: Vec<usize>,
}

#[derive(Default)]
struct SortCacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SortCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Memoizes sort permutations of snapshot slices by fingerprint equality.
///
/// Entries are evicted oldest-first once the cache is full; the embedder can
/// also clear it whenever the snapshot shape changes for good (torrent
/// added/removed).
pub struct PieceSortCache {
    entries: Mutex<VecDeque<SortCacheEntry>>,
    max_entries: usize,
    counters: SortCacheCounters,
}

impl Default for PieceSortCache {
    fn default() -> Self {
        Self::new(8)
    }
}

impl PieceSortCache {
    pub fn new(max_entries: usize) -> Self {
        assert!(max_entries > 0, "sort cache needs room for at least one entry");
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries,
            counters: Default::default(),
        }
    }

    fn sort_permutation(&self, pieces: &[(&TorrentSnapshot, u32)]) -> Vec<usize> {
        let fingerprint: Vec<SortFingerprintEntry> = pieces
            .iter()
            .map(|&(t, index)| {
                let piece = &t.pieces[index as usize];
                SortFingerprintEntry {
                    key: PieceOrderKey {
                        info_hash: t.info_hash,
                        index,
                    },
                    priority: piece.priority,
                    partial: piece.partial,
                    availability: piece.availability,
                }
            })
            .collect();

        {
            let g = self.entries.lock();
            if let Some(entry) = g.iter().find(|e| e.fingerprint == fingerprint) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                trace!("reused piece sort permutation");
                return entry.order.clone();
            }
        }

        let mut order: Vec<usize> = (0..fingerprint.len()).collect();
        order.sort_by(|&a, &b| {
            let (l, r) = (&fingerprint[a], &fingerprint[b]);
            piece_order_cmp(&l.key, &l.order_state(), &r.key, &r.order_state())
        });
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let mut g = self.entries.lock();
        if g.len() == self.max_entries {
            g.pop_front();
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        g.push_back(SortCacheEntry {
            fingerprint,
            order: order.clone(),
        });
        order
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> SortCacheStats {
        SortCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}
