use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap},
};

use requin_core::Id20;

/// Download urgency of a piece. Later variants outrank earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PiecePriority {
    #[default]
    None,
    Normal,
    High,
    Readahead,
    Next,
    Now,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceOrderKey {
    pub info_hash: Id20,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PieceOrderState {
    pub priority: PiecePriority,
    pub partial: bool,
    pub availability: i64,
}

/// The piece ordering: priority descending, partially-downloaded pieces
/// first, rarer pieces first, then piece index and info-hash for
/// determinism.
///
/// This is the single source of truth for piece order. The index tree below
/// and the one-shot sorts in [`crate::selector`] both go through it.
pub fn piece_order_cmp(
    lk: &PieceOrderKey,
    ls: &PieceOrderState,
    rk: &PieceOrderKey,
    rs: &PieceOrderState,
) -> Ordering {
    rs.priority
        .cmp(&ls.priority)
        .then_with(|| rs.partial.cmp(&ls.partial))
        .then_with(|| ls.availability.cmp(&rs.availability))
        .then_with(|| lk.index.cmp(&rk.index))
        .then_with(|| lk.info_hash.cmp(&rk.info_hash))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OrderItem {
    key: PieceOrderKey,
    state: PieceOrderState,
}

impl Ord for OrderItem {
    fn cmp(&self, other: &Self) -> Ordering {
        piece_order_cmp(&self.key, &self.state, &other.key, &other.state)
    }
}

impl PartialOrd for OrderItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An incrementally maintained ordered set of every piece of every torrent
/// sharing one storage capacity. O(log n) under availability churn.
///
/// Key misuse (double add, update/delete of an absent key) means the caller's
/// piece lifecycle tracking is corrupted, and panics.
#[derive(Debug, Default)]
pub struct PieceRequestOrder {
    tree: BTreeSet<OrderItem>,
    keys: HashMap<PieceOrderKey, PieceOrderState>,
}

impl PieceRequestOrder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, key: PieceOrderKey, state: PieceOrderState) {
        if self.keys.insert(key, state).is_some() {
            panic!("piece order: key added twice: {key:?}");
        }
        assert!(
            self.tree.insert(OrderItem { key, state }),
            "piece order: tree and key map out of sync for {key:?}"
        );
    }

    pub fn update(&mut self, key: PieceOrderKey, state: PieceOrderState) {
        let prev = match self.keys.insert(key, state) {
            Some(prev) => prev,
            None => panic!("piece order: update of missing key: {key:?}"),
        };
        assert!(
            self.tree.remove(&OrderItem { key, state: prev }),
            "piece order: tree and key map out of sync for {key:?}"
        );
        assert!(
            self.tree.insert(OrderItem { key, state }),
            "piece order: tree and key map out of sync for {key:?}"
        );
    }

    pub fn delete(&mut self, key: PieceOrderKey) {
        let prev = match self.keys.remove(&key) {
            Some(prev) => prev,
            None => panic!("piece order: delete of missing key: {key:?}"),
        };
        assert!(
            self.tree.remove(&OrderItem { key, state: prev }),
            "piece order: tree and key map out of sync for {key:?}"
        );
    }

    pub fn get(&self, key: &PieceOrderKey) -> Option<&PieceOrderState> {
        self.keys.get(key)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Pieces in ascending piece-order.
    pub fn iter(&self) -> impl Iterator<Item = (&PieceOrderKey, &PieceOrderState)> {
        self.tree.iter().map(|item| (&item.key, &item.state))
    }
}
