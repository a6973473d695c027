use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of balancing statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceStatsSnapshot {
    /// Number of key searches performed
    pub searches: u64,
    /// Number of operations applied without touching any neighbour
    pub in_place_edits: u64,
    /// Number of leaf nodes split
    pub leaf_splits: u64,
    /// Number of internal nodes split
    pub internal_splits: u64,
    /// Number of leaf nodes merged into neighbours and freed
    pub leaf_merges: u64,
    /// Number of internal nodes merged into neighbours and freed
    pub internal_merges: u64,
    /// Number of shifts into a left neighbour
    pub left_shifts: u64,
    /// Number of shifts into a right neighbour
    pub right_shifts: u64,
    /// Number of shifts that split an item across the boundary
    pub flow_shifts: u64,
    /// Number of planning restarts caused by concurrent changes
    pub restarts: u64,
    /// Number of times the tree grew a level
    pub root_grows: u64,
    /// Number of times the tree lost a level
    pub root_collapses: u64,
}

/// Thread-safe statistics tracking for balancing operations.
#[derive(Default)]
pub struct BalanceStats {
    searches: AtomicU64,
    in_place_edits: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    leaf_merges: AtomicU64,
    internal_merges: AtomicU64,
    left_shifts: AtomicU64,
    right_shifts: AtomicU64,
    flow_shifts: AtomicU64,
    restarts: AtomicU64,
    root_grows: AtomicU64,
    root_collapses: AtomicU64,
}

impl BalanceStats {
    /// Returns the current count of key searches.
    pub fn searches(&self) -> u64 {
        self.searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of operations that stayed inside one node.
    pub fn in_place_edits(&self) -> u64 {
        self.in_place_edits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of internal splits.
    pub fn internal_splits(&self) -> u64 {
        self.internal_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf merges.
    pub fn leaf_merges(&self) -> u64 {
        self.leaf_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of internal merges.
    pub fn internal_merges(&self) -> u64 {
        self.internal_merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of planning restarts.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of times a new root was added.
    pub fn root_grows(&self) -> u64 {
        self.root_grows.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of times the root was collapsed.
    pub fn root_collapses(&self) -> u64 {
        self.root_collapses.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_searches(&self) {
        self.searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_in_place_edits(&self) {
        self.in_place_edits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_splits(&self, leaf: bool, count: u64) {
        let counter = if leaf {
            &self.leaf_splits
        } else {
            &self.internal_splits
        };
        counter.fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self, leaf: bool) {
        let counter = if leaf {
            &self.leaf_merges
        } else {
            &self.internal_merges
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_left_shifts(&self) {
        self.left_shifts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_right_shifts(&self) {
        self.right_shifts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_flow_shifts(&self) {
        self.flow_shifts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_restarts(&self) {
        self.restarts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_grows(&self) {
        self.root_grows.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BalanceStatsSnapshot {
        BalanceStatsSnapshot {
            searches: self.searches(),
            in_place_edits: self.in_place_edits(),
            leaf_splits: self.leaf_splits(),
            internal_splits: self.internal_splits(),
            leaf_merges: self.leaf_merges(),
            internal_merges: self.internal_merges(),
            left_shifts: self.left_shifts.load(AtomicOrdering::Relaxed),
            right_shifts: self.right_shifts.load(AtomicOrdering::Relaxed),
            flow_shifts: self.flow_shifts.load(AtomicOrdering::Relaxed),
            restarts: self.restarts(),
            root_grows: self.root_grows(),
            root_collapses: self.root_collapses(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "stree::stats",
            searches = snapshot.searches,
            in_place_edits = snapshot.in_place_edits,
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            leaf_merges = snapshot.leaf_merges,
            internal_merges = snapshot.internal_merges,
            left_shifts = snapshot.left_shifts,
            right_shifts = snapshot.right_shifts,
            flow_shifts = snapshot.flow_shifts,
            restarts = snapshot.restarts,
            root_grows = snapshot.root_grows,
            root_collapses = snapshot.root_collapses,
            "stree stats snapshot"
        );
    }
}
