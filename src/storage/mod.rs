//! Tree storage layer.
//!
//! Nodes, key search, balance planning and execution over the block arena.

/// S+tree nodes and the balancing algorithm.
///
/// Plans every change against a virtual copy of the affected nodes first,
/// then applies it level by level once enough blocks are reserved.
pub mod stree;
