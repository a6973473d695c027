//! Low-level primitives the tree is built on.
//!
//! Includes block allocation, the block arena and tree-wide concurrency control.

/// Concurrency primitives and synchronization.
///
/// Reader/writer coordination with an optimistic generation counter.
pub mod concurrency;

/// Block allocation and storage.
///
/// The allocator trait, reservations held by a balance and the block arena.
pub mod store;
