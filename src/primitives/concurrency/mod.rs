#![forbid(unsafe_code)]

//! Tree-wide reader/writer coordination with an optimistic generation check.
//!
//! Planning runs under a shared [`ReadSection`] and never mutates; execution
//! runs under an exclusive [`WriteSection`]. Moving from the former to the
//! latter is a blocking point: once the exclusive lock is held the
//! generation is compared with the snapshot taken while planning, and any
//! committed change in between yields [`StreeError::RepeatSearch`].

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{Result, StreeError};

/// Shared state guarded by one lock and versioned by a generation counter.
pub struct TreeLock<T> {
    state: RwLock<T>,
    generation: AtomicU64,
    contended: AtomicU64,
}

/// Snapshot of lock activity for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct LockSnapshot {
    /// Current generation.
    pub generation: u64,
    /// Number of acquisitions that had to wait.
    pub contended: u64,
}

/// Shared access plus the generation observed when it was taken.
pub struct ReadSection<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    generation: u64,
}

/// Exclusive access; bumps the generation on drop once marked dirty.
pub struct WriteSection<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    generation: &'a AtomicU64,
    dirty: bool,
}

impl<T> TreeLock<T> {
    /// Wraps `state` with generation zero.
    pub fn new(state: T) -> Self {
        Self {
            state: RwLock::new(state),
            generation: AtomicU64::new(0),
            contended: AtomicU64::new(0),
        }
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::Acquire)
    }

    /// Acquires shared access, blocking while a writer holds the lock.
    pub fn read(&self) -> ReadSection<'_, T> {
        let guard = match self.state.try_read() {
            Some(guard) => guard,
            None => {
                self.contended.fetch_add(1, AtomicOrdering::Relaxed);
                self.state.read()
            }
        };
        ReadSection {
            guard,
            generation: self.generation(),
        }
    }

    /// Acquires exclusive access if nothing was committed since `snapshot`.
    pub fn write_at(&self, snapshot: u64) -> Result<WriteSection<'_, T>> {
        let guard = match self.state.try_write() {
            Some(guard) => guard,
            None => {
                self.contended.fetch_add(1, AtomicOrdering::Relaxed);
                self.state.write()
            }
        };
        if self.generation() != snapshot {
            tracing::debug!(
                target: "stree::lock",
                snapshot,
                current = self.generation(),
                "generation moved while waiting for exclusive access"
            );
            return Err(StreeError::RepeatSearch);
        }
        Ok(WriteSection {
            guard,
            generation: &self.generation,
            dirty: false,
        })
    }

    /// Returns a snapshot of the lock counters.
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            generation: self.generation(),
            contended: self.contended.load(AtomicOrdering::Relaxed),
        }
    }
}

impl<T> ReadSection<'_, T> {
    /// Generation observed when the section was opened.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T> Deref for ReadSection<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> WriteSection<'_, T> {
    /// Records that the guarded state is about to change.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl<T> Deref for WriteSection<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WriteSection<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for WriteSection<'_, T> {
    fn drop(&mut self) {
        if self.dirty {
            self.generation.fetch_add(1, AtomicOrdering::AcqRel);
        }
    }
}
