#![forbid(unsafe_code)]

//! Identifiers, keys, item heads and the error type shared by every layer of the tree.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a fixed-size block managed by the allocator.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the balancing engine and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum StreeError {
    /// Reading or writing a block failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A structural invariant does not hold; the affected region must not be modified further.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller passed an argument the tree cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The addressed item does not exist.
    #[error("not found")]
    NotFound,
    /// An item with the same key is already stored.
    #[error("item already exists")]
    ItemExists,
    /// A concurrent structural change invalidated the path; search again and retry.
    #[error("repeat search")]
    RepeatSearch,
    /// The allocator cannot supply the blocks a balance needs.
    #[error("no disk space")]
    NoDiskSpace,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreeError>;

/// Item type tag carried in every key.
///
/// The tag decides the unit granularity of an item body, whether two
/// neighbouring items may be merged, and (through
/// [`crate::options::TreeOptions::flow_kinds`]) whether an item may be split.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Object metadata record. Never merged, never split.
    StatData = 0,
    /// Array of block pointers.
    Indirect = 1,
    /// Inline file bytes.
    Direct = 2,
    /// Fixed-size directory entry slots.
    Directory = 3,
}

/// Size in bytes of one indirect item unit (a block pointer).
pub const INDIRECT_UNIT_LEN: usize = 4;
/// Size in bytes of one directory entry slot.
pub const DIR_ENTRY_LEN: usize = 16;

impl ItemKind {
    /// Number of body bytes per unit, or `None` when the body is one indivisible unit.
    pub const fn unit_len(self) -> Option<usize> {
        match self {
            ItemKind::StatData => None,
            ItemKind::Indirect => Some(INDIRECT_UNIT_LEN),
            ItemKind::Direct => Some(1),
            ItemKind::Directory => Some(DIR_ENTRY_LEN),
        }
    }

    /// Whether items of this kind may be glued to a neighbouring part of the same object.
    pub const fn is_mergeable(self) -> bool {
        !matches!(self, ItemKind::StatData)
    }

    /// Number of units in a body of `len` bytes.
    pub fn units(self, len: usize) -> usize {
        match self.unit_len() {
            Some(unit) => len / unit,
            None => 1,
        }
    }
}

/// Tree key: `(dir_id, object_id, offset, kind)` ordered lexicographically.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Key {
    /// Parent directory of the object.
    pub dir_id: u32,
    /// Object identifier.
    pub object_id: u32,
    /// Position of the item inside its object, counted in units.
    pub offset: u64,
    /// Item type.
    pub kind: ItemKind,
}

impl Key {
    /// Smallest possible key.
    pub const MIN: Key = Key {
        dir_id: 0,
        object_id: 0,
        offset: 0,
        kind: ItemKind::StatData,
    };

    /// Creates a key.
    pub const fn new(dir_id: u32, object_id: u32, offset: u64, kind: ItemKind) -> Self {
        Self {
            dir_id,
            object_id,
            offset,
            kind,
        }
    }

    /// Returns this key moved `units` further into the object.
    pub fn advanced(&self, units: usize) -> Key {
        Key {
            offset: self.offset + units as u64,
            ..*self
        }
    }

    /// Whether both keys address the same object.
    pub fn same_object(&self, other: &Key) -> bool {
        self.dir_id == other.dir_id && self.object_id == other.object_id
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dir_id
            .cmp(&other.dir_id)
            .then_with(|| self.object_id.cmp(&other.object_id))
            .then_with(|| self.offset.cmp(&other.offset))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} {} {:?}]",
            self.dir_id, self.object_id, self.offset, self.kind
        )
    }
}

/// Header of a leaf item: its key and body length.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ItemHead {
    /// Item key.
    pub key: Key,
    /// Body length in bytes.
    pub len: usize,
}

impl ItemHead {
    /// Creates a head.
    pub const fn new(key: Key, len: usize) -> Self {
        Self { key, len }
    }

    /// Number of units in the body.
    pub fn units(&self) -> usize {
        self.key.kind.units(self.len)
    }

    /// Bytes occupied by `units` units of this item.
    pub fn unit_bytes(&self, units: usize) -> usize {
        match self.key.kind.unit_len() {
            Some(unit) => units * unit,
            None => self.len,
        }
    }

    /// Key just past the item's last unit; for kinds without units, the key itself.
    ///
    /// Every split of the item produces a key in `[key, end_key)`, so no
    /// other item of the tree may start inside that range.
    pub fn end_key(&self) -> Key {
        match self.key.kind.unit_len() {
            Some(_) => self.key.advanced(self.units()),
            None => self.key,
        }
    }

    /// Whether `next`, the following item in key order, starts at or after this item's end.
    pub fn precedes(&self, next: &Key) -> bool {
        self.end_key() <= *next
    }

    /// Whether `right` directly continues this item, so both can be glued into one.
    pub fn merges_with(&self, right: &ItemHead) -> bool {
        self.key.kind.is_mergeable()
            && self.key.kind == right.key.kind
            && self.key.same_object(&right.key)
            && right.key.offset == self.key.offset + self.units() as u64
    }
}
