//! Entity and group identifiers.
//!
//! An entity is identified by an [`Egid`]: the pair of an [`EntityId`] and the
//! [`GroupId`] of the exclusive partition it currently lives in. Entity ids are
//! only unique inside one group, so the same numeric id may be reused in every
//! other group without collisions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::EcsError;

/// Numeric entity identifier. Unique only within a group.
pub type EntityId = u32;

// ---------------------------------------------------------------------------
// GroupId
// ---------------------------------------------------------------------------

/// Identifier of an exclusive partition of entities.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bytemuck_derive::Pod,
    bytemuck_derive::Zeroable,
)]
#[repr(transparent)]
pub struct GroupId(u32);

impl GroupId {
    /// Wrap a raw group number.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw group number.
    #[inline]
    pub const fn id(self) -> u32 {
        self.0
    }

    /// The group `n` positions after this one, or `None` past `u32::MAX`.
    #[inline]
    pub const fn offset(self, n: u32) -> Option<Self> {
        match self.0.checked_add(n) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Egid
// ---------------------------------------------------------------------------

/// Entity-group id: the identity of an entity while it stays in one group.
///
/// Swapping an entity to another group gives it a new `Egid`.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bytemuck_derive::Pod,
    bytemuck_derive::Zeroable,
)]
#[repr(C)]
pub struct Egid {
    /// Id of the entity inside its group.
    pub entity_id: EntityId,
    /// The group the entity lives in.
    pub group_id: GroupId,
}

impl Egid {
    #[inline]
    pub const fn new(entity_id: EntityId, group_id: GroupId) -> Self {
        Self {
            entity_id,
            group_id,
        }
    }

    /// Same entity id, different group.
    #[inline]
    pub const fn with_group(self, group_id: GroupId) -> Self {
        Self::new(self.entity_id, group_id)
    }
}

impl fmt::Debug for Egid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Egid({}@{})", self.entity_id, self.group_id)
    }
}

impl fmt::Display for Egid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entity_id, self.group_id)
    }
}

// ---------------------------------------------------------------------------
// GroupAllocator
// ---------------------------------------------------------------------------

/// A contiguous block of group ids handed out by [`GroupAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupRange {
    start: GroupId,
    len: u32,
}

impl GroupRange {
    /// First group of the block.
    pub fn first(&self) -> GroupId {
        self.start
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `i`-th group of the block, if `i` is in range.
    pub fn get(&self, i: u32) -> Option<GroupId> {
        if i < self.len {
            self.start.offset(i)
        } else {
            None
        }
    }

    pub fn contains(&self, group: GroupId) -> bool {
        group.id() >= self.start.id() && group.id() - self.start.id() < self.len
    }

    pub fn iter(&self) -> impl Iterator<Item = GroupId> + '_ {
        (0..self.len).filter_map(move |i| self.start.offset(i))
    }
}

/// Hands out group ids that never overlap with earlier allocations.
///
/// Mixing allocated ids with hand-picked `GroupId::new` constants is allowed
/// but the caller is then responsible for keeping them apart.
#[derive(Debug, Default)]
pub struct GroupAllocator {
    next: u32,
}

impl GroupAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start allocating from `first` instead of zero.
    pub fn starting_at(first: u32) -> Self {
        Self { next: first }
    }

    /// Allocate a single group.
    pub fn allocate(&mut self) -> Result<GroupId, EcsError> {
        self.allocate_range(1).map(|range| range.first())
    }

    /// Allocate `len` consecutive groups.
    ///
    /// Fails without handing anything out when the block would run past
    /// `u32::MAX`.
    pub fn allocate_range(&mut self, len: u32) -> Result<GroupRange, EcsError> {
        let next = self
            .next
            .checked_add(len)
            .ok_or(EcsError::GroupIdsExhausted { next: self.next, requested: len })?;
        let start = GroupId::new(self.next);
        self.next = next;
        Ok(GroupRange { start, len })
    }

    /// Number of group ids handed out so far (including the starting offset).
    pub fn allocated(&self) -> u32 {
        self.next
    }
}
