//! Per-group, per-type dense component storage.
//!
//! A [`ComponentStore<T>`] owns the records of one component type in one group
//! plus the [`DenseMap`] mapping entity id to record slot. Records are packed:
//! removing an entity moves the last record into its slot, so the slot of an
//! entity can change on any removal while its value does not.
//!
//! The group registry holds stores behind the object-safe [`AnyStore`] trait so
//! that structural operations can be replayed by component type id without
//! knowing the Rust type.

use std::any::Any;
use std::fmt;
use std::ops::{Index, Range};

use bytemuck::Pod;

use crate::component::{short_type_name, Component};
use crate::entity::{Egid, EntityId, GroupId};
use crate::index::{DenseMap, IndexNode};
use crate::operations::Caller;
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityIds
// ---------------------------------------------------------------------------

/// Read-only view of the entity ids of a store, parallel to its records.
#[derive(Clone, Copy)]
pub struct EntityIds<'w> {
    nodes: &'w [IndexNode<EntityId>],
}

impl<'w> EntityIds<'w> {
    pub(crate) fn new(nodes: &'w [IndexNode<EntityId>]) -> Self {
        Self { nodes }
    }

    pub(crate) fn empty() -> Self {
        Self { nodes: &[] }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<EntityId> {
        self.nodes.get(slot).map(|node| node.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = EntityId> + 'w {
        self.nodes.iter().map(|node| node.key)
    }
}

impl Index<usize> for EntityIds<'_> {
    type Output = EntityId;

    fn index(&self, slot: usize) -> &EntityId {
        &self.nodes[slot].key
    }
}

impl fmt::Debug for EntityIds<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentStore
// ---------------------------------------------------------------------------

/// Dense records of component `T` inside one group.
pub struct ComponentStore<T> {
    group: GroupId,
    map: DenseMap<EntityId, T>,
}

impl<T: Component> ComponentStore<T> {
    pub fn new(group: GroupId) -> Self {
        Self::with_capacity(group, 0)
    }

    pub fn with_capacity(group: GroupId, capacity: usize) -> Self {
        Self {
            group,
            map: DenseMap::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn group(&self) -> GroupId {
        self.group
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// Whether `egid` has a record here. Ids of other groups never match.
    #[inline]
    pub fn has(&self, egid: Egid) -> bool {
        egid.group_id == self.group && self.map.contains_key(egid.entity_id)
    }

    /// Current slot of `entity_id`.
    #[inline]
    pub fn index_of(&self, entity_id: EntityId) -> Option<u32> {
        self.map.try_find_index(entity_id)
    }

    pub fn get(&self, egid: Egid) -> Result<&T, EcsError> {
        if egid.group_id != self.group {
            return Err(self.not_found(egid));
        }
        self.map
            .get(egid.entity_id)
            .ok_or_else(|| self.not_found(egid))
    }

    pub fn get_mut(&mut self, egid: Egid) -> Result<&mut T, EcsError> {
        let missing = self.not_found(egid);
        if egid.group_id != self.group {
            return Err(missing);
        }
        self.map.get_mut(egid.entity_id).ok_or(missing)
    }

    /// Insert a record and return it for in-place initialisation.
    #[track_caller]
    pub fn add(&mut self, egid: Egid, mut value: T) -> Result<&mut T, EcsError> {
        debug_assert_eq!(egid.group_id, self.group, "record added to the wrong group");
        let caller = Caller::here();
        if T::NEEDS_EGID {
            value.set_egid(egid);
        }
        let slot = self
            .map
            .add(egid.entity_id, value)
            .map_err(|_| EcsError::DuplicateEntity { egid, caller })?;
        Ok(&mut self.map.values_mut()[slot as usize])
    }

    /// Remove a record, moving the last record into its slot.
    pub fn remove(&mut self, egid: Egid) -> Result<T, EcsError> {
        if egid.group_id != self.group {
            return Err(self.not_found(egid));
        }
        self.map
            .remove(egid.entity_id)
            .ok_or_else(|| self.not_found(egid))
    }

    /// Records in slot order.
    #[inline]
    pub fn values(&self) -> &[T] {
        self.map.values()
    }

    #[inline]
    pub fn values_mut(&mut self) -> &mut [T] {
        self.map.values_mut()
    }

    #[inline]
    pub fn entity_ids(&self) -> EntityIds<'_> {
        EntityIds::new(self.map.nodes())
    }

    /// Records (mutably) and their entity ids.
    pub fn split_mut(&mut self) -> (&mut [T], EntityIds<'_>) {
        let (nodes, values) = self.map.split_mut();
        (values, EntityIds::new(nodes))
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> + '_ {
        self.map.iter()
    }

    fn not_found(&self, egid: Egid) -> EcsError {
        EcsError::NotFound {
            egid,
            component: short_type_name::<T>(),
        }
    }

    fn take(&mut self, entity_id: EntityId) -> Result<T, MoveError> {
        self.map.remove(entity_id).ok_or(MoveError::Missing)
    }

    fn put(&mut self, entity_id: EntityId, mut value: T) -> Result<u32, MoveError> {
        if T::NEEDS_EGID {
            value.set_egid(Egid::new(entity_id, self.group));
        }
        self.map
            .add(entity_id, value)
            .map_err(|_| MoveError::Occupied)
    }
}

impl<T: Component + Pod> ComponentStore<T> {
    /// The live records as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        if std::mem::size_of::<T>() == 0 {
            return &[];
        }
        bytemuck::cast_slice(self.map.values())
    }

    /// Overwrite the live records with a verbatim byte copy.
    ///
    /// `bytes` must hold exactly `len()` records; the index is left untouched.
    pub fn serialise_from(&mut self, bytes: &[u8]) -> Result<(), EcsError> {
        let expected = self.len() * std::mem::size_of::<T>();
        if bytes.len() != expected {
            return Err(EcsError::BufferSizeMismatch {
                component: short_type_name::<T>(),
                expected,
                actual: bytes.len(),
            });
        }
        if expected == 0 {
            return Ok(());
        }
        let target: &mut [u8] = bytemuck::cast_slice_mut(self.map.values_mut());
        target.copy_from_slice(bytes);
        Ok(())
    }
}

impl<T> fmt::Debug for ComponentStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentStore")
            .field("component", &short_type_name::<T>())
            .field("group", &self.group)
            .field("len", &self.map.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AnyStore
// ---------------------------------------------------------------------------

/// Why a record could not be moved between stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveError {
    /// The source has no record for the entity.
    Missing,
    /// The destination already has a record for the target id.
    Occupied,
    /// The destination holds a different component type.
    WrongType,
}

/// Object-safe view of a [`ComponentStore`] used by the group registry and
/// the operation replay.
pub trait AnyStore: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn group(&self) -> GroupId;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_entity(&self, entity_id: EntityId) -> bool;

    fn entity_ids(&self) -> EntityIds<'_>;

    /// Insert a default record. Returns the occupied id on duplicates.
    fn add_default(&mut self, entity_id: EntityId) -> Result<u32, EntityId>;

    /// Drop the record of `entity_id`. `false` if there was none.
    fn remove_entity(&mut self, entity_id: EntityId) -> bool;

    /// Move one record into `dest` (same component type, another group) under
    /// `to`. Returns the destination slot.
    fn move_entity_to(
        &mut self,
        entity_id: EntityId,
        dest: &mut dyn AnyStore,
        to: EntityId,
    ) -> Result<u32, MoveError>;

    /// Re-key one record inside this store.
    fn move_within(&mut self, from: EntityId, to: EntityId) -> Result<u32, MoveError>;

    /// Move every record into `dest`, which must not hold any of their ids.
    ///
    /// On success returns the destination slots the records now occupy. On a
    /// clash nothing is moved and the clashing id is returned.
    fn drain_into(&mut self, dest: &mut dyn AnyStore) -> Result<Range<usize>, EntityId>;

    /// Move this store to another group, refreshing self-describing records.
    fn relabel(&mut self, group: GroupId);

    /// Drop every record, keeping allocations.
    fn clear(&mut self);

    /// Feed this store's group, count and index layout into `hasher`.
    fn hash_layout(&self, hasher: &mut blake3::Hasher);
}

impl<T: Component> AnyStore for ComponentStore<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn group(&self) -> GroupId {
        self.group
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn has_entity(&self, entity_id: EntityId) -> bool {
        self.map.contains_key(entity_id)
    }

    fn entity_ids(&self) -> EntityIds<'_> {
        ComponentStore::entity_ids(self)
    }

    fn add_default(&mut self, entity_id: EntityId) -> Result<u32, EntityId> {
        self.put(entity_id, T::default()).map_err(|_| entity_id)
    }

    fn remove_entity(&mut self, entity_id: EntityId) -> bool {
        self.map.remove(entity_id).is_some()
    }

    fn move_entity_to(
        &mut self,
        entity_id: EntityId,
        dest: &mut dyn AnyStore,
        to: EntityId,
    ) -> Result<u32, MoveError> {
        let dest = dest
            .as_any_mut()
            .downcast_mut::<ComponentStore<T>>()
            .ok_or(MoveError::WrongType)?;
        if !self.map.contains_key(entity_id) {
            return Err(MoveError::Missing);
        }
        if dest.map.contains_key(to) {
            return Err(MoveError::Occupied);
        }
        let value = self.take(entity_id)?;
        dest.put(to, value)
    }

    fn move_within(&mut self, from: EntityId, to: EntityId) -> Result<u32, MoveError> {
        if !self.map.contains_key(from) {
            return Err(MoveError::Missing);
        }
        if from == to {
            return self.map.try_find_index(from).ok_or(MoveError::Missing);
        }
        if self.map.contains_key(to) {
            return Err(MoveError::Occupied);
        }
        let value = self.take(from)?;
        self.put(to, value)
    }

    fn drain_into(&mut self, dest: &mut dyn AnyStore) -> Result<Range<usize>, EntityId> {
        let Some(dest) = dest.as_any_mut().downcast_mut::<ComponentStore<T>>() else {
            return Err(self.entity_ids().get(0).unwrap_or_default());
        };
        if let Some(clash) = self.map.keys().find(|id| dest.map.contains_key(*id)) {
            return Err(clash);
        }
        let start = dest.len();
        dest.map.reserve(self.map.len());
        for (entity_id, value) in self.map.drain() {
            // Ids were checked above and are unique within the source.
            let _ = dest.put(entity_id, value);
        }
        Ok(start..dest.len())
    }

    fn relabel(&mut self, group: GroupId) {
        self.group = group;
        if T::NEEDS_EGID {
            let (nodes, values) = self.map.split_mut();
            for (node, value) in nodes.iter().zip(values.iter_mut()) {
                value.set_egid(Egid::new(node.key, group));
            }
        }
    }

    fn clear(&mut self) {
        self.map.clear();
    }

    fn hash_layout(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&self.group.id().to_le_bytes());
        self.map.hash_layout(hasher);
    }
}
