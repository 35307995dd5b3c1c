//! Group registry: which typed stores exist in which group.
//!
//! The registry exclusively owns every [`ComponentStore`]. Stores are created
//! lazily the first time a component type lands in a group and dropped only
//! when the whole group is removed. A per-type table answers "which groups hold
//! type T" without scanning all groups.

use std::ops::Range;

use crate::component::{Component, ComponentBuilder, ComponentTypeId};
use crate::entity::{EntityId, GroupId};
use crate::index::{DenseMap, IndexNode};
use crate::store::{AnyStore, ComponentStore};

/// A boxed, type-erased store.
pub type BoxedStore = Box<dyn AnyStore>;

// ---------------------------------------------------------------------------
// GroupStores
// ---------------------------------------------------------------------------

/// The typed stores of one group, keyed by component type id.
pub struct GroupStores {
    group: GroupId,
    stores: DenseMap<ComponentTypeId, BoxedStore>,
}

impl GroupStores {
    pub fn new(group: GroupId) -> Self {
        Self {
            group,
            stores: DenseMap::new(),
        }
    }

    #[inline]
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Number of component types stored in this group.
    pub fn type_count(&self) -> usize {
        self.stores.len()
    }

    pub fn component_types(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.stores.keys()
    }

    pub fn contains(&self, type_id: ComponentTypeId) -> bool {
        self.stores.contains_key(type_id)
    }

    pub fn store(&self, type_id: ComponentTypeId) -> Option<&dyn AnyStore> {
        self.stores.get(type_id).map(|store| &**store)
    }

    pub fn store_mut(&mut self, type_id: ComponentTypeId) -> Option<&mut BoxedStore> {
        self.stores.get_mut(type_id)
    }

    pub fn typed<T: Component>(&self, type_id: ComponentTypeId) -> Option<&ComponentStore<T>> {
        self.store(type_id)?.as_any().downcast_ref()
    }

    pub fn typed_mut<T: Component>(
        &mut self,
        type_id: ComponentTypeId,
    ) -> Option<&mut ComponentStore<T>> {
        self.stores.get_mut(type_id)?.as_any_mut().downcast_mut()
    }

    /// Several distinct stores at once; `None` if any is missing.
    pub fn many_mut<const N: usize>(
        &mut self,
        type_ids: [ComponentTypeId; N],
    ) -> Option<[&mut BoxedStore; N]> {
        self.stores.get_many_mut(type_ids)
    }

    /// Every store with its type id.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ComponentTypeId, &mut BoxedStore)> + '_ {
        self.stores.iter_mut()
    }

    fn hash_layout(&self, hasher: &mut blake3::Hasher) {
        for (type_id, store) in self.stores.iter() {
            hasher.update(&type_id.0.to_le_bytes());
            store.hash_layout(hasher);
        }
    }
}

// ---------------------------------------------------------------------------
// GroupRegistry
// ---------------------------------------------------------------------------

/// Group id to typed stores, plus the reverse "groups holding type" table.
#[derive(Default)]
pub struct GroupRegistry {
    groups: DenseMap<GroupId, GroupStores>,
    /// Indexed by `ComponentTypeId::index`.
    groups_with_type: Vec<DenseMap<GroupId, ()>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups that exist.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, group: GroupId) -> Option<&GroupStores> {
        self.groups.get(group)
    }

    pub fn group_mut(&mut self, group: GroupId) -> Option<&mut GroupStores> {
        self.groups.get_mut(group)
    }

    pub fn store(&self, group: GroupId, type_id: ComponentTypeId) -> Option<&dyn AnyStore> {
        self.groups.get(group)?.store(type_id)
    }

    pub fn store_mut(&mut self, group: GroupId, type_id: ComponentTypeId) -> Option<&mut BoxedStore> {
        self.groups.get_mut(group)?.store_mut(type_id)
    }

    /// The store of `builder`'s type in `group`, created empty if needed.
    pub fn get_or_create_store(
        &mut self,
        group: GroupId,
        builder: &ComponentBuilder,
        capacity: usize,
    ) -> &mut BoxedStore {
        let type_id = builder.type_id();
        let stores = self
            .groups
            .get_or_insert_with(group, || GroupStores::new(group));
        if !stores.contains(type_id) {
            track(&mut self.groups_with_type, type_id, group);
        }
        stores
            .stores
            .get_or_insert_with(type_id, || builder.new_store(group, capacity))
    }

    /// Source and destination stores of one type in two distinct groups.
    ///
    /// The destination store is created when the source exists. `None` when
    /// the source group has no store of this type or `from == to`.
    pub fn store_pair_mut(
        &mut self,
        from: GroupId,
        to: GroupId,
        builder: &ComponentBuilder,
        capacity: usize,
    ) -> Option<[&mut BoxedStore; 2]> {
        let type_id = builder.type_id();
        if from == to || self.store(from, type_id).is_none() {
            return None;
        }
        self.get_or_create_store(to, builder, capacity);
        let [source, dest] = self.groups.get_many_mut([from, to])?;
        Some([source.stores.get_mut(type_id)?, dest.stores.get_mut(type_id)?])
    }

    /// Drop a group and every store in it.
    pub fn remove_group(&mut self, group: GroupId) -> Option<GroupStores> {
        let stores = self.groups.remove(group)?;
        for type_id in stores.component_types() {
            untrack(&mut self.groups_with_type, type_id, group);
        }
        Some(stores)
    }

    /// Groups that have a store of `type_id`.
    ///
    /// Groups come in the order they got the store until one is dropped from
    /// the table. Removing a group moves the last tracked group into its place,
    /// so the order after removals is the table's and not insertion order.
    pub fn groups_with(&self, type_id: ComponentTypeId) -> GroupsWith<'_> {
        let nodes = self
            .groups_with_type
            .get(type_id.index())
            .map_or(&[][..], DenseMap::nodes);
        GroupsWith {
            registry: self,
            type_id,
            nodes: nodes.iter(),
        }
    }

    /// Move every store of `from` under `to`.
    ///
    /// A store whose type is absent or empty in `to` is re-keyed as a whole.
    /// Otherwise its records are moved one by one, which fails on the first
    /// entity id already present in `to`. Returns, per type, the slots in `to`
    /// that the moved records occupy.
    pub fn swap_group(
        &mut self,
        from: GroupId,
        to: GroupId,
    ) -> Result<Vec<(ComponentTypeId, Range<usize>)>, GroupMergeError> {
        if from == to {
            return Ok(Vec::new());
        }
        let Some(mut source) = self.groups.remove(from) else {
            return Err(GroupMergeError::MissingGroup);
        };
        let mut moved = Vec::with_capacity(source.type_count());
        let mut pending = source.stores.drain().collect::<Vec<_>>().into_iter();

        while let Some((type_id, mut store)) = pending.next() {
            untrack(&mut self.groups_with_type, type_id, from);
            track(&mut self.groups_with_type, type_id, to);
            let dest = self.groups.get_or_insert_with(to, || GroupStores::new(to));

            match dest.stores.get(type_id).map(|existing| existing.len()) {
                Some(len) if len > 0 => {
                    let result = match dest.stores.get_mut(type_id) {
                        Some(existing) => store.drain_into(&mut **existing),
                        None => Ok(0..0),
                    };
                    match result {
                        Ok(range) => moved.push((type_id, range)),
                        Err(entity_id) => {
                            // Whatever could not be merged stays in the source group.
                            track(&mut self.groups_with_type, type_id, from);
                            let mut remainder = GroupStores::new(from);
                            let _ = remainder.stores.add(type_id, store);
                            for (rest_type, rest) in pending {
                                let _ = remainder.stores.add(rest_type, rest);
                            }
                            let _ = self.groups.add(from, remainder);
                            return Err(GroupMergeError::Occupied { type_id, entity_id });
                        }
                    }
                }
                Some(_) => {
                    store.relabel(to);
                    moved.push((type_id, 0..store.len()));
                    if let Some(slot) = dest.stores.get_mut(type_id) {
                        *slot = store;
                    }
                }
                None => {
                    store.relabel(to);
                    moved.push((type_id, 0..store.len()));
                    let _ = dest.stores.add(type_id, store);
                }
            }
        }
        Ok(moved)
    }

    /// Feed every group's index layout into `hasher`, in registry order.
    pub fn hash_layout(&self, hasher: &mut blake3::Hasher) {
        for (group, stores) in self.groups.iter() {
            hasher.update(&group.id().to_le_bytes());
            stores.hash_layout(hasher);
        }
    }

    /// Every group, mutably, in registry order.
    pub(crate) fn groups_mut(&mut self) -> std::slice::IterMut<'_, GroupStores> {
        self.groups.values_mut().iter_mut()
    }
}

fn track(table: &mut Vec<DenseMap<GroupId, ()>>, type_id: ComponentTypeId, group: GroupId) {
    if table.len() <= type_id.index() {
        table.resize_with(type_id.index() + 1, DenseMap::new);
    }
    let _ = table[type_id.index()].add(group, ());
}

fn untrack(table: &mut [DenseMap<GroupId, ()>], type_id: ComponentTypeId, group: GroupId) {
    if let Some(groups) = table.get_mut(type_id.index()) {
        groups.remove(group);
    }
}

/// Why [`GroupRegistry::swap_group`] stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupMergeError {
    /// The source group does not exist.
    MissingGroup,
    /// The destination already holds `entity_id` for `type_id`.
    Occupied {
        type_id: ComponentTypeId,
        entity_id: EntityId,
    },
}

/// Iterator returned by [`GroupRegistry::groups_with`].
pub struct GroupsWith<'w> {
    registry: &'w GroupRegistry,
    type_id: ComponentTypeId,
    nodes: std::slice::Iter<'w, IndexNode<GroupId>>,
}

impl<'w> Iterator for GroupsWith<'w> {
    type Item = (GroupId, &'w dyn AnyStore);

    fn next(&mut self) -> Option<Self::Item> {
        for node in self.nodes.by_ref() {
            if let Some(store) = self.registry.store(node.key, self.type_id) {
                return Some((node.key, store));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentRegistry;
    use crate::entity::Egid;

    #[derive(Debug, Default, PartialEq)]
    struct Hp(u32);
    impl Component for Hp {}

    #[derive(Debug, Default, PartialEq)]
    struct Name(&'static str);
    impl Component for Name {}

    const G0: GroupId = GroupId::new(0);
    const G1: GroupId = GroupId::new(1);
    const G2: GroupId = GroupId::new(2);

    fn setup() -> (ComponentRegistry, GroupRegistry, ComponentTypeId, ComponentTypeId) {
        let mut components = ComponentRegistry::new();
        let hp = components.register::<Hp>();
        let name = components.register::<Name>();
        (components, GroupRegistry::new(), hp, name)
    }

    fn add_hp(groups: &mut GroupRegistry, components: &ComponentRegistry, egid: Egid, hp: u32) {
        let hp_id = components.lookup::<Hp>().unwrap();
        let builder = components.builder(hp_id).unwrap();
        let store = groups.get_or_create_store(egid.group_id, builder, 0);
        store
            .as_any_mut()
            .downcast_mut::<ComponentStore<Hp>>()
            .unwrap()
            .add(egid, Hp(hp))
            .unwrap();
    }

    #[test]
    fn stores_are_created_lazily_and_tracked() {
        let (components, mut groups, hp, name) = setup();
        assert!(groups.store(G0, hp).is_none());

        add_hp(&mut groups, &components, Egid::new(0, G0), 5);
        add_hp(&mut groups, &components, Egid::new(0, G2), 6);

        let with_hp: Vec<_> = groups.groups_with(hp).map(|(g, s)| (g, s.len())).collect();
        assert_eq!(with_hp, vec![(G0, 1), (G2, 1)]);
        assert_eq!(groups.groups_with(name).count(), 0);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn remove_group_drops_all_stores() {
        let (components, mut groups, hp, _) = setup();
        add_hp(&mut groups, &components, Egid::new(0, G0), 5);
        add_hp(&mut groups, &components, Egid::new(1, G0), 6);

        let removed = groups.remove_group(G0).unwrap();
        assert_eq!(removed.type_count(), 1);
        assert!(groups.group(G0).is_none());
        assert_eq!(groups.groups_with(hp).count(), 0);
        assert!(groups.remove_group(G0).is_none());
    }

    #[test]
    fn groups_with_after_removal() {
        let (components, mut groups, hp, _) = setup();
        for group in [G0, G1, G2] {
            add_hp(&mut groups, &components, Egid::new(0, group), 1);
        }
        let before: Vec<_> = groups.groups_with(hp).map(|(g, _)| g).collect();
        assert_eq!(before, vec![G0, G1, G2]);

        groups.remove_group(G0).unwrap();
        let mut after: Vec<_> = groups.groups_with(hp).map(|(g, _)| g).collect();
        let again: Vec<_> = groups.groups_with(hp).map(|(g, _)| g).collect();
        assert_eq!(after, again);
        after.sort();
        assert_eq!(after, vec![G1, G2]);
    }

    #[test]
    fn swap_group_rekeys_stores() {
        let (components, mut groups, hp, _) = setup();
        for i in 0..3 {
            add_hp(&mut groups, &components, Egid::new(i, G0), i);
        }
        let moved = groups.swap_group(G0, G1).unwrap();
        assert_eq!(moved, vec![(hp, 0..3)]);
        assert!(groups.group(G0).is_none());

        let store = groups.group(G1).unwrap().typed::<Hp>(hp).unwrap();
        assert_eq!(store.group(), G1);
        assert_eq!(store.get(Egid::new(2, G1)).unwrap(), &Hp(2));
        let with_hp: Vec<_> = groups.groups_with(hp).map(|(g, _)| g).collect();
        assert_eq!(with_hp, vec![G1]);
    }

    #[test]
    fn swap_group_merges_into_populated_group() {
        let (components, mut groups, hp, _) = setup();
        add_hp(&mut groups, &components, Egid::new(0, G0), 1);
        add_hp(&mut groups, &components, Egid::new(5, G1), 2);

        let moved = groups.swap_group(G0, G1).unwrap();
        assert_eq!(moved, vec![(hp, 1..2)]);
        let store = groups.group(G1).unwrap().typed::<Hp>(hp).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn swap_group_clash_keeps_source() {
        let (components, mut groups, hp, _) = setup();
        add_hp(&mut groups, &components, Egid::new(0, G0), 1);
        add_hp(&mut groups, &components, Egid::new(0, G1), 2);

        let err = groups.swap_group(G0, G1).unwrap_err();
        assert_eq!(err, GroupMergeError::Occupied { type_id: hp, entity_id: 0 });
        let source = groups.group(G0).unwrap().typed::<Hp>(hp).unwrap();
        assert_eq!(source.get(Egid::new(0, G0)).unwrap(), &Hp(1));
        assert_eq!(groups.groups_with(hp).count(), 2);
    }

    #[test]
    fn swap_missing_group() {
        let (_, mut groups, _, _) = setup();
        assert_eq!(groups.swap_group(G0, G1), Err(GroupMergeError::MissingGroup));
        assert_eq!(groups.swap_group(G0, G0), Ok(Vec::new()));
    }

    #[test]
    fn store_pair_requires_source() {
        let (components, mut groups, hp, _) = setup();
        let builder = *components.builder(hp).unwrap();
        assert!(groups.store_pair_mut(G0, G1, &builder, 0).is_none());
        assert!(groups.group(G1).is_none());

        add_hp(&mut groups, &components, Egid::new(0, G0), 1);
        let [source, dest] = groups.store_pair_mut(G0, G1, &builder, 0).unwrap();
        source.move_entity_to(0, &mut **dest, 3).unwrap();
        assert!(groups.store(G1, hp).unwrap().has_entity(3));
    }
}
