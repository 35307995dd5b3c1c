//! Queries over the dense buffers of one or more component types.
//!
//! A query names component types as `&T` (read) or `&mut T` (write), alone or
//! in tuples of up to four. Per group it yields a [`QueryBatch`]: one slice
//! per queried type plus the entity ids, all parallel by slot.
//!
//! - [`EntitiesDb::query_entities`] reads a single group. A group (or type)
//!   with no records gives a zero-count batch rather than an error.
//! - [`EntitiesDb::query_groups`] and [`EntitiesDb::query_all`] are restartable
//!   read-only views over an explicit group list or every group holding the
//!   types; each [`iter`](GroupsQuery::iter) re-reads current storage.
//! - [`EntitiesDb::query_groups_mut`] hands each listed group's mutable batch
//!   to a closure in list order. [`EntitiesDb::query_all_mut`] walks the
//!   registry once.
//!
//! Types queried together must have been built together: slices of one batch
//! are aligned by slot and that is not re-checked here.
//!
//! ```
//! use grove_ecs::prelude::*;
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Pos(f32);
//! impl Component for Pos {}
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Vel(f32);
//! impl Component for Vel {}
//!
//! let mut db = EntitiesDb::new();
//! let moving = db.descriptor().with::<Pos>().with::<Vel>().build().unwrap();
//! let group = db.allocate_group().unwrap();
//! for id in 0..3 {
//!     db.build_entity(Egid::new(id, group), &moving).unwrap().init(Vel(1.0)).unwrap();
//! }
//! db.submit_entities().unwrap();
//!
//! for batch in db.query_all_mut::<(&mut Pos, &Vel)>() {
//!     let (pos, vel) = batch.buffers;
//!     for (p, v) in pos.iter_mut().zip(vel) {
//!         p.0 += v.0;
//!     }
//! }
//!
//! let batch = db.query_entities::<&Pos>(group);
//! assert_eq!(batch.count(), 3);
//! assert!(batch.buffers.iter().all(|p| *p == Pos(1.0)));
//! ```

use std::marker::PhantomData;

use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::db::EntitiesDb;
use crate::entity::GroupId;
use crate::group::{BoxedStore, GroupStores, GroupsWith};
use crate::store::{AnyStore, ComponentStore, EntityIds};

// ---------------------------------------------------------------------------
// QueryItem -- one element of a query
// ---------------------------------------------------------------------------

/// `&T` or `&mut T`: how one component type is borrowed from a store.
pub trait QueryItem {
    /// The slice handed out per group.
    type Buffer<'w>;

    fn type_id(registry: &ComponentRegistry) -> Option<ComponentTypeId>;

    /// Borrow the records and entity ids of a store of this item's type.
    fn fetch<'w>(store: &'w mut BoxedStore) -> Option<(Self::Buffer<'w>, EntityIds<'w>)>;

    /// The zero-count buffer.
    fn empty<'w>() -> Self::Buffer<'w>;
}

/// A [`QueryItem`] that only reads.
pub trait ReadOnlyQueryItem: QueryItem {
    fn fetch_ref<'w>(store: &'w dyn AnyStore) -> Option<(Self::Buffer<'w>, EntityIds<'w>)>;
}

impl<T: Component> QueryItem for &T {
    type Buffer<'w> = &'w [T];

    fn type_id(registry: &ComponentRegistry) -> Option<ComponentTypeId> {
        registry.lookup::<T>()
    }

    fn fetch<'w>(store: &'w mut BoxedStore) -> Option<(&'w [T], EntityIds<'w>)> {
        <&T as ReadOnlyQueryItem>::fetch_ref(&**store)
    }

    fn empty<'w>() -> &'w [T] {
        &[]
    }
}

impl<T: Component> ReadOnlyQueryItem for &T {
    fn fetch_ref<'w>(store: &'w dyn AnyStore) -> Option<(&'w [T], EntityIds<'w>)> {
        let store = store.as_any().downcast_ref::<ComponentStore<T>>()?;
        Some((store.values(), store.entity_ids()))
    }
}

impl<T: Component> QueryItem for &mut T {
    type Buffer<'w> = &'w mut [T];

    fn type_id(registry: &ComponentRegistry) -> Option<ComponentTypeId> {
        registry.lookup::<T>()
    }

    fn fetch<'w>(store: &'w mut BoxedStore) -> Option<(&'w mut [T], EntityIds<'w>)> {
        let store = store.as_any_mut().downcast_mut::<ComponentStore<T>>()?;
        Some(store.split_mut())
    }

    fn empty<'w>() -> &'w mut [T] {
        <&mut [T]>::default()
    }
}

// ---------------------------------------------------------------------------
// Query -- a single item or a tuple of items
// ---------------------------------------------------------------------------

/// A full query: `&A`, `&mut A`, or a tuple `(A, B, ..)` of up to four items.
pub trait Query {
    /// One buffer per queried type.
    type Buffers<'w>;
    /// The resolved component type ids, in query order.
    type Ids: Copy + AsRef<[ComponentTypeId]>;

    /// `None` if any queried type was never registered.
    fn type_ids(registry: &ComponentRegistry) -> Option<Self::Ids>;

    /// Borrow every queried store of `group`. `None` if one is missing.
    fn fetch<'w>(group: &'w mut GroupStores, ids: Self::Ids) -> Option<(Self::Buffers<'w>, EntityIds<'w>)>;

    fn empty<'w>() -> Self::Buffers<'w>;
}

/// A [`Query`] made only of `&T` items, usable through `&EntitiesDb`.
pub trait ReadOnlyQuery: Query {
    fn fetch_ref<'w>(group: &'w GroupStores, ids: Self::Ids) -> Option<(Self::Buffers<'w>, EntityIds<'w>)>;
}

/// Panics if a component type appears twice in a mutably fetched query.
fn validate_no_aliasing(ids: &[ComponentTypeId]) {
    for (i, id) in ids.iter().enumerate() {
        if ids[..i].contains(id) {
            panic!("query borrows the same component type more than once");
        }
    }
}

impl<'a, T: Component> Query for &'a T {
    type Buffers<'w> = &'w [T];
    type Ids = [ComponentTypeId; 1];

    fn type_ids(registry: &ComponentRegistry) -> Option<Self::Ids> {
        Some([<&T as QueryItem>::type_id(registry)?])
    }

    fn fetch<'w>(group: &'w mut GroupStores, [id]: Self::Ids) -> Option<(&'w [T], EntityIds<'w>)> {
        <&T as QueryItem>::fetch(group.store_mut(id)?)
    }

    fn empty<'w>() -> &'w [T] {
        &[]
    }
}

impl<'a, T: Component> ReadOnlyQuery for &'a T {
    fn fetch_ref<'w>(group: &'w GroupStores, [id]: Self::Ids) -> Option<(&'w [T], EntityIds<'w>)> {
        <&T as ReadOnlyQueryItem>::fetch_ref(group.store(id)?)
    }
}

impl<'a, T: Component> Query for &'a mut T {
    type Buffers<'w> = &'w mut [T];
    type Ids = [ComponentTypeId; 1];

    fn type_ids(registry: &ComponentRegistry) -> Option<Self::Ids> {
        Some([<&mut T as QueryItem>::type_id(registry)?])
    }

    fn fetch<'w>(group: &'w mut GroupStores, [id]: Self::Ids) -> Option<(&'w mut [T], EntityIds<'w>)> {
        <&mut T as QueryItem>::fetch(group.store_mut(id)?)
    }

    fn empty<'w>() -> &'w mut [T] {
        <&mut [T]>::default()
    }
}

macro_rules! impl_query_tuple {
    ($n:literal; $first:ident $fv:ident $(, $name:ident $var:ident)*) => {
        impl<$first: QueryItem, $($name: QueryItem),*> Query for ($first, $($name,)*) {
            type Buffers<'w> = ($first::Buffer<'w>, $($name::Buffer<'w>,)*);
            type Ids = [ComponentTypeId; $n];

            fn type_ids(registry: &ComponentRegistry) -> Option<Self::Ids> {
                Some([$first::type_id(registry)?, $($name::type_id(registry)?,)*])
            }

            fn fetch<'w>(
                group: &'w mut GroupStores,
                ids: Self::Ids,
            ) -> Option<(Self::Buffers<'w>, EntityIds<'w>)> {
                let [$fv, $($var,)*] = group.many_mut(ids)?;
                let ($fv, entity_ids) = $first::fetch($fv)?;
                $(let ($var, _) = $name::fetch($var)?;)*
                Some((($fv, $($var,)*), entity_ids))
            }

            fn empty<'w>() -> Self::Buffers<'w> {
                ($first::empty(), $($name::empty(),)*)
            }
        }

        impl<$first: ReadOnlyQueryItem, $($name: ReadOnlyQueryItem),*> ReadOnlyQuery
            for ($first, $($name,)*)
        {
            fn fetch_ref<'w>(
                group: &'w GroupStores,
                ids: Self::Ids,
            ) -> Option<(Self::Buffers<'w>, EntityIds<'w>)> {
                let [$fv, $($var,)*] = ids;
                let ($fv, entity_ids) = $first::fetch_ref(group.store($fv)?)?;
                $(let ($var, _) = $name::fetch_ref(group.store($var)?)?;)*
                Some((($fv, $($var,)*), entity_ids))
            }
        }
    };
}

impl_query_tuple!(1; A a);
impl_query_tuple!(2; A a, B b);
impl_query_tuple!(3; A a, B b, C c);
impl_query_tuple!(4; A a, B b, C c, D d);

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The buffers of one group.
pub struct QueryBatch<'w, Q: Query> {
    pub buffers: Q::Buffers<'w>,
    pub entity_ids: EntityIds<'w>,
    pub group: GroupId,
}

impl<'w, Q: Query> QueryBatch<'w, Q> {
    /// Records per buffer.
    #[inline]
    pub fn count(&self) -> usize {
        self.entity_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }

    fn empty(group: GroupId) -> Self {
        Self {
            buffers: Q::empty(),
            entity_ids: EntityIds::empty(),
            group,
        }
    }

    fn from_fetch(group: GroupId, fetched: Option<(Q::Buffers<'w>, EntityIds<'w>)>) -> Self {
        match fetched {
            Some((buffers, entity_ids)) => Self {
                buffers,
                entity_ids,
                group,
            },
            None => Self::empty(group),
        }
    }
}

/// Restartable read-only query over a group list or every matching group.
///
/// Created by [`EntitiesDb::query_groups`] and [`EntitiesDb::query_all`].
pub struct GroupsQuery<'w, Q: ReadOnlyQuery> {
    db: &'w EntitiesDb,
    ids: Option<Q::Ids>,
    /// `None` means every group holding the first queried type.
    groups: Option<&'w [GroupId]>,
    _query: PhantomData<fn() -> Q>,
}

impl<'w, Q: ReadOnlyQuery> GroupsQuery<'w, Q> {
    /// Walk the matching groups as they are now. Empty groups are skipped.
    pub fn iter(&self) -> GroupsQueryIter<'w, Q> {
        let db = self.db;
        let source = match (self.groups, self.ids) {
            (Some(list), _) => GroupSource::List(list.iter()),
            (None, Some(ids)) => GroupSource::All(db.groups.groups_with(ids.as_ref()[0])),
            (None, None) => GroupSource::List(<&[GroupId]>::default().iter()),
        };
        GroupsQueryIter {
            db,
            ids: self.ids,
            source,
        }
    }

    /// Total records across the matching groups.
    pub fn count(&self) -> usize {
        self.iter().map(|batch| batch.count()).sum()
    }
}

impl<'q, 'w, Q: ReadOnlyQuery> IntoIterator for &'q GroupsQuery<'w, Q> {
    type Item = QueryBatch<'w, Q>;
    type IntoIter = GroupsQueryIter<'w, Q>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

enum GroupSource<'w> {
    List(std::slice::Iter<'w, GroupId>),
    All(GroupsWith<'w>),
}

/// Iterator returned by [`GroupsQuery::iter`].
pub struct GroupsQueryIter<'w, Q: ReadOnlyQuery> {
    db: &'w EntitiesDb,
    ids: Option<Q::Ids>,
    source: GroupSource<'w>,
}

impl<'w, Q: ReadOnlyQuery> Iterator for GroupsQueryIter<'w, Q> {
    type Item = QueryBatch<'w, Q>;

    fn next(&mut self) -> Option<Self::Item> {
        let ids = self.ids?;
        let db = self.db;
        loop {
            let group = match &mut self.source {
                GroupSource::List(list) => *list.next()?,
                GroupSource::All(with) => with.next()?.0,
            };
            let Some(stores) = db.groups.group(group) else {
                continue;
            };
            if let Some((buffers, entity_ids)) = Q::fetch_ref(stores, ids) {
                if !entity_ids.is_empty() {
                    return Some(QueryBatch {
                        buffers,
                        entity_ids,
                        group,
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EntitiesDb query methods
// ---------------------------------------------------------------------------

impl EntitiesDb {
    /// Read the buffers of `group`. Zero-count if the group or a type is absent.
    pub fn query_entities<Q: ReadOnlyQuery>(&self, group: GroupId) -> QueryBatch<'_, Q> {
        let fetched = Q::type_ids(&self.registry)
            .zip(self.groups.group(group))
            .and_then(|(ids, stores)| Q::fetch_ref(stores, ids));
        QueryBatch::from_fetch(group, fetched)
    }

    /// Write the buffers of `group` in place.
    ///
    /// # Panics
    ///
    /// Panics if the query names one component type twice.
    pub fn query_entities_mut<Q: Query>(&mut self, group: GroupId) -> QueryBatch<'_, Q> {
        let Some(ids) = Q::type_ids(&self.registry) else {
            return QueryBatch::empty(group);
        };
        validate_no_aliasing(ids.as_ref());
        let fetched = self
            .groups
            .group_mut(group)
            .and_then(|stores| Q::fetch(stores, ids));
        QueryBatch::from_fetch(group, fetched)
    }

    /// Restartable view over `groups`, visited in list order.
    pub fn query_groups<'w, Q: ReadOnlyQuery>(&'w self, groups: &'w [GroupId]) -> GroupsQuery<'w, Q> {
        GroupsQuery {
            db: self,
            ids: Q::type_ids(&self.registry),
            groups: Some(groups),
            _query: PhantomData,
        }
    }

    /// Restartable view over every group holding all queried types.
    pub fn query_all<Q: ReadOnlyQuery>(&self) -> GroupsQuery<'_, Q> {
        GroupsQuery {
            db: self,
            ids: Q::type_ids(&self.registry),
            groups: None,
            _query: PhantomData,
        }
    }

    /// Hand `visit` the mutable batch of each group in `groups`, in list order.
    ///
    /// Groups that are absent or hold no records are skipped. A group listed
    /// twice is visited twice.
    ///
    /// # Panics
    ///
    /// Panics if the query names one component type twice.
    pub fn query_groups_mut<Q: Query>(&mut self, groups: &[GroupId], mut visit: impl FnMut(QueryBatch<'_, Q>)) {
        let Some(ids) = Q::type_ids(&self.registry) else {
            return;
        };
        validate_no_aliasing(ids.as_ref());
        for &group in groups {
            let Some(stores) = self.groups.group_mut(group) else {
                continue;
            };
            if let Some((buffers, entity_ids)) = Q::fetch(stores, ids) {
                if !entity_ids.is_empty() {
                    visit(QueryBatch {
                        buffers,
                        entity_ids,
                        group,
                    });
                }
            }
        }
    }

    /// Mutable batches for every group holding all queried types, in registry
    /// order.
    ///
    /// # Panics
    ///
    /// Panics if the query names one component type twice.
    pub fn query_all_mut<'w, Q: Query + 'w>(&'w mut self) -> impl Iterator<Item = QueryBatch<'w, Q>> + 'w {
        let ids = Q::type_ids(&self.registry);
        if let Some(ids) = ids {
            validate_no_aliasing(ids.as_ref());
        }
        self.groups
            .groups_mut()
            .filter(move |_| ids.is_some())
            .filter_map(move |stores| {
                let group = stores.group();
                let (buffers, entity_ids) = Q::fetch(stores, ids?)?;
                (!entity_ids.is_empty()).then_some(QueryBatch {
                    buffers,
                    entity_ids,
                    group,
                })
            })
    }
}
