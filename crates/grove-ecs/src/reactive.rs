//! Callbacks fired while a submission replays structural changes.
//!
//! A [`ReactiveEngine<T>`] is told about every record of `T` that is added,
//! removed, or moved to another group. Handlers run in the middle of replay, so
//! they cannot touch storage directly; they get the [`OperationBuffer`] that is
//! currently recording and anything they queue there is applied by the next
//! submission.

use std::marker::PhantomData;
use std::ops::Range;

use crate::component::{Component, ComponentTypeId};
use crate::entity::{Egid, EntityId, GroupId};
use crate::operations::OperationBuffer;
use crate::store::{AnyStore, ComponentStore};

/// Handler for structural events on component `T`. All methods default to
/// doing nothing.
pub trait ReactiveEngine<T: Component>: Send + Sync + 'static {
    /// A record was added to storage.
    fn added(&mut self, _component: &mut T, _egid: Egid, _ops: &mut OperationBuffer) {}

    /// A record is about to be dropped.
    fn removed(&mut self, _component: &T, _egid: Egid, _ops: &mut OperationBuffer) {}

    /// A record now lives under `to`.
    fn moved_to(&mut self, _component: &mut T, _from: Egid, _to: Egid, _ops: &mut OperationBuffer) {}
}

trait ErasedReactor: Send + Sync {
    fn added(&mut self, store: &mut dyn AnyStore, slots: Range<usize>, ops: &mut OperationBuffer);

    fn removed(&mut self, store: &mut dyn AnyStore, entity_id: EntityId, ops: &mut OperationBuffer);

    fn removed_all(&mut self, store: &mut dyn AnyStore, ops: &mut OperationBuffer);

    fn moved(
        &mut self,
        store: &mut dyn AnyStore,
        slot: usize,
        from: Egid,
        ops: &mut OperationBuffer,
    );
}

struct Typed<T, R> {
    engine: R,
    _component: PhantomData<fn() -> T>,
}

fn typed<T: Component>(store: &mut dyn AnyStore) -> Option<&mut ComponentStore<T>> {
    store.as_any_mut().downcast_mut::<ComponentStore<T>>()
}

impl<T: Component, R: ReactiveEngine<T>> ErasedReactor for Typed<T, R> {
    fn added(&mut self, store: &mut dyn AnyStore, slots: Range<usize>, ops: &mut OperationBuffer) {
        let Some(store) = typed::<T>(store) else {
            return;
        };
        let group = store.group();
        let (values, ids) = store.split_mut();
        for slot in slots {
            if let (Some(value), Some(id)) = (values.get_mut(slot), ids.get(slot)) {
                self.engine.added(value, Egid::new(id, group), ops);
            }
        }
    }

    fn removed(&mut self, store: &mut dyn AnyStore, entity_id: EntityId, ops: &mut OperationBuffer) {
        let Some(store) = typed::<T>(store) else {
            return;
        };
        let egid = Egid::new(entity_id, store.group());
        if let Ok(value) = store.get(egid) {
            self.engine.removed(value, egid, ops);
        }
    }

    fn removed_all(&mut self, store: &mut dyn AnyStore, ops: &mut OperationBuffer) {
        let Some(store) = typed::<T>(store) else {
            return;
        };
        let group = store.group();
        for (id, value) in store.iter() {
            self.engine.removed(value, Egid::new(id, group), ops);
        }
    }

    fn moved(
        &mut self,
        store: &mut dyn AnyStore,
        slot: usize,
        from: Egid,
        ops: &mut OperationBuffer,
    ) {
        let Some(store) = typed::<T>(store) else {
            return;
        };
        let group = store.group();
        let (values, ids) = store.split_mut();
        if let (Some(value), Some(id)) = (values.get_mut(slot), ids.get(slot)) {
            self.engine.moved_to(value, from, Egid::new(id, group), ops);
        }
    }
}

/// Registered handlers, indexed by component type id.
#[derive(Default)]
pub struct ReactorRegistry {
    by_type: Vec<Vec<Box<dyn ErasedReactor>>>,
}

impl ReactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<T: Component, R: ReactiveEngine<T>>(&mut self, type_id: ComponentTypeId, engine: R) {
        if self.by_type.len() <= type_id.index() {
            self.by_type.resize_with(type_id.index() + 1, Vec::new);
        }
        self.by_type[type_id.index()].push(Box::new(Typed {
            engine,
            _component: PhantomData,
        }));
    }

    /// Whether any handler listens to `type_id`.
    #[inline]
    pub fn has(&self, type_id: ComponentTypeId) -> bool {
        self.by_type
            .get(type_id.index())
            .is_some_and(|reactors| !reactors.is_empty())
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        self.by_type.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn added(
        &mut self,
        type_id: ComponentTypeId,
        store: &mut dyn AnyStore,
        slots: Range<usize>,
        ops: &mut OperationBuffer,
    ) {
        for reactor in self.reactors_mut(type_id) {
            reactor.added(store, slots.clone(), ops);
        }
    }

    pub(crate) fn removed(
        &mut self,
        type_id: ComponentTypeId,
        store: &mut dyn AnyStore,
        entity_id: EntityId,
        ops: &mut OperationBuffer,
    ) {
        for reactor in self.reactors_mut(type_id) {
            reactor.removed(store, entity_id, ops);
        }
    }

    pub(crate) fn removed_all(
        &mut self,
        type_id: ComponentTypeId,
        store: &mut dyn AnyStore,
        ops: &mut OperationBuffer,
    ) {
        for reactor in self.reactors_mut(type_id) {
            reactor.removed_all(store, ops);
        }
    }

    pub(crate) fn moved(
        &mut self,
        type_id: ComponentTypeId,
        store: &mut dyn AnyStore,
        slot: usize,
        from: Egid,
        ops: &mut OperationBuffer,
    ) {
        for reactor in self.reactors_mut(type_id) {
            reactor.moved(store, slot, from, ops);
        }
    }

    /// `moved` for a run of slots whose records kept their entity id but
    /// came from `from_group`.
    pub(crate) fn moved_range(
        &mut self,
        type_id: ComponentTypeId,
        store: &mut dyn AnyStore,
        slots: Range<usize>,
        from_group: GroupId,
        ops: &mut OperationBuffer,
    ) {
        if !self.has(type_id) {
            return;
        }
        for slot in slots {
            let Some(id) = store.entity_ids().get(slot) else {
                break;
            };
            self.moved(type_id, store, slot, Egid::new(id, from_group), ops);
        }
    }

    fn reactors_mut(
        &mut self,
        type_id: ComponentTypeId,
    ) -> impl Iterator<Item = &mut Box<dyn ErasedReactor>> + '_ {
        self.by_type
            .get_mut(type_id.index())
            .into_iter()
            .flat_map(|reactors| reactors.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentRegistry;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default, PartialEq)]
    struct Hp(u32);
    impl Component for Hp {}

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder(Log);

    impl ReactiveEngine<Hp> for Recorder {
        fn added(&mut self, component: &mut Hp, egid: Egid, _ops: &mut OperationBuffer) {
            component.0 += 1;
            self.0.lock().unwrap().push(format!("add {egid}"));
        }

        fn removed(&mut self, component: &Hp, egid: Egid, _ops: &mut OperationBuffer) {
            self.0.lock().unwrap().push(format!("remove {egid} {}", component.0));
        }

        fn moved_to(&mut self, _component: &mut Hp, from: Egid, to: Egid, _ops: &mut OperationBuffer) {
            self.0.lock().unwrap().push(format!("move {from} -> {to}"));
        }
    }

    #[test]
    fn dispatches_by_type() {
        let mut components = ComponentRegistry::new();
        let hp = components.register::<Hp>();
        let log: Log = Arc::default();

        let mut reactors = ReactorRegistry::new();
        assert!(!reactors.has(hp));
        reactors.add::<Hp, _>(hp, Recorder(log.clone()));
        assert!(reactors.has(hp));
        assert_eq!(reactors.len(), 1);

        let g = GroupId::new(2);
        let mut store = ComponentStore::<Hp>::new(g);
        store.add(Egid::new(0, g), Hp(10)).unwrap();
        store.add(Egid::new(1, g), Hp(20)).unwrap();

        let mut ops = OperationBuffer::default();
        reactors.added(hp, &mut store, 0..2, &mut ops);
        assert_eq!(store.values(), &[Hp(11), Hp(21)]);

        reactors.removed(hp, &mut store, 1, &mut ops);
        reactors.moved_range(hp, &mut store, 0..1, GroupId::new(9), &mut ops);
        reactors.removed_all(hp, &mut store, &mut ops);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "add 0@g2",
                "add 1@g2",
                "remove 1@g2 21",
                "move 0@g9 -> 0@g2",
                "remove 0@g2 11",
                "remove 1@g2 21",
            ]
        );
    }
}
