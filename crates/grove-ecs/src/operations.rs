//! Double-buffered log of deferred structural operations.
//!
//! Producers never mutate storage directly. Building, removing, and swapping
//! entities, and removing or swapping whole groups, are recorded into the
//! current [`OperationBuffer`]. A submission swaps the two buffers and replays
//! the one that was recording, in a fixed order:
//!
//! 1. entity swaps
//! 2. entity removals
//! 3. group removals
//! 4. group swaps
//! 5. staged entity builds
//!
//! Reactive handlers that run during replay receive the other buffer, so
//! whatever they queue waits for the next submission.
//!
//! The per-group, per-type batches of both buffers are recycled across
//! submissions rather than reallocated.
//!
//! # Example
//!
//! ```
//! use grove_ecs::prelude::*;
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Health(u32);
//! impl Component for Health {}
//!
//! let mut db = EntitiesDb::new();
//! let soldier = db.descriptor().with::<Health>().build().unwrap();
//! let group = db.allocate_group().unwrap();
//! let egid = Egid::new(0, group);
//!
//! db.build_entity(egid, &soldier).unwrap().init(Health(100)).unwrap();
//! assert!(!db.exists::<Health>(egid));
//!
//! let report = db.submit_entities().unwrap();
//! assert_eq!(report.entities_added, 1);
//! assert_eq!(db.get::<Health>(egid).unwrap(), &Health(100));
//! ```

use std::fmt;
use std::panic::Location;

use tracing::{debug, error, warn};

use crate::component::{short_type_name, Component, ComponentRegistry, ComponentTypeId, EntityDescriptor};
use crate::db::MissingEntityPolicy;
use crate::entity::{Egid, EntityId, GroupId};
use crate::group::{BoxedStore, GroupMergeError, GroupRegistry};
use crate::index::DenseMap;
use crate::reactive::ReactorRegistry;
use crate::store::{ComponentStore, MoveError};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Caller
// ---------------------------------------------------------------------------

/// Source location that queued an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller(&'static Location<'static>);

impl Caller {
    /// The location of the (`#[track_caller]`) call that got here.
    #[track_caller]
    #[inline]
    pub fn here() -> Self {
        Self(Location::caller())
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.0
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0.file(), self.0.line())
    }
}

// ---------------------------------------------------------------------------
// SubmissionReport
// ---------------------------------------------------------------------------

/// What a submission applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionReport {
    pub entities_added: usize,
    pub entities_removed: usize,
    pub entities_swapped: usize,
    pub groups_removed: usize,
    pub groups_swapped: usize,
    /// Records a removal or swap expected but did not find.
    pub missing: usize,
    /// Entities targeted by more than one removal/swap in the cycle.
    pub conflict_count: usize,
}

impl SubmissionReport {
    /// Add another report's counts to this one.
    pub fn merge(&mut self, other: &SubmissionReport) {
        self.entities_added += other.entities_added;
        self.entities_removed += other.entities_removed;
        self.entities_swapped += other.entities_swapped;
        self.groups_removed += other.groups_removed;
        self.groups_swapped += other.groups_swapped;
        self.missing += other.missing;
        self.conflict_count += other.conflict_count;
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Where the operation log is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    /// Nothing queued.
    Idle,
    /// Operations are queued for the next submission.
    Recording,
    /// A submission is replaying.
    Submitting,
}

// ---------------------------------------------------------------------------
// OperationBuffer
// ---------------------------------------------------------------------------

type RemoveBatch = Vec<(EntityId, Caller)>;
type SwapBatch = Vec<(EntityId, EntityId, Caller)>;

/// One side of the double buffer: everything queued during one cycle.
#[derive(Default)]
pub struct OperationBuffer {
    /// from group -> component type -> to group -> (from id, to id)
    swaps: DenseMap<GroupId, DenseMap<ComponentTypeId, DenseMap<GroupId, SwapBatch>>>,
    /// group -> component type -> ids
    removals: DenseMap<GroupId, DenseMap<ComponentTypeId, RemoveBatch>>,
    entities_swapped: Vec<(Egid, Egid)>,
    entities_removed: Vec<Egid>,
    groups_to_remove: Vec<(GroupId, Caller)>,
    groups_to_swap: Vec<(GroupId, GroupId, Caller)>,
    /// group -> component type -> records built this cycle
    staged: DenseMap<GroupId, DenseMap<ComponentTypeId, BoxedStore>>,
    built: DenseMap<Egid, Caller>,
    touched: DenseMap<Egid, Caller>,
    conflicts: usize,
    /// Set while the other buffer is being replayed.
    replaying: bool,
}

impl OperationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a new entity with default components and return an
    /// [`Initializer`] to set their values.
    ///
    /// Fails with [`EcsError::DuplicateEntity`] when `egid` was already built
    /// in this cycle.
    #[track_caller]
    pub fn build_entity<'a>(
        &'a mut self,
        egid: Egid,
        descriptor: &'a EntityDescriptor,
    ) -> Result<Initializer<'a>, EcsError> {
        let caller = Caller::here();
        if self.built.add(egid, caller).is_err() {
            return Err(EcsError::DuplicateEntity { egid, caller });
        }
        let group = egid.group_id;
        let stores = self.staged.get_or_insert_with(group, DenseMap::new);
        for builder in descriptor.builders() {
            let store = stores.get_or_insert_with(builder.type_id(), || builder.new_store(group, 0));
            if store.add_default(egid.entity_id).is_err() {
                return Err(EcsError::DuplicateEntity { egid, caller });
            }
        }
        Ok(Initializer {
            egid,
            descriptor,
            stores,
        })
    }

    /// Queue removal of every component `descriptor` declares.
    #[track_caller]
    pub fn remove_entity(&mut self, egid: Egid, descriptor: &EntityDescriptor) {
        let caller = Caller::here();
        self.note_touch(egid, caller);
        self.entities_removed.push(egid);
        let per_type = self
            .removals
            .recycle_or_create(egid.group_id, DenseMap::new, DenseMap::fast_clear);
        for type_id in descriptor.component_types() {
            per_type
                .recycle_or_create(type_id, Vec::new, Vec::clear)
                .push((egid.entity_id, caller));
        }
    }

    /// Queue a move of `from` to `to_group`, keeping its entity id.
    #[track_caller]
    pub fn swap_entity_group(&mut self, from: Egid, to_group: GroupId, descriptor: &EntityDescriptor) {
        self.swap_entity(from, from.with_group(to_group), descriptor);
    }

    /// Queue a move of `from` to `to`, which may also change the entity id.
    #[track_caller]
    pub fn swap_entity(&mut self, from: Egid, to: Egid, descriptor: &EntityDescriptor) {
        let caller = Caller::here();
        self.note_touch(from, caller);
        self.entities_swapped.push((from, to));
        let per_type = self
            .swaps
            .recycle_or_create(from.group_id, DenseMap::new, DenseMap::fast_clear);
        for type_id in descriptor.component_types() {
            per_type
                .recycle_or_create(type_id, DenseMap::new, DenseMap::fast_clear)
                .recycle_or_create(to.group_id, Vec::new, Vec::clear)
                .push((from.entity_id, to.entity_id, caller));
        }
    }

    /// Queue removal of a whole group.
    #[track_caller]
    pub fn remove_entities_from_group(&mut self, group: GroupId) {
        self.groups_to_remove.push((group, Caller::here()));
    }

    /// Queue moving every entity of `from` into `to`.
    #[track_caller]
    pub fn swap_group(&mut self, from: GroupId, to: GroupId) {
        self.groups_to_swap.push((from, to, Caller::here()));
    }

    /// Whether anything is waiting for a submission.
    pub fn any_operation_queued(&self) -> bool {
        !self.entities_swapped.is_empty()
            || !self.entities_removed.is_empty()
            || !self.groups_to_remove.is_empty()
            || !self.groups_to_swap.is_empty()
            || !self.built.is_empty()
    }

    /// [`SubmissionState::Submitting`] while the other buffer is being
    /// replayed, which is what reactive handlers observe.
    pub fn submission_state(&self) -> SubmissionState {
        if self.replaying {
            SubmissionState::Submitting
        } else if self.any_operation_queued() {
            SubmissionState::Recording
        } else {
            SubmissionState::Idle
        }
    }

    /// Entity swaps queued so far, in call order.
    pub fn queued_swaps(&self) -> &[(Egid, Egid)] {
        &self.entities_swapped
    }

    /// Entity removals queued so far, in call order.
    pub fn queued_removals(&self) -> &[Egid] {
        &self.entities_removed
    }

    /// Number of entities staged for building.
    pub fn queued_builds(&self) -> usize {
        self.built.len()
    }

    /// Forget everything queued. Batches and staged stores are kept for reuse.
    pub fn clear(&mut self) {
        self.swaps.fast_clear();
        self.removals.fast_clear();
        self.entities_swapped.clear();
        self.entities_removed.clear();
        self.groups_to_remove.clear();
        self.groups_to_swap.clear();
        for stores in self.staged.values_mut() {
            for store in stores.values_mut() {
                store.clear();
            }
        }
        self.built.fast_clear();
        self.touched.fast_clear();
        self.conflicts = 0;
    }

    fn note_touch(&mut self, egid: Egid, caller: Caller) {
        if self.touched.add(egid, caller).is_err() {
            self.conflicts += 1;
            if let Some(first) = self.touched.get(egid) {
                warn!(
                    egid = %egid,
                    first = %first,
                    second = %caller,
                    "entity queued for more than one structural operation"
                );
            }
        }
    }
}

impl fmt::Debug for OperationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationBuffer")
            .field("swaps", &self.entities_swapped.len())
            .field("removals", &self.entities_removed.len())
            .field("group_removals", &self.groups_to_remove.len())
            .field("group_swaps", &self.groups_to_swap.len())
            .field("builds", &self.built.len())
            .field("replaying", &self.replaying)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Initializer
// ---------------------------------------------------------------------------

/// Sets the initial component values of a staged entity.
pub struct Initializer<'a> {
    egid: Egid,
    descriptor: &'a EntityDescriptor,
    stores: &'a mut DenseMap<ComponentTypeId, BoxedStore>,
}

impl Initializer<'_> {
    pub fn egid(&self) -> Egid {
        self.egid
    }

    /// Replace the staged value of `T`.
    pub fn init<T: Component>(&mut self, value: T) -> Result<&mut Self, EcsError> {
        *self.get_mut::<T>()? = value;
        if T::NEEDS_EGID {
            let egid = self.egid;
            self.get_mut::<T>()?.set_egid(egid);
        }
        Ok(self)
    }

    /// The staged value of `T`, for in-place initialisation.
    pub fn get_mut<T: Component>(&mut self) -> Result<&mut T, EcsError> {
        let undeclared = || EcsError::TypeMismatch {
            component: short_type_name::<T>(),
            reason: "not declared by the entity descriptor".to_owned(),
        };
        let builder = self.descriptor.builder_of::<T>().ok_or_else(undeclared)?;
        let store = self
            .stores
            .get_mut(builder.type_id())
            .and_then(|store| store.as_any_mut().downcast_mut::<ComponentStore<T>>())
            .ok_or_else(undeclared)?;
        store.get_mut(self.egid)
    }
}

// ---------------------------------------------------------------------------
// EntitiesOperations
// ---------------------------------------------------------------------------

/// The two operation buffers and the replay that drains them.
#[derive(Debug, Default)]
pub struct EntitiesOperations {
    this_submission: OperationBuffer,
    last_submitted: OperationBuffer,
}

/// Storage and settings a replay works against.
pub(crate) struct ReplayContext<'a> {
    pub groups: &'a mut GroupRegistry,
    pub registry: &'a ComponentRegistry,
    pub reactors: &'a mut ReactorRegistry,
    pub policy: MissingEntityPolicy,
    pub store_capacity: usize,
}

impl EntitiesOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffer operations are currently recorded into.
    #[inline]
    pub fn current(&mut self) -> &mut OperationBuffer {
        &mut self.this_submission
    }

    pub fn any_operation_queued(&self) -> bool {
        self.this_submission.any_operation_queued()
    }

    pub fn state(&self) -> SubmissionState {
        self.this_submission.submission_state()
    }

    /// Flip the buffers and replay what was recorded.
    ///
    /// The drained buffer is cleared whether or not replay succeeds. On error
    /// the operations replayed before the failure stay applied and the rest of
    /// the cycle is dropped.
    pub(crate) fn submit(&mut self, mut ctx: ReplayContext<'_>) -> Result<SubmissionReport, EcsError> {
        std::mem::swap(&mut self.this_submission, &mut self.last_submitted);
        self.this_submission.replaying = true;
        let result = replay(&mut self.last_submitted, &mut self.this_submission, &mut ctx);
        self.this_submission.replaying = false;
        self.last_submitted.clear();

        if let Ok(report) = &result {
            if !report.is_empty() {
                debug!(
                    added = report.entities_added,
                    removed = report.entities_removed,
                    swapped = report.entities_swapped,
                    groups_removed = report.groups_removed,
                    groups_swapped = report.groups_swapped,
                    missing = report.missing,
                    conflicts = report.conflict_count,
                    "entities submitted"
                );
            }
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

fn replay(
    batch: &mut OperationBuffer,
    next: &mut OperationBuffer,
    ctx: &mut ReplayContext<'_>,
) -> Result<SubmissionReport, EcsError> {
    let mut report = SubmissionReport {
        conflict_count: batch.conflicts,
        ..SubmissionReport::default()
    };
    replay_swaps(batch, next, ctx, &mut report)?;
    replay_removals(batch, next, ctx, &mut report)?;
    replay_group_removals(batch, next, ctx, &mut report)?;
    replay_group_swaps(batch, next, ctx, &mut report)?;
    replay_builds(batch, next, ctx, &mut report)?;
    Ok(report)
}

/// Apply the configured policy to a record that should have been there.
fn missing(
    policy: MissingEntityPolicy,
    egid: Egid,
    component: &'static str,
    caller: Caller,
    report: &mut SubmissionReport,
) -> Result<(), EcsError> {
    report.missing += 1;
    match policy {
        MissingEntityPolicy::Ignore => Ok(()),
        MissingEntityPolicy::Warn => {
            warn!(
                egid = %egid,
                component,
                caller = %caller,
                "queued operation targets a missing entity, skipped"
            );
            Ok(())
        }
        MissingEntityPolicy::Error => Err(EcsError::NotFound { egid, component }),
    }
}

fn replay_swaps(
    batch: &OperationBuffer,
    next: &mut OperationBuffer,
    ctx: &mut ReplayContext<'_>,
    report: &mut SubmissionReport,
) -> Result<(), EcsError> {
    for (from_group, per_type) in batch.swaps.iter() {
        for (type_id, per_dest) in per_type.iter() {
            let Some(builder) = ctx.registry.builder(type_id).copied() else {
                continue;
            };
            let component = builder.name();
            for (to_group, entries) in per_dest.iter() {
                if from_group == to_group {
                    let Some(store) = ctx.groups.store_mut(from_group, type_id) else {
                        for &(from_id, _, caller) in entries {
                            missing(ctx.policy, Egid::new(from_id, from_group), component, caller, report)?;
                        }
                        continue;
                    };
                    for &(from_id, to_id, caller) in entries {
                        let from = Egid::new(from_id, from_group);
                        match store.move_within(from_id, to_id) {
                            Ok(slot) => {
                                ctx.reactors.moved(type_id, &mut **store, slot as usize, from, next)
                            }
                            Err(MoveError::Missing) => {
                                missing(ctx.policy, from, component, caller, report)?
                            }
                            Err(_) => {
                                return Err(EcsError::DuplicateEntity {
                                    egid: Egid::new(to_id, to_group),
                                    caller,
                                })
                            }
                        }
                    }
                    continue;
                }

                let Some([source, dest]) =
                    ctx.groups
                        .store_pair_mut(from_group, to_group, &builder, ctx.store_capacity)
                else {
                    for &(from_id, _, caller) in entries {
                        missing(ctx.policy, Egid::new(from_id, from_group), component, caller, report)?;
                    }
                    continue;
                };
                for &(from_id, to_id, caller) in entries {
                    let from = Egid::new(from_id, from_group);
                    match source.move_entity_to(from_id, &mut **dest, to_id) {
                        Ok(slot) => ctx.reactors.moved(type_id, &mut **dest, slot as usize, from, next),
                        Err(MoveError::Missing) => missing(ctx.policy, from, component, caller, report)?,
                        Err(MoveError::Occupied) => {
                            return Err(EcsError::DuplicateEntity {
                                egid: Egid::new(to_id, to_group),
                                caller,
                            })
                        }
                        Err(MoveError::WrongType) => {
                            return Err(EcsError::TypeMismatch {
                                component,
                                reason: format!("store of {to_group} holds another type"),
                            })
                        }
                    }
                }
            }
        }
    }
    report.entities_swapped = batch.entities_swapped.len();
    Ok(())
}

fn replay_removals(
    batch: &OperationBuffer,
    next: &mut OperationBuffer,
    ctx: &mut ReplayContext<'_>,
    report: &mut SubmissionReport,
) -> Result<(), EcsError> {
    for (group, per_type) in batch.removals.iter() {
        for (type_id, entries) in per_type.iter() {
            let component = ctx.registry.name(type_id);
            let Some(store) = ctx.groups.store_mut(group, type_id) else {
                for &(entity_id, caller) in entries {
                    missing(ctx.policy, Egid::new(entity_id, group), component, caller, report)?;
                }
                continue;
            };
            for &(entity_id, caller) in entries {
                if !store.has_entity(entity_id) {
                    missing(ctx.policy, Egid::new(entity_id, group), component, caller, report)?;
                    continue;
                }
                ctx.reactors.removed(type_id, &mut **store, entity_id, next);
                store.remove_entity(entity_id);
            }
        }
    }
    report.entities_removed = batch.entities_removed.len();
    Ok(())
}

fn replay_group_removals(
    batch: &OperationBuffer,
    next: &mut OperationBuffer,
    ctx: &mut ReplayContext<'_>,
    report: &mut SubmissionReport,
) -> Result<(), EcsError> {
    for &(group, caller) in &batch.groups_to_remove {
        match remove_group_now(group, next, ctx) {
            Ok(true) => report.groups_removed += 1,
            Ok(false) => {}
            Err(source) => {
                error!(
                    group = %group,
                    caller = %caller,
                    error = %source,
                    "crash while removing a whole group"
                );
                return Err(EcsError::GroupOperationFailure {
                    group,
                    to_group: None,
                    caller,
                    source: Box::new(source),
                });
            }
        }
    }
    Ok(())
}

fn remove_group_now(
    group: GroupId,
    next: &mut OperationBuffer,
    ctx: &mut ReplayContext<'_>,
) -> Result<bool, EcsError> {
    let Some(mut stores) = ctx.groups.remove_group(group) else {
        return match ctx.policy {
            MissingEntityPolicy::Error => Err(EcsError::GroupNotFound { group }),
            MissingEntityPolicy::Warn => {
                warn!(group = %group, "removal of a group that does not exist, skipped");
                Ok(false)
            }
            MissingEntityPolicy::Ignore => Ok(false),
        };
    };
    for (type_id, store) in stores.iter_mut() {
        ctx.reactors.removed_all(type_id, &mut **store, next);
    }
    Ok(true)
}

fn replay_group_swaps(
    batch: &OperationBuffer,
    next: &mut OperationBuffer,
    ctx: &mut ReplayContext<'_>,
    report: &mut SubmissionReport,
) -> Result<(), EcsError> {
    for &(from, to, caller) in &batch.groups_to_swap {
        match swap_group_now(from, to, caller, next, ctx) {
            Ok(true) => report.groups_swapped += 1,
            Ok(false) => {}
            Err(source) => {
                error!(
                    group = %from,
                    to_group = %to,
                    caller = %caller,
                    error = %source,
                    "crash while swapping a whole group"
                );
                return Err(EcsError::GroupOperationFailure {
                    group: from,
                    to_group: Some(to),
                    caller,
                    source: Box::new(source),
                });
            }
        }
    }
    Ok(())
}

fn swap_group_now(
    from: GroupId,
    to: GroupId,
    caller: Caller,
    next: &mut OperationBuffer,
    ctx: &mut ReplayContext<'_>,
) -> Result<bool, EcsError> {
    let moved = match ctx.groups.swap_group(from, to) {
        Ok(moved) => moved,
        Err(GroupMergeError::MissingGroup) => {
            return match ctx.policy {
                MissingEntityPolicy::Error => Err(EcsError::GroupNotFound { group: from }),
                MissingEntityPolicy::Warn => {
                    warn!(group = %from, to_group = %to, "swap of a group that does not exist, skipped");
                    Ok(false)
                }
                MissingEntityPolicy::Ignore => Ok(false),
            };
        }
        Err(GroupMergeError::Occupied { type_id, entity_id }) => {
            debug!(component = ctx.registry.name(type_id), "group merge clashed");
            return Err(EcsError::DuplicateEntity {
                egid: Egid::new(entity_id, to),
                caller,
            });
        }
    };
    for (type_id, slots) in moved {
        if let Some(store) = ctx.groups.store_mut(to, type_id) {
            ctx.reactors.moved_range(type_id, &mut **store, slots, from, next);
        }
    }
    Ok(true)
}

fn replay_builds(
    batch: &mut OperationBuffer,
    next: &mut OperationBuffer,
    ctx: &mut ReplayContext<'_>,
    report: &mut SubmissionReport,
) -> Result<(), EcsError> {
    let built = &batch.built;
    for (group, per_type) in batch.staged.iter_mut() {
        for (type_id, pending) in per_type.iter_mut() {
            if pending.is_empty() {
                continue;
            }
            let Some(builder) = ctx.registry.builder(type_id) else {
                continue;
            };
            let dest = ctx.groups.get_or_create_store(group, builder, ctx.store_capacity);
            match pending.drain_into(&mut **dest) {
                Ok(slots) => ctx.reactors.added(type_id, &mut **dest, slots, next),
                Err(entity_id) => {
                    let egid = Egid::new(entity_id, group);
                    let caller = match built.get(egid) {
                        Some(&caller) => caller,
                        None => Caller::here(),
                    };
                    return Err(EcsError::DuplicateEntity { egid, caller });
                }
            }
        }
    }
    report.entities_added = built.len();
    Ok(())
}
