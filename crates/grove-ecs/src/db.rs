//! `EntitiesDb`: the component database and its public entry points.
//!
//! The database owns the component registry, every group's stores, the
//! double-buffered operation log and the registered reactive engines. Reads and
//! in-place writes go straight to storage; structural changes are queued and
//! applied by [`EntitiesDb::submit_entities`].

use std::fmt;

use crate::component::{Component, ComponentRegistry, ComponentTypeId, DescriptorBuilder, EntityDescriptor};
use crate::entity::{Egid, EntityId, GroupAllocator, GroupId, GroupRange};
use crate::group::GroupRegistry;
use crate::operations::{
    EntitiesOperations, Initializer, OperationBuffer, ReplayContext, SubmissionReport, SubmissionState,
};
use crate::reactive::{ReactiveEngine, ReactorRegistry};
use crate::store::ComponentStore;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What replay does with a removal or swap whose record is not there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingEntityPolicy {
    /// Skip silently.
    Ignore,
    /// Skip and log a warning.
    #[default]
    Warn,
    /// Abort the submission with [`EcsError::NotFound`] (or
    /// [`EcsError::GroupNotFound`] for group operations).
    Error,
}

/// Database settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub missing_entity_policy: MissingEntityPolicy,
    /// Capacity new stores are created with.
    pub initial_store_capacity: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            missing_entity_policy: MissingEntityPolicy::Warn,
            initial_store_capacity: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// EntitiesDb
// ---------------------------------------------------------------------------

/// Grouped component storage with deferred structural changes.
pub struct EntitiesDb {
    config: DbConfig,
    pub(crate) registry: ComponentRegistry,
    pub(crate) groups: GroupRegistry,
    operations: EntitiesOperations,
    reactors: ReactorRegistry,
    group_allocator: GroupAllocator,
    last_report: SubmissionReport,
}

impl fmt::Debug for EntitiesDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitiesDb")
            .field("config", &self.config)
            .field("components", &self.registry.len())
            .field("groups", &self.groups.len())
            .field("reactors", &self.reactors.len())
            .field("operations", &self.operations)
            .finish()
    }
}

impl Default for EntitiesDb {
    fn default() -> Self {
        Self::new()
    }
}

impl EntitiesDb {
    pub fn new() -> Self {
        Self::with_config(DbConfig::default())
    }

    pub fn with_config(config: DbConfig) -> Self {
        Self {
            config,
            registry: ComponentRegistry::new(),
            groups: GroupRegistry::new(),
            operations: EntitiesOperations::new(),
            reactors: ReactorRegistry::new(),
            group_allocator: GroupAllocator::new(),
            last_report: SubmissionReport::default(),
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    // -- registration -------------------------------------------------------

    /// Register component type `T`, returning its id. Idempotent.
    pub fn register_component<T: Component>(&mut self) -> ComponentTypeId {
        self.registry.register::<T>()
    }

    /// Start declaring an entity descriptor. Listed types are registered.
    pub fn descriptor(&mut self) -> DescriptorBuilder<'_> {
        self.registry.descriptor()
    }

    /// A fresh group id, never handed out before by this database.
    pub fn allocate_group(&mut self) -> Result<GroupId, EcsError> {
        self.group_allocator.allocate()
    }

    /// `len` contiguous fresh group ids.
    pub fn allocate_groups(&mut self, len: u32) -> Result<GroupRange, EcsError> {
        self.group_allocator.allocate_range(len)
    }

    /// Register a handler for added/removed/moved records of `T`.
    pub fn add_reactive_engine<T: Component, R: ReactiveEngine<T>>(&mut self, engine: R) {
        let type_id = self.registry.register::<T>();
        self.reactors.add::<T, R>(type_id, engine);
    }

    // -- structural operations (queued) -------------------------------------

    /// Stage a new entity; see [`OperationBuffer::build_entity`].
    #[track_caller]
    pub fn build_entity<'a>(
        &'a mut self,
        egid: Egid,
        descriptor: &'a EntityDescriptor,
    ) -> Result<Initializer<'a>, EcsError> {
        self.operations.current().build_entity(egid, descriptor)
    }

    #[track_caller]
    pub fn remove_entity(&mut self, egid: Egid, descriptor: &EntityDescriptor) {
        self.operations.current().remove_entity(egid, descriptor);
    }

    #[track_caller]
    pub fn swap_entity_group(&mut self, from: Egid, to_group: GroupId, descriptor: &EntityDescriptor) {
        self.operations.current().swap_entity_group(from, to_group, descriptor);
    }

    #[track_caller]
    pub fn swap_entity(&mut self, from: Egid, to: Egid, descriptor: &EntityDescriptor) {
        self.operations.current().swap_entity(from, to, descriptor);
    }

    #[track_caller]
    pub fn remove_entities_from_group(&mut self, group: GroupId) {
        self.operations.current().remove_entities_from_group(group);
    }

    #[track_caller]
    pub fn swap_group(&mut self, from: GroupId, to: GroupId) {
        self.operations.current().swap_group(from, to);
    }

    /// The buffer operations are currently recorded into.
    pub fn operations(&mut self) -> &mut OperationBuffer {
        self.operations.current()
    }

    pub fn has_queued_operations(&self) -> bool {
        self.operations.any_operation_queued()
    }

    pub fn submission_state(&self) -> SubmissionState {
        self.operations.state()
    }

    /// Apply everything queued since the last submission.
    ///
    /// A failed submission is partially applied: operations replayed before
    /// the failure stay, the rest of the cycle is dropped.
    pub fn submit_entities(&mut self) -> Result<SubmissionReport, EcsError> {
        let report = self.operations.submit(ReplayContext {
            groups: &mut self.groups,
            registry: &self.registry,
            reactors: &mut self.reactors,
            policy: self.config.missing_entity_policy,
            store_capacity: self.config.initial_store_capacity,
        })?;
        self.last_report = report;
        Ok(report)
    }

    /// Report of the last successful submission.
    pub fn last_submission_report(&self) -> &SubmissionReport {
        &self.last_report
    }

    // -- direct access ------------------------------------------------------

    /// Whether `egid` has a `T` record.
    pub fn exists<T: Component>(&self, egid: Egid) -> bool {
        self.store::<T>(egid.group_id).is_some_and(|store| store.has(egid))
    }

    pub fn get<T: Component>(&self, egid: Egid) -> Result<&T, EcsError> {
        match self.store::<T>(egid.group_id) {
            Some(store) => store.get(egid),
            None => Err(not_found::<T>(egid)),
        }
    }

    pub fn get_mut<T: Component>(&mut self, egid: Egid) -> Result<&mut T, EcsError> {
        match self.store_mut::<T>(egid.group_id) {
            Some(store) => store.get_mut(egid),
            None => Err(not_found::<T>(egid)),
        }
    }

    /// Number of `T` records in `group`.
    pub fn count<T: Component>(&self, group: GroupId) -> usize {
        self.store::<T>(group).map_or(0, ComponentStore::len)
    }

    /// Current slot of `egid` in its `T` store.
    pub fn index_of<T: Component>(&self, egid: Egid) -> Option<u32> {
        self.store::<T>(egid.group_id)?.index_of(egid.entity_id)
    }

    /// Entity ids that have a `T` record in `group`, in slot order.
    pub fn entity_ids<T: Component>(&self, group: GroupId) -> Vec<EntityId> {
        self.store::<T>(group)
            .map(|store| store.entity_ids().iter().collect())
            .unwrap_or_default()
    }

    pub fn store<T: Component>(&self, group: GroupId) -> Option<&ComponentStore<T>> {
        let type_id = self.registry.lookup::<T>()?;
        self.groups.group(group)?.typed::<T>(type_id)
    }

    pub fn store_mut<T: Component>(&mut self, group: GroupId) -> Option<&mut ComponentStore<T>> {
        let type_id = self.registry.lookup::<T>()?;
        self.groups.group_mut(group)?.typed_mut::<T>(type_id)
    }

    /// Whether `group` currently exists.
    pub fn has_group(&self, group: GroupId) -> bool {
        self.groups.group(group).is_some()
    }

    /// Hash of every store's index layout and record counts.
    ///
    /// Two databases that went through the same operations have the same
    /// fingerprint. Component values are not hashed.
    pub fn fingerprint(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        self.groups.hash_layout(&mut hasher);
        hasher.finalize()
    }
}

fn not_found<T: Component>(egid: Egid) -> EcsError {
    EcsError::NotFound {
        egid,
        component: crate::component::short_type_name::<T>(),
    }
}
