//! Component types, their registration, and entity descriptors.
//!
//! Every component type gets a stable [`ComponentTypeId`] the first time it is
//! registered in a [`ComponentRegistry`]. The id is a small integer used as the
//! key of per-group store maps and as an array index for per-type tables, so no
//! runtime type objects are looked up on the hot path.
//!
//! An [`EntityDescriptor`] is the fixed set of component types an entity is
//! built with. Descriptor problems (a type listed twice, an empty set) are
//! reported as [`EcsError::TypeMismatch`] when the descriptor is built, before
//! any entity touches storage.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;

use crate::entity::{Egid, GroupId};
use crate::index::IndexKey;
use crate::store::{AnyStore, ComponentStore};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// A plain-value record stored densely per group.
///
/// Types that keep a copy of their own [`Egid`] set `NEEDS_EGID` and override
/// [`set_egid`](Component::set_egid); the store calls it whenever the entity is
/// added or moves to another group.
///
/// ```
/// use grove_ecs::prelude::*;
///
/// #[derive(Default)]
/// struct Tracked {
///     egid: Egid,
/// }
///
/// impl Component for Tracked {
///     const NEEDS_EGID: bool = true;
///
///     fn set_egid(&mut self, egid: Egid) {
///         self.egid = egid;
///     }
/// }
/// ```
pub trait Component: Default + Send + Sync + 'static {
    /// Whether [`set_egid`](Component::set_egid) must be called on moves.
    const NEEDS_EGID: bool = false;

    fn set_egid(&mut self, _egid: Egid) {}
}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Stable numeric id of a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    /// Position of this type in per-type tables.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl IndexKey for ComponentTypeId {
    #[inline]
    fn hash_code(&self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentBuilder
// ---------------------------------------------------------------------------

/// Type-erased handle for one component type: its id, its name, and how to
/// create an empty store of it.
#[derive(Clone, Copy)]
pub struct ComponentBuilder {
    id: ComponentTypeId,
    name: &'static str,
    rust_type: TypeId,
    new_store: fn(GroupId, usize) -> Box<dyn AnyStore>,
}

fn new_store_of<T: Component>(group: GroupId, capacity: usize) -> Box<dyn AnyStore> {
    Box::new(ComponentStore::<T>::with_capacity(group, capacity))
}

impl ComponentBuilder {
    fn of<T: Component>(id: ComponentTypeId) -> Self {
        Self {
            id,
            name: short_type_name::<T>(),
            rust_type: TypeId::of::<T>(),
            new_store: new_store_of::<T>,
        }
    }

    #[inline]
    pub fn type_id(&self) -> ComponentTypeId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// An empty store for this component type in `group`.
    pub fn new_store(&self, group: GroupId, capacity: usize) -> Box<dyn AnyStore> {
        (self.new_store)(group, capacity)
    }

    pub(crate) fn is<T: 'static>(&self) -> bool {
        self.rust_type == TypeId::of::<T>()
    }
}

impl fmt::Debug for ComponentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentBuilder")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// `type_name` without the module path.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let generic_start = full.find('<').unwrap_or(full.len());
    match full[..generic_start].rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`ComponentTypeId`]s and their builders.
///
/// Registering a type twice returns the id from the first registration.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentTypeId>,
    /// Indexed by `ComponentTypeId::index`.
    builders: Vec<ComponentBuilder>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, returning its stable id.
    pub fn register<T: Component>(&mut self) -> ComponentTypeId {
        let rust_type = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type) {
            return existing;
        }
        let id = ComponentTypeId(self.builders.len() as u32);
        self.builders.push(ComponentBuilder::of::<T>(id));
        self.by_type.insert(rust_type, id);
        id
    }

    /// Id of `T`, if it was registered.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn builder(&self, id: ComponentTypeId) -> Option<&ComponentBuilder> {
        self.builders.get(id.index())
    }

    /// Display name of a registered type, `"?"` for unknown ids.
    pub fn name(&self, id: ComponentTypeId) -> &'static str {
        self.builder(id).map_or("?", ComponentBuilder::name)
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// Start declaring an entity descriptor.
    pub fn descriptor(&mut self) -> DescriptorBuilder<'_> {
        DescriptorBuilder {
            registry: self,
            builders: Vec::new(),
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// EntityDescriptor
// ---------------------------------------------------------------------------

/// The component set an entity is built, removed and swapped with.
#[derive(Clone, Debug)]
pub struct EntityDescriptor {
    builders: Vec<ComponentBuilder>,
}

impl EntityDescriptor {
    pub fn builders(&self) -> &[ComponentBuilder] {
        &self.builders
    }

    pub fn component_types(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.builders.iter().map(ComponentBuilder::type_id)
    }

    pub fn contains(&self, id: ComponentTypeId) -> bool {
        self.builders.iter().any(|b| b.id == id)
    }

    pub(crate) fn builder_of<T: 'static>(&self) -> Option<&ComponentBuilder> {
        self.builders.iter().find(|b| b.is::<T>())
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

/// Builder returned by [`ComponentRegistry::descriptor`].
///
/// The first problem found is kept and returned by [`build`](Self::build).
pub struct DescriptorBuilder<'r> {
    registry: &'r mut ComponentRegistry,
    builders: Vec<ComponentBuilder>,
    error: Option<EcsError>,
}

impl DescriptorBuilder<'_> {
    /// Declare component `T`.
    pub fn with<T: Component>(mut self) -> Self {
        let id = self.registry.register::<T>();
        let builder = self.registry.builders[id.index()];
        self.push(builder);
        self
    }

    /// Declare every component of `base` as well.
    pub fn extend(mut self, base: &EntityDescriptor) -> Self {
        for builder in &base.builders {
            self.push(*builder);
        }
        self
    }

    pub fn build(self) -> Result<EntityDescriptor, EcsError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.builders.is_empty() {
            return Err(EcsError::TypeMismatch {
                component: "()",
                reason: "descriptor declares no components".to_owned(),
            });
        }
        Ok(EntityDescriptor {
            builders: self.builders,
        })
    }

    fn push(&mut self, builder: ComponentBuilder) {
        if self.builders.iter().any(|b| b.id == builder.id) {
            self.error.get_or_insert(EcsError::TypeMismatch {
                component: builder.name,
                reason: "declared more than once in the same descriptor".to_owned(),
            });
            return;
        }
        self.builders.push(builder);
    }
}
