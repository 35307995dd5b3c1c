//! Grove ECS -- grouped entity-component store with deferred structural changes.
//!
//! Components are plain values stored densely per component type and per
//! *group*, an exclusive partition of entities. An entity is addressed by its
//! [`Egid`] (entity id + group id) and every record lookup is O(1) through an
//! open-addressed index. Structural changes (building, removing and moving
//! entities, removing or merging whole groups) are queued into a
//! double-buffered operation log and applied together by
//! [`EntitiesDb::submit_entities`], so iteration code can request them freely.
//!
//! # Quick Start
//!
//! ```
//! use grove_ecs::prelude::*;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//! impl Component for Position {}
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//! impl Component for Velocity {}
//!
//! let mut db = EntitiesDb::new();
//! let ship = db.descriptor().with::<Position>().with::<Velocity>().build().unwrap();
//! let [active, docked] = [db.allocate_group().unwrap(), db.allocate_group().unwrap()];
//!
//! let egid = Egid::new(0, active);
//! db.build_entity(egid, &ship)
//!     .unwrap()
//!     .init(Velocity { dx: 1.0, dy: 0.0 })
//!     .unwrap();
//! db.submit_entities().unwrap();
//!
//! for batch in db.query_all_mut::<(&mut Position, &Velocity)>() {
//!     let (pos, vel) = batch.buffers;
//!     for (p, v) in pos.iter_mut().zip(vel) {
//!         p.x += v.dx;
//!     }
//! }
//!
//! db.swap_entity_group(egid, docked, &ship);
//! db.submit_entities().unwrap();
//! assert_eq!(db.get::<Position>(Egid::new(0, docked)).unwrap().x, 1.0);
//! assert!(!db.exists::<Position>(egid));
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod db;
pub mod entity;
pub mod group;
pub mod index;
pub mod operations;
pub mod query;
pub mod reactive;
pub mod scheduler;
pub mod store;

use entity::{Egid, GroupId};
use operations::Caller;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The same EGID was built twice in one cycle, or its destination slot is
    /// already taken.
    #[error("entity {egid} already exists (queued at {caller})")]
    DuplicateEntity { egid: Egid, caller: Caller },

    /// No record of the component for this entity.
    #[error("entity {egid} has no '{component}' component")]
    NotFound { egid: Egid, component: &'static str },

    /// The group does not exist.
    #[error("group {group} does not exist")]
    GroupNotFound { group: GroupId },

    /// A component type is not valid where it was used.
    #[error("component type '{component}' rejected: {reason}")]
    TypeMismatch {
        component: &'static str,
        reason: String,
    },

    /// Replaying a whole-group removal or swap failed.
    #[error("group operation on {group} (to {to_group:?}) queued at {caller} failed: {source}")]
    GroupOperationFailure {
        group: GroupId,
        to_group: Option<GroupId>,
        caller: Caller,
        #[source]
        source: Box<EcsError>,
    },

    /// The group allocator cannot hand out `requested` more ids without
    /// wrapping past `u32::MAX`.
    #[error("cannot allocate {requested} group ids starting at {next}: group ids exhausted")]
    GroupIdsExhausted { next: u32, requested: u32 },

    /// A raw byte buffer does not match the store's record count.
    #[error("byte buffer for '{component}' has {actual} bytes, expected {expected}")]
    BufferSizeMismatch {
        component: &'static str,
        expected: usize,
        actual: usize,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{Component, ComponentRegistry, ComponentTypeId, EntityDescriptor};
    pub use crate::db::{DbConfig, EntitiesDb, MissingEntityPolicy};
    pub use crate::entity::{Egid, EntityId, GroupAllocator, GroupId, GroupRange};
    pub use crate::operations::{Caller, Initializer, OperationBuffer, SubmissionReport, SubmissionState};
    pub use crate::query::{GroupsQuery, GroupsQueryIter, Query, QueryBatch, ReadOnlyQuery};
    pub use crate::reactive::ReactiveEngine;
    pub use crate::scheduler::{SchedulerConfig, SimpleSubmissionScheduler};
    pub use crate::store::{ComponentStore, EntityIds};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
