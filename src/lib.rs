// Copyright 2025 Strata Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Strata ECS - the entity-component-system runtime of the Strata voxel
//! engine.
//!
//! Entities live in archetype-keyed dense tables, pairwise relations live in
//! sparse tables indexed by both endpoints, queries compile term lists into
//! incremental plans, and a constraint scheduler runs systems under ordering,
//! grouping and conditional-execution edges.

pub mod app;
pub mod archetype;
pub mod column;
pub mod command;
pub mod component;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod query;
pub mod schedule;
pub mod sparse;
pub mod system;
pub mod term;
pub mod types;
pub mod dense;
pub mod world;

// Re-exports for convenience
pub use app::{App, Arguments, DeltaTime, Plugin, ShouldQuit};
pub use archetype::{ArchetypeGraph, ArchetypeId};
pub use command::{CommandBuffer, EntityRef, PendingEntity};
pub use component::{Bundle, Component};
pub use dispatcher::{Dispatcher, MAX_CONDITIONS};
pub use entity::{Entity, EntityLocation, EntityManager};
pub use error::{EcsError, Result};
pub use query::{Query, QueryArg, QueryArgs, ReadOnlyArg, ReadOnlyArgs, Traversal, MAX_TARGETS};
pub use schedule::{ConditionCache, ConditionId, NodeId, Schedule, SystemId, SystemRegistry};
pub use sparse::{SparseRelationTable, SparseRelationTableId};
pub use system::{Condition, System, SystemAccess, SystemBuilder, SystemContext};
pub use term::QueryTerm;
pub use types::{Category, DataTypeId, TypeInfo, TypeRegistry};
pub use world::World;

#[cfg(test)]
mod tests;
