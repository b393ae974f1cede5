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

//! World: central entity, component and relation storage
//!
//! The world owns the type registry, the entity manager, the archetype graph
//! and every dense and sparse table. It is the single source of truth; all
//! structural operations go through it so the location and relation indexes
//! stay consistent.
//!
//! Relations are partitioned by the archetypes of their endpoints, so when an
//! entity changes archetype every relation row mentioning it is physically
//! relocated to the table keyed by its new archetype. That relocation is the
//! subtle invariant of [`World::add`] and [`World::remove`].

use std::any::TypeId;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::archetype::{ArchetypeGraph, ArchetypeId};
use crate::component::{Bundle, Component, MAX_BUNDLE_COMPONENTS};
use crate::dense::DenseTableRegistry;
use crate::entity::{Entity, EntityLocation, EntityManager};
use crate::query::{Query, QueryArgs, ReadOnlyArgs};
use crate::sparse::{SparseRelationRegistry, SparseRelationTableId};
use crate::term::QueryTerm;
use crate::types::{Category, DataTypeId, TypeRegistry};

/// Central ECS world.
pub struct World {
    types: TypeRegistry,
    entities: EntityManager,
    archetypes: ArchetypeGraph,
    dense: DenseTableRegistry,
    relations: SparseRelationRegistry,

    /// Typed singletons for global state
    resources: AHashMap<TypeId, Box<dyn std::any::Any + Send + Sync>>,
}

impl World {
    /// Create a new, empty world.
    pub fn new() -> Self {
        let mut world = Self {
            types: TypeRegistry::new(),
            entities: EntityManager::new(),
            archetypes: ArchetypeGraph::new(),
            dense: DenseTableRegistry::new(),
            relations: SparseRelationRegistry::new(),
            resources: AHashMap::new(),
        };

        // The empty archetype's table exists up front; component-less
        // entities land there and the id is pinned to 0.
        world
            .dense
            .ensure(ArchetypeId::EMPTY, &world.archetypes, &world.types);
        world
    }

    // ========== Type registration ==========

    pub fn register_component<T: Component>(&mut self) -> DataTypeId {
        self.types.register_component::<T>()
    }

    pub fn register_relation<T: Component>(&mut self, symmetric: bool, tree: bool) -> DataTypeId {
        self.types.register_relation::<T>(symmetric, tree)
    }

    pub fn register_resource<T: Component>(&mut self) -> DataTypeId {
        self.types.register_resource::<T>()
    }

    // ========== Entities ==========

    /// Spawn a new entity with the given bundle of components. The component
    /// types must already be registered.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> Entity {
        let type_ids = B::type_ids(&self.types);
        for (i, &ty) in type_ids.iter().enumerate() {
            assert!(
                self.types.is_component(ty),
                "type '{}' is not registered as a component",
                self.types.info(ty).name()
            );
            assert!(
                !type_ids[..i].contains(&ty),
                "duplicate component '{}' in bundle",
                self.types.info(ty).name()
            );
        }

        let archetype = self.archetypes.intern(&type_ids);
        let entity = self.entities.create();
        let table = self.dense.ensure(archetype, &self.archetypes, &self.types);
        let row = table.push_entity(entity.index);

        let mut ptrs: SmallVec<[*mut u8; MAX_BUNDLE_COMPONENTS]> = SmallVec::new();
        for &ty in type_ids.iter() {
            let column = table.column_mut(ty).expect("interned archetype has column");
            ptrs.push(unsafe { column.push_uninit() });
        }
        unsafe {
            bundle.write(&ptrs);
        }

        self.entities
            .set_location(entity, EntityLocation { archetype, row });
        tracing::debug!(entity = entity.index, archetype = archetype.0, "spawned entity");
        entity
    }

    /// Spawn an entity with no components; it lives in the empty archetype.
    pub fn create_empty(&mut self) -> Entity {
        self.spawn(())
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Destroy an entity, its components and every relation mentioning it.
    /// Idempotent: destroying a stale id is a warned no-op.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        let Some(location) = self.entities.location(entity) else {
            tracing::warn!(index = entity.index, "despawn of a dead entity ignored");
            return false;
        };
        let archetype = location.archetype;
        let index = entity.index;

        // Children of a destroyed tree parent become roots; remember them so
        // their subtree depths can be fixed after the cascade.
        let mut orphaned: Vec<(DataTypeId, u32)> = Vec::new();
        for i in 0..self.relations.len() {
            let id = self.relations.id(i);
            if id.to != archetype {
                continue;
            }
            if let Category::Relation { tree: true, .. } = self.types.category(id.data_type) {
                let table = self.relations.table(i);
                for row in table.view_to(index) {
                    orphaned.push((id.data_type, table.indices(row).0));
                }
            }
        }

        // Cascade: erase every relation row with this entity on either side.
        for i in 0..self.relations.len() {
            let id = self.relations.id(i);
            if id.from == archetype {
                self.relations.table_mut(i).erase_from(index);
            }
            if id.to == archetype {
                self.relations.table_mut(i).erase_to(index);
            }
        }
        for (ty, child) in orphaned {
            self.refresh_tree_depths(ty, child, 0);
        }

        let table = self.dense.get_mut(archetype).expect("live entity has a table");
        if let Some(swapped) = table.swap_remove(location.row) {
            self.entities.set_location_of_index(
                swapped,
                EntityLocation {
                    archetype,
                    row: location.row,
                },
            );
        }
        self.entities.destroy(entity);
        tracing::debug!(index, "despawned entity");
        true
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn archetype_of(&self, entity: Entity) -> Option<ArchetypeId> {
        self.entities.location(entity).map(|loc| loc.archetype)
    }

    /// Component set of a live entity.
    pub fn components(&self, entity: Entity) -> Option<&[DataTypeId]> {
        let location = self.entities.location(entity)?;
        Some(self.archetypes.signature(location.archetype))
    }

    /// Number of rows in the dense table of an archetype, 0 if the table was
    /// never created.
    pub fn archetype_table_len(&self, archetype: ArchetypeId) -> usize {
        self.dense.get(archetype).map_or(0, |table| table.len())
    }

    // ========== Components ==========

    /// Add a component, moving the entity to the archetype extended by `T`.
    /// Overwrites in place when the component is already present. Stale ids
    /// are a warned no-op.
    pub fn add<T: Component>(&mut self, entity: Entity, value: T) {
        let ty = self.types.id_of::<T>();
        assert!(
            self.types.is_component(ty),
            "type '{}' is not registered as a component",
            self.types.info(ty).name()
        );
        let Some(location) = self.entities.location(entity) else {
            tracing::warn!(index = entity.index, "add on a dead entity ignored");
            return;
        };

        if self.archetypes.contains(location.archetype, ty) {
            let table = self.dense.get_mut(location.archetype).unwrap();
            let column = table.column_mut(ty).unwrap();
            unsafe {
                *(column.get(location.row) as *mut T) = value;
            }
            return;
        }

        let dest = self.archetypes.with_component(location.archetype, ty);
        self.dense.ensure(dest, &self.archetypes, &self.types);
        let (src, dst) = self.dense.pair_mut(location.archetype, dest);
        let (new_row, swapped) = src.move_row_to(location.row, dst);
        unsafe {
            let slot = dst.column_mut(ty).unwrap().push_uninit();
            std::ptr::write(slot as *mut T, value);
        }

        if let Some(swapped) = swapped {
            self.entities.set_location_of_index(
                swapped,
                EntityLocation {
                    archetype: location.archetype,
                    row: location.row,
                },
            );
        }
        self.entities.set_location(
            entity,
            EntityLocation {
                archetype: dest,
                row: new_row,
            },
        );
        self.relocate_relations(entity.index, location.archetype, dest);
    }

    /// Remove a component, moving the entity to the reduced archetype.
    /// Returns false (without warning) if the component is absent.
    pub fn remove<T: Component>(&mut self, entity: Entity) -> bool {
        let ty = self.types.id_of::<T>();
        let Some(location) = self.entities.location(entity) else {
            tracing::warn!(index = entity.index, "remove on a dead entity ignored");
            return false;
        };
        if !self.archetypes.contains(location.archetype, ty) {
            return false;
        }

        let dest = self.archetypes.without_component(location.archetype, ty);
        self.dense.ensure(dest, &self.archetypes, &self.types);
        let (src, dst) = self.dense.pair_mut(location.archetype, dest);
        let (new_row, swapped) = src.move_row_to(location.row, dst);

        if let Some(swapped) = swapped {
            self.entities.set_location_of_index(
                swapped,
                EntityLocation {
                    archetype: location.archetype,
                    row: location.row,
                },
            );
        }
        self.entities.set_location(
            entity,
            EntityLocation {
                archetype: dest,
                row: new_row,
            },
        );
        self.relocate_relations(entity.index, location.archetype, dest);
        true
    }

    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let ty = self.types.id_of::<T>();
        let Some(location) = self.entities.location(entity) else {
            tracing::warn!(index = entity.index, "get on a dead entity");
            return None;
        };
        let column = self.dense.get(location.archetype)?.column(ty)?;
        unsafe { Some(&*(column.get(location.row) as *const T)) }
    }

    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let ty = self.types.id_of::<T>();
        let Some(location) = self.entities.location(entity) else {
            tracing::warn!(index = entity.index, "get_mut on a dead entity");
            return None;
        };
        let column = self.dense.get_mut(location.archetype)?.column_mut(ty)?;
        unsafe { Some(&mut *(column.get(location.row) as *mut T)) }
    }

    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        let ty = self.types.id_of::<T>();
        self.has_ty(entity, ty)
    }

    /// Whether the entity's archetype contains the column for a type id.
    pub fn has_ty(&self, entity: Entity, ty: DataTypeId) -> bool {
        self.entities
            .location(entity)
            .map(|loc| self.archetypes.contains(loc.archetype, ty))
            .unwrap_or(false)
    }

    // ========== Relations ==========

    /// Relate two entities, overwriting any existing instance of the relation
    /// between them. A dead endpoint makes this a warned no-op. Symmetric
    /// relations canonicalize the pair before storage; tree relations reject
    /// second parents and cycles.
    pub fn relate<R: Component>(&mut self, from: Entity, to: Entity, value: R) {
        let ty = self.types.id_of::<R>();
        let (symmetric, tree) = match self.types.category(ty) {
            Category::Relation { symmetric, tree } => (symmetric, tree),
            _ => panic!(
                "type '{}' is not registered as a relation",
                self.types.info(ty).name()
            ),
        };

        let (Some(from_loc), Some(to_loc)) =
            (self.entities.location(from), self.entities.location(to))
        else {
            tracing::warn!(
                from = from.index,
                to = to.index,
                "relate with a dead endpoint ignored"
            );
            return;
        };

        let (mut from, mut to) = (from, to);
        let (mut from_loc, mut to_loc) = (from_loc, to_loc);
        if symmetric
            && (from_loc.archetype > to_loc.archetype
                || (from_loc.archetype == to_loc.archetype && from.index > to.index))
        {
            std::mem::swap(&mut from, &mut to);
            std::mem::swap(&mut from_loc, &mut to_loc);
        }

        let mut depth = 0;
        if tree {
            if let Some((_, _, parent)) = self.tree_edge(ty, from.index) {
                if parent != to.index {
                    tracing::warn!(
                        from = from.index,
                        "tree relation insert rejected: entity already has a parent"
                    );
                    return;
                }
            }
            // Walking up from `to` must never reach `from`.
            let mut cursor = to.index;
            loop {
                if cursor == from.index {
                    tracing::warn!(
                        from = from.index,
                        to = to.index,
                        "tree relation insert rejected: would form a cycle"
                    );
                    return;
                }
                match self.tree_edge(ty, cursor) {
                    Some((_, _, parent)) => cursor = parent,
                    None => break,
                }
            }
            depth = self
                .tree_edge(ty, to.index)
                .map(|(id, _, _)| id.depth + 1)
                .unwrap_or(1);
        }

        let id = SparseRelationTableId {
            data_type: ty,
            from: from_loc.archetype,
            to: to_loc.archetype,
            depth,
        };
        let table_index = self.relations.ensure(id, &self.types);
        let value = ManuallyDrop::new(value);
        unsafe {
            self.relations.table_mut(table_index).insert(
                from.index,
                to.index,
                &*value as *const R as *const u8,
            );
        }

        if tree {
            self.refresh_tree_depths(ty, from.index, depth);
        }
    }

    /// Remove the relation between two entities. Returns whether it existed.
    pub fn unrelate<R: Component>(&mut self, from: Entity, to: Entity) -> bool {
        let ty = self.types.id_of::<R>();
        let Some((id, table_index)) = self.find_relation_table::<R>(from, to) else {
            return false;
        };
        let (from, to) = self.canonical_pair(ty, from, to);
        let erased = self.relations.table_mut(table_index).erase(from.index, to.index);
        if erased {
            if let Category::Relation { tree: true, .. } = self.types.category(id.data_type) {
                // The from entity is a root again; its subtree shifts up.
                self.refresh_tree_depths(ty, from.index, 0);
            }
        }
        erased
    }

    /// Whether the relation exists between the two entities.
    pub fn related<R: Component>(&self, from: Entity, to: Entity) -> bool {
        self.relation_row::<R>(from, to).is_some()
    }

    pub fn relation<R: Component>(&self, from: Entity, to: Entity) -> Option<&R> {
        let (table_index, row) = self.relation_row::<R>(from, to)?;
        unsafe { Some(&*(self.relations.table(table_index).at(row) as *const R)) }
    }

    pub fn relation_mut<R: Component>(&mut self, from: Entity, to: Entity) -> Option<&mut R> {
        let (table_index, row) = self.relation_row::<R>(from, to)?;
        unsafe { Some(&mut *(self.relations.table_mut(table_index).at(row) as *mut R)) }
    }

    /// All relations going out of the entity, as `(other, value)` pairs. For
    /// symmetric relations the entity may be on either side of the stored
    /// row; identity rows are reported once.
    pub fn relations_from<R: Component>(&self, entity: Entity) -> Vec<(Entity, &R)> {
        let ty = self.types.id_of::<R>();
        let (symmetric, _) = self.types.relation_flags(ty);
        let Some(location) = self.entities.location(entity) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for i in 0..self.relations.len() {
            let id = self.relations.id(i);
            if id.data_type != ty {
                continue;
            }
            let table = self.relations.table(i);
            if id.from == location.archetype {
                for row in table.view_from(entity.index) {
                    let (_, other) = table.indices(row);
                    let other = self.entities.entity_from_index(other).expect("live endpoint");
                    unsafe {
                        out.push((other, &*(table.at(row) as *const R)));
                    }
                }
            }
            if symmetric && id.to == location.archetype {
                for row in table.view_to(entity.index) {
                    let (other, to) = table.indices(row);
                    if other == to {
                        // Identity row, already reported by the from side.
                        continue;
                    }
                    let other = self.entities.entity_from_index(other).expect("live endpoint");
                    unsafe {
                        out.push((other, &*(table.at(row) as *const R)));
                    }
                }
            }
        }
        out
    }

    /// All relations coming into the entity, as `(other, value)` pairs.
    pub fn relations_to<R: Component>(&self, entity: Entity) -> Vec<(Entity, &R)> {
        let ty = self.types.id_of::<R>();
        let (symmetric, _) = self.types.relation_flags(ty);
        if symmetric {
            return self.relations_from::<R>(entity);
        }
        let Some(location) = self.entities.location(entity) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for i in 0..self.relations.len() {
            let id = self.relations.id(i);
            if id.data_type != ty || id.to != location.archetype {
                continue;
            }
            let table = self.relations.table(i);
            for row in table.view_to(entity.index) {
                let (other, _) = table.indices(row);
                let other = self.entities.entity_from_index(other).expect("live endpoint");
                unsafe {
                    out.push((other, &*(table.at(row) as *const R)));
                }
            }
        }
        out
    }

    /// Rows stored for one relation table, 0 if it was never created.
    pub fn relation_table_len(&self, id: SparseRelationTableId) -> usize {
        self.relations
            .index_of(id)
            .map_or(0, |i| self.relations.table(i).len())
    }

    // ========== Resources ==========

    /// Insert a resource, replacing any previous value of the same type. The
    /// type is registered as a resource as a side effect so that system
    /// signatures can refer to it.
    pub fn insert_resource<R: Component>(&mut self, resource: R) {
        self.types.register_resource::<R>();
        self.resources.insert(TypeId::of::<R>(), Box::new(resource));
    }

    pub fn resource<R: 'static>(&self) -> Option<&R> {
        self.resources
            .get(&TypeId::of::<R>())
            .and_then(|r| r.downcast_ref())
    }

    pub fn resource_mut<R: 'static>(&mut self) -> Option<&mut R> {
        self.resources
            .get_mut(&TypeId::of::<R>())
            .and_then(|r| r.downcast_mut())
    }

    pub fn has_resource<R: 'static>(&self) -> bool {
        self.resources.contains_key(&TypeId::of::<R>())
    }

    pub fn remove_resource<R: 'static>(&mut self) -> Option<R> {
        self.resources
            .remove(&TypeId::of::<R>())
            .and_then(|r| r.downcast().ok())
            .map(|boxed| *boxed)
    }

    // ========== Queries ==========

    /// Read-only query over the given argument tuple.
    pub fn query<'w, Q>(&'w self) -> Query<'w, Q>
    where
        Q: QueryArgs<'w> + ReadOnlyArgs,
    {
        Query::new(NonNull::from(self), Vec::new())
    }

    /// Query that may include `&mut` arguments.
    pub fn query_mut<'w, Q>(&'w mut self) -> Query<'w, Q>
    where
        Q: QueryArgs<'w>,
    {
        Query::new(NonNull::from(&mut *self), Vec::new())
    }

    /// Read-only query with extra terms merged into the argument terms.
    pub fn query_with<'w, Q>(&'w self, extra_terms: Vec<QueryTerm>) -> Query<'w, Q>
    where
        Q: QueryArgs<'w> + ReadOnlyArgs,
    {
        Query::new(NonNull::from(self), extra_terms)
    }

    /// Mutable query with extra terms merged into the argument terms.
    pub fn query_mut_with<'w, Q>(&'w mut self, extra_terms: Vec<QueryTerm>) -> Query<'w, Q>
    where
        Q: QueryArgs<'w>,
    {
        Query::new(NonNull::from(&mut *self), extra_terms)
    }

    // ========== Internals ==========

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn entities(&self) -> &EntityManager {
        &self.entities
    }

    pub fn archetypes(&self) -> &ArchetypeGraph {
        &self.archetypes
    }

    pub(crate) fn dense(&self) -> &DenseTableRegistry {
        &self.dense
    }

    pub fn relations(&self) -> &SparseRelationRegistry {
        &self.relations
    }

    /// Move every relation row whose endpoint archetype changed into the
    /// table keyed by the new archetype, preserving depth.
    fn relocate_relations(&mut self, index: u32, old: ArchetypeId, new: ArchetypeId) {
        debug_assert_ne!(old, new);

        let mut i = 0;
        while i < self.relations.len() {
            let id = self.relations.id(i);
            if id.from == old && self.relations.table(i).first_from(index).is_some() {
                let dest = SparseRelationTableId { from: new, ..id };
                let j = self.relations.ensure(dest, &self.types);
                let (source, target) = self.relations.pair_mut(i, j);
                source.move_from(index, target);
            }
            i += 1;
        }

        // The from pass may have created tables that also hold rows pointing
        // at the entity, so the to pass re-reads the table list.
        let mut i = 0;
        while i < self.relations.len() {
            let id = self.relations.id(i);
            if id.to == old && self.relations.table(i).first_to(index).is_some() {
                let dest = SparseRelationTableId { to: new, ..id };
                let j = self.relations.ensure(dest, &self.types);
                let (source, target) = self.relations.pair_mut(i, j);
                source.move_to(index, target);
            }
            i += 1;
        }
    }

    /// Outgoing tree edge of the entity with the given index, if any:
    /// `(table id, row, parent index)`.
    fn tree_edge(&self, ty: DataTypeId, index: u32) -> Option<(SparseRelationTableId, u32, u32)> {
        let archetype = self.entities.location_of_index(index)?.archetype;
        for i in 0..self.relations.len() {
            let id = self.relations.id(i);
            if id.data_type == ty && id.from == archetype {
                if let Some(row) = self.relations.table(i).first_from(index) {
                    return Some((id, row, self.relations.table(i).indices(row).1));
                }
            }
        }
        None
    }

    /// After the entity's own edge moved to `depth`, move the edges of its
    /// descendants so that `depth(child) == depth(parent) + 1` holds again.
    /// `depth == 0` means the entity is now a root.
    fn refresh_tree_depths(&mut self, ty: DataTypeId, index: u32, depth: u32) {
        let Some(location) = self.entities.location_of_index(index) else {
            return;
        };
        let want = depth + 1;

        let mut pending: Vec<(SparseRelationTableId, u32)> = Vec::new();
        for i in 0..self.relations.len() {
            let id = self.relations.id(i);
            if id.data_type != ty || id.to != location.archetype || id.depth == want {
                continue;
            }
            let table = self.relations.table(i);
            for row in table.view_to(index) {
                pending.push((id, table.indices(row).0));
            }
        }

        for (id, child) in pending {
            let source = self.relations.index_of(id).expect("table still interned");
            let dest_id = SparseRelationTableId { depth: want, ..id };
            let target = self.relations.ensure(dest_id, &self.types);
            let (source_table, target_table) = self.relations.pair_mut(source, target);
            if let Some(row) = source_table.row_of(child, index) {
                unsafe {
                    target_table.insert(child, index, source_table.at(row));
                }
                source_table.erase_forget(child, index);
            }
            self.refresh_tree_depths(ty, child, want);
        }
    }

    /// Canonical storage order of a relation pair.
    fn canonical_pair(&self, ty: DataTypeId, from: Entity, to: Entity) -> (Entity, Entity) {
        let (symmetric, _) = self.types.relation_flags(ty);
        if !symmetric {
            return (from, to);
        }
        let (Some(from_loc), Some(to_loc)) =
            (self.entities.location(from), self.entities.location(to))
        else {
            return (from, to);
        };
        if from_loc.archetype > to_loc.archetype
            || (from_loc.archetype == to_loc.archetype && from.index > to.index)
        {
            (to, from)
        } else {
            (from, to)
        }
    }

    /// Table and row holding the relation between the two entities.
    fn relation_row<R: Component>(&self, from: Entity, to: Entity) -> Option<(usize, u32)> {
        let ty = self.types.id_of::<R>();
        let (from, to) = self.canonical_pair(ty, from, to);
        let from_loc = self.entities.location(from)?;
        let to_loc = self.entities.location(to)?;

        for depth in 0..=self.relations.max_depth(ty) {
            let id = SparseRelationTableId {
                data_type: ty,
                from: from_loc.archetype,
                to: to_loc.archetype,
                depth,
            };
            if let Some(i) = self.relations.index_of(id) {
                if let Some(row) = self.relations.table(i).row_of(from.index, to.index) {
                    return Some((i, row));
                }
            }
        }
        None
    }

    /// Table holding the relation between the two entities, by id.
    fn find_relation_table<R: Component>(
        &self,
        from: Entity,
        to: Entity,
    ) -> Option<(SparseRelationTableId, usize)> {
        let (i, _) = self.relation_row::<R>(from, to)?;
        Some((self.relations.id(i), i))
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
