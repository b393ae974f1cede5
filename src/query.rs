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

//! Query engine
//!
//! A query resolves its terms into a plan: one archetype node per target
//! (caching the archetypes whose columns satisfy the component terms) and one
//! related node per relation term (caching the sparse tables whose endpoint
//! archetypes match the two targets). Iteration drives the plan as a
//! backtracking loop; targets bound by earlier nodes are *pinned* for later
//! ones, and callers may pin a target to a specific entity to ask "does this
//! entity match?".

use std::marker::PhantomData;
use std::ptr::NonNull;

use smallvec::SmallVec;

use crate::archetype::ArchetypeId;
use crate::component::Component;
use crate::entity::Entity;
use crate::sparse::SparseRelationTableId;
use crate::term::{QueryTerm, TermKind, UNSPECIFIED};
use crate::types::{Category, DataTypeId, TypeRegistry};
use crate::world::World;

/// Maximum number of entity slots a single query may bind.
pub const MAX_TARGETS: usize = 4;

/// Table visit order for tree-like relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// No particular order.
    Random,
    /// Deepest tables first, i.e. leaves before roots.
    Up,
    /// Shallowest tables first, i.e. roots before leaves.
    Down,
}

/// Caches the archetypes matching one target's component terms.
struct ArchetypeNode {
    with: SmallVec<[DataTypeId; 4]>,
    without: SmallVec<[DataTypeId; 4]>,
    /// Matching archetypes in ascending id order.
    archetypes: Vec<ArchetypeId>,
    seen: usize,
}

impl ArchetypeNode {
    fn new() -> Self {
        Self {
            with: SmallVec::new(),
            without: SmallVec::new(),
            archetypes: Vec::new(),
            seen: 0,
        }
    }

    fn update(&mut self, world: &World) {
        let graph = world.archetypes();
        for i in self.seen..graph.len() {
            let id = ArchetypeId(i as u32);
            let matches = self.with.iter().all(|&ty| graph.contains(id, ty))
                && !self.without.iter().any(|&ty| graph.contains(id, ty));
            if matches {
                self.archetypes.push(id);
            }
        }
        self.seen = graph.len();
    }

    fn matches(&self, archetype: ArchetypeId) -> bool {
        self.archetypes.binary_search(&archetype).is_ok()
    }
}

struct ReverseEntry {
    id: SparseRelationTableId,
    /// Table also present in the normal list; skipped when duplicates are
    /// suppressed.
    duplicate: bool,
}

/// Caches the sparse tables matching one relation term.
struct RelatedNode {
    data_type: DataTypeId,
    from_target: usize,
    to_target: usize,
    symmetric: bool,
    include_duplicates: bool,
    traversal: Traversal,
    tables: Vec<SparseRelationTableId>,
    reverse_tables: Vec<ReverseEntry>,
    seen: usize,
}

impl RelatedNode {
    fn update(&mut self, world: &World, from_node: &ArchetypeNode, to_node: &ArchetypeNode) {
        let registry = world.relations();
        let prev_seen = self.seen;

        for i in self.seen..registry.len() {
            let id = registry.id(i);
            if id.data_type != self.data_type {
                continue;
            }

            let normal_candidate = from_node.matches(id.from);
            let reverse_candidate = self.symmetric && from_node.matches(id.to);
            if !normal_candidate && !reverse_candidate {
                continue;
            }

            let normal = normal_candidate && to_node.matches(id.to);
            let reverse = reverse_candidate && to_node.matches(id.from);
            if normal {
                self.tables.push(id);
            }
            if reverse {
                self.reverse_tables.push(ReverseEntry {
                    id,
                    duplicate: normal,
                });
            }
        }
        self.seen = registry.len();

        if prev_seen != self.seen {
            self.sort_tables();
        }
    }

    fn sort_tables(&mut self) {
        match self.traversal {
            Traversal::Random => {}
            Traversal::Up => self.tables.sort_by(|a, b| b.depth.cmp(&a.depth)),
            Traversal::Down => self.tables.sort_by(|a, b| a.depth.cmp(&b.depth)),
        }
    }

    fn total_tables(&self) -> usize {
        self.tables.len() + self.reverse_tables.len()
    }

    /// Table id and direction for a position in the combined list.
    fn table_at(&self, position: usize) -> (SparseRelationTableId, bool) {
        if position < self.tables.len() {
            (self.tables[position], false)
        } else {
            (self.reverse_tables[position - self.tables.len()].id, true)
        }
    }
}

enum DriverKind {
    /// Enumerates (or validates) the archetype and row of one target.
    Archetype(usize),
    /// Enumerates (or validates) the rows of one related node.
    Related(usize),
}

struct Driver {
    kind: DriverKind,
    /// Targets bound by earlier drivers.
    pins_before: u8,
}

/// Per-iteration cursor state: one slot per target plus per-driver positions.
pub struct QueryCursor {
    target_archetypes: [ArchetypeId; MAX_TARGETS],
    target_rows: [usize; MAX_TARGETS],
    /// Per driver: position in its table/archetype list.
    driver_table: SmallVec<[usize; 4]>,
    /// Per driver: current sparse row, for related drivers.
    driver_row: SmallVec<[u32; 4]>,
    /// Per related node: resolved registry table index of the current match.
    rel_table: SmallVec<[usize; 4]>,
    /// Per related node: resolved sparse row of the current match.
    rel_row: SmallVec<[u32; 4]>,
}

impl QueryCursor {
    fn new(drivers: usize, related: usize) -> Self {
        Self {
            target_archetypes: [ArchetypeId::EMPTY; MAX_TARGETS],
            target_rows: [0; MAX_TARGETS],
            driver_table: smallvec::smallvec![0; drivers],
            driver_row: smallvec::smallvec![0; drivers],
            rel_table: smallvec::smallvec![0; related],
            rel_row: smallvec::smallvec![0; related],
        }
    }
}

/// Compiled query plan over resolved terms.
pub struct QueryFilter {
    target_count: usize,
    archetype_nodes: Vec<ArchetypeNode>,
    related_nodes: Vec<RelatedNode>,
    drivers: Vec<Driver>,
}

impl QueryFilter {
    /// Build the plan for a resolved term list.
    ///
    /// # Panics
    /// Panics when the terms name more than [`MAX_TARGETS`] targets or use a
    /// type under the wrong category; both are programming errors.
    pub(crate) fn new(world: &World, terms: &[QueryTerm]) -> Self {
        let types = world.types();

        let mut target_count = 1;
        for term in terms {
            let max = match term.kind {
                TermKind::Entity { target } | TermKind::Component { target, .. } => target,
                TermKind::Relation {
                    from_target,
                    to_target,
                } => from_target.max(to_target),
            };
            assert!(max != UNSPECIFIED, "terms must be resolved before planning");
            target_count = target_count.max(max as usize + 1);
        }
        assert!(
            target_count <= MAX_TARGETS,
            "query names {target_count} targets, at most {MAX_TARGETS} are supported"
        );

        let mut archetype_nodes: Vec<ArchetypeNode> =
            (0..target_count).map(|_| ArchetypeNode::new()).collect();
        let mut related_nodes: Vec<RelatedNode> = Vec::new();

        for term in terms {
            match term.kind {
                TermKind::Entity { .. } => {}
                TermKind::Component {
                    target,
                    without,
                    optional,
                } => {
                    let ty = term.ty.expect("component terms carry a type");
                    assert!(
                        types.is_component(ty),
                        "type '{}' is not a component",
                        types.info(ty).name()
                    );
                    let node = &mut archetype_nodes[target as usize];
                    if without {
                        node.without.push(ty);
                    } else if !optional {
                        node.with.push(ty);
                    }
                }
                TermKind::Relation {
                    from_target,
                    to_target,
                } => {
                    let ty = term.ty.expect("relation terms carry a type");
                    let (symmetric, _) = match types.category(ty) {
                        Category::Relation { symmetric, tree } => (symmetric, tree),
                        _ => panic!("type '{}' is not a relation", types.info(ty).name()),
                    };
                    related_nodes.push(RelatedNode {
                        data_type: ty,
                        from_target: from_target as usize,
                        to_target: to_target as usize,
                        symmetric,
                        include_duplicates: false,
                        traversal: Traversal::Random,
                        tables: Vec::new(),
                        reverse_tables: Vec::new(),
                        seen: 0,
                    });
                }
            }
        }

        // Plan order: a relation term drives both of its targets when neither
        // is bound yet (a table scan); a relation with one bound endpoint
        // walks the other side's linked lists; a target no relation reaches
        // is driven by its archetype node. Relation terms between two bound
        // targets become validators. Component constraints on relation-driven
        // targets are enforced through the table caches, which only admit
        // tables whose endpoint archetypes match.
        let mut drivers = Vec::new();
        let mut bound = [false; MAX_TARGETS];
        let mut used = vec![false; related_nodes.len()];
        let bound_mask = |bound: &[bool; MAX_TARGETS]| -> u8 {
            bound
                .iter()
                .enumerate()
                .fold(0u8, |mask, (i, &b)| if b { mask | (1 << i) } else { mask })
        };

        for target in 0..target_count {
            if !bound[target] {
                let relation = related_nodes
                    .iter()
                    .enumerate()
                    .find(|(i, node)| {
                        !used[*i] && (node.from_target == target || node.to_target == target)
                    })
                    .map(|(i, _)| i);
                match relation {
                    Some(i) => {
                        drivers.push(Driver {
                            kind: DriverKind::Related(i),
                            pins_before: bound_mask(&bound),
                        });
                        used[i] = true;
                        bound[related_nodes[i].from_target] = true;
                        bound[related_nodes[i].to_target] = true;
                    }
                    None => {
                        drivers.push(Driver {
                            kind: DriverKind::Archetype(target),
                            pins_before: bound_mask(&bound),
                        });
                        bound[target] = true;
                    }
                }
            }

            loop {
                let mut progressed = false;
                for (i, node) in related_nodes.iter().enumerate() {
                    if used[i] || !(bound[node.from_target] ^ bound[node.to_target]) {
                        continue;
                    }
                    drivers.push(Driver {
                        kind: DriverKind::Related(i),
                        pins_before: bound_mask(&bound),
                    });
                    used[i] = true;
                    bound[node.from_target] = true;
                    bound[node.to_target] = true;
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }
        }
        for (i, _) in related_nodes.iter().enumerate() {
            if !used[i] {
                drivers.push(Driver {
                    kind: DriverKind::Related(i),
                    pins_before: bound_mask(&bound),
                });
            }
        }

        Self {
            target_count,
            archetype_nodes,
            related_nodes,
            drivers,
        }
    }

    pub fn target_count(&self) -> usize {
        self.target_count
    }

    pub(crate) fn related_count(&self) -> usize {
        self.related_nodes.len()
    }

    pub(crate) fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    /// Index of the related node for a resolved relation term.
    pub(crate) fn related_index(&self, ty: DataTypeId, from: usize, to: usize) -> Option<usize> {
        self.related_nodes
            .iter()
            .position(|n| n.data_type == ty && n.from_target == from && n.to_target == to)
    }

    pub(crate) fn set_traversal(&mut self, traversal: Traversal) {
        for node in &mut self.related_nodes {
            node.traversal = traversal;
            node.sort_tables();
        }
    }

    pub(crate) fn set_include_duplicates(&mut self, include: bool) {
        for node in &mut self.related_nodes {
            node.include_duplicates = include;
        }
    }

    /// Refresh the incremental archetype and table caches.
    pub(crate) fn update(&mut self, world: &World) {
        for node in &mut self.archetype_nodes {
            node.update(world);
        }
        for node in &mut self.related_nodes {
            node.update(
                world,
                &self.archetype_nodes[node.from_target],
                &self.archetype_nodes[node.to_target],
            );
        }
    }

    /// Advance to the next match. `started` distinguishes the first call.
    pub(crate) fn advance(
        &self,
        world: &World,
        cursor: &mut QueryCursor,
        ext_pins: u8,
        started: &mut bool,
    ) -> bool {
        let n = self.drivers.len();
        let mut i;
        let mut descending;
        if *started {
            i = n - 1;
            descending = false;
        } else {
            *started = true;
            i = 0;
            descending = true;
        }

        loop {
            let ok = if descending {
                self.driver_first(world, i, cursor, ext_pins)
            } else {
                self.driver_next(world, i, cursor, ext_pins)
            };
            if ok {
                if i + 1 == n {
                    return true;
                }
                i += 1;
                descending = true;
            } else {
                if i == 0 {
                    return false;
                }
                i -= 1;
                descending = false;
            }
        }
    }

    fn driver_first(
        &self,
        world: &World,
        driver: usize,
        cursor: &mut QueryCursor,
        ext_pins: u8,
    ) -> bool {
        let pins = self.drivers[driver].pins_before | ext_pins;
        match self.drivers[driver].kind {
            DriverKind::Archetype(target) => {
                let node = &self.archetype_nodes[target];
                if ext_pins & (1 << target) != 0 {
                    // Validation: the pinned archetype must satisfy the terms.
                    return node.matches(cursor.target_archetypes[target]);
                }
                self.archetype_seek(world, driver, target, cursor, 0, 0)
            }
            DriverKind::Related(node) => {
                let from_pinned = pins & (1 << self.related_nodes[node].from_target) != 0;
                let to_pinned = pins & (1 << self.related_nodes[node].to_target) != 0;
                if from_pinned && to_pinned {
                    self.related_validate(world, node, cursor)
                } else if from_pinned || to_pinned {
                    self.related_one_pinned(world, driver, node, from_pinned, cursor, true)
                } else {
                    self.related_scan(world, driver, node, cursor, true)
                }
            }
        }
    }

    fn driver_next(
        &self,
        world: &World,
        driver: usize,
        cursor: &mut QueryCursor,
        ext_pins: u8,
    ) -> bool {
        let pins = self.drivers[driver].pins_before | ext_pins;
        match self.drivers[driver].kind {
            DriverKind::Archetype(target) => {
                if ext_pins & (1 << target) != 0 {
                    return false;
                }
                let position = cursor.driver_table[driver];
                let row = cursor.target_rows[target] + 1;
                self.archetype_seek(world, driver, target, cursor, position, row)
            }
            DriverKind::Related(node) => {
                let from_pinned = pins & (1 << self.related_nodes[node].from_target) != 0;
                let to_pinned = pins & (1 << self.related_nodes[node].to_target) != 0;
                if from_pinned && to_pinned {
                    false
                } else if from_pinned || to_pinned {
                    self.related_one_pinned(world, driver, node, from_pinned, cursor, false)
                } else {
                    self.related_scan(world, driver, node, cursor, false)
                }
            }
        }
    }

    /// Position the archetype driver at the first row at or after
    /// `(position, row)` with a live table row.
    fn archetype_seek(
        &self,
        world: &World,
        driver: usize,
        target: usize,
        cursor: &mut QueryCursor,
        mut position: usize,
        mut row: usize,
    ) -> bool {
        let node = &self.archetype_nodes[target];
        while position < node.archetypes.len() {
            let archetype = node.archetypes[position];
            if row < world.archetype_table_len(archetype) {
                cursor.driver_table[driver] = position;
                cursor.target_archetypes[target] = archetype;
                cursor.target_rows[target] = row;
                return true;
            }
            position += 1;
            row = 0;
        }
        false
    }

    /// Both endpoints pinned: a direct pair lookup across candidate depths.
    fn related_validate(&self, world: &World, node: usize, cursor: &mut QueryCursor) -> bool {
        let n = &self.related_nodes[node];
        let dense = world.dense();

        let mut from_archetype = cursor.target_archetypes[n.from_target];
        let mut from_index = dense
            .get(from_archetype)
            .expect("pinned target has a table")
            .entity(cursor.target_rows[n.from_target]);
        let mut to_archetype = cursor.target_archetypes[n.to_target];
        let mut to_index = dense
            .get(to_archetype)
            .expect("pinned target has a table")
            .entity(cursor.target_rows[n.to_target]);

        if n.symmetric
            && (from_archetype > to_archetype
                || (from_archetype == to_archetype && from_index > to_index))
        {
            std::mem::swap(&mut from_archetype, &mut to_archetype);
            std::mem::swap(&mut from_index, &mut to_index);
        }

        let registry = world.relations();
        for depth in 0..=registry.max_depth(n.data_type) {
            let id = SparseRelationTableId {
                data_type: n.data_type,
                from: from_archetype,
                to: to_archetype,
                depth,
            };
            if let Some(table_index) = registry.index_of(id) {
                if let Some(row) = registry.table(table_index).row_of(from_index, to_index) {
                    cursor.rel_table[node] = table_index;
                    cursor.rel_row[node] = row;
                    return true;
                }
            }
        }
        false
    }

    /// One endpoint pinned: walk the pinned side's linked lists across the
    /// cached tables, binding the free target from each row.
    fn related_one_pinned(
        &self,
        world: &World,
        driver: usize,
        node: usize,
        from_pinned: bool,
        cursor: &mut QueryCursor,
        first: bool,
    ) -> bool {
        let n = &self.related_nodes[node];
        let registry = world.relations();

        let (pinned_target, unpinned_target) = if from_pinned {
            (n.from_target, n.to_target)
        } else {
            (n.to_target, n.from_target)
        };
        let pinned_archetype = cursor.target_archetypes[pinned_target];
        let pinned_index = world
            .dense()
            .get(pinned_archetype)
            .expect("pinned target has a table")
            .entity(cursor.target_rows[pinned_target]);

        let total = n.total_tables();
        if total == 0 {
            return false;
        }

        // Walking the from list of normal tables matches walking the to list
        // of reverse tables, and vice versa.
        let reset = |position: usize| -> Option<u32> {
            let (id, reverse) = n.table_at(position);
            let table = registry.table(registry.index_of(id)?);
            if from_pinned ^ reverse {
                table.first_from(pinned_index)
            } else {
                table.first_to(pinned_index)
            }
        };
        let advance = |position: usize, row: u32| -> Option<u32> {
            let (id, reverse) = n.table_at(position);
            let table = registry.table(registry.index_of(id).expect("cached table interned"));
            if from_pinned ^ reverse {
                table.next_from(row)
            } else {
                table.next_to(row)
            }
        };
        // A relation from an entity to itself shows up in both directions of
        // the same table; report it only once.
        let skip_identity = |position: usize, row: Option<u32>| -> Option<u32> {
            let row = row?;
            let (id, reverse) = n.table_at(position);
            if reverse && !n.include_duplicates {
                let table = registry.table(registry.index_of(id).expect("cached table interned"));
                let (from, to) = table.indices(row);
                if from == to {
                    return advance(position, row);
                }
            }
            Some(row)
        };

        let mut position;
        let mut row;
        if first {
            position = 0;
            row = skip_identity(position, reset(position));
        } else {
            position = cursor.driver_table[driver];
            row = skip_identity(position, advance(position, cursor.driver_row[driver]));
        }

        while row.is_none() {
            position += 1;
            if position >= total {
                return false;
            }
            row = skip_identity(position, reset(position));
        }
        let row = row.unwrap();

        let (id, reverse) = n.table_at(position);
        let table_index = registry.index_of(id).expect("cached table interned");
        let table = registry.table(table_index);
        let (from_index, to_index) = table.indices(row);
        let (unpinned_archetype, unpinned_index) = if from_pinned ^ reverse {
            (id.to, to_index)
        } else {
            (id.from, from_index)
        };

        cursor.driver_table[driver] = position;
        cursor.driver_row[driver] = row;
        cursor.rel_table[node] = table_index;
        cursor.rel_row[node] = row;
        cursor.target_archetypes[unpinned_target] = unpinned_archetype;
        cursor.target_rows[unpinned_target] = world
            .entities()
            .location_of_index(unpinned_index)
            .expect("relation endpoints are live")
            .row;
        true
    }

    /// No endpoint pinned: scan the cached table list, reverse tables after
    /// the normal ones, skipping duplicate reverse tables.
    fn related_scan(
        &self,
        world: &World,
        driver: usize,
        node: usize,
        cursor: &mut QueryCursor,
        first: bool,
    ) -> bool {
        let n = &self.related_nodes[node];
        let registry = world.relations();
        let total = n.total_tables();

        let table_len = |position: usize| -> usize {
            let (id, _) = n.table_at(position);
            registry
                .index_of(id)
                .map_or(0, |i| registry.table(i).len())
        };

        let mut position;
        let mut row;
        if first {
            position = 0;
            row = 0u32;
        } else {
            position = cursor.driver_table[driver];
            row = cursor.driver_row[driver] + 1;
        }

        while position < n.tables.len() && row as usize >= table_len(position) {
            position += 1;
            row = 0;
        }
        if position >= n.tables.len() {
            while position < total
                && (row as usize >= table_len(position)
                    || (!n.include_duplicates
                        && n.reverse_tables[position - n.tables.len()].duplicate))
            {
                position += 1;
                row = 0;
            }
        }
        if position >= total {
            return false;
        }

        let (id, reverse) = n.table_at(position);
        let table_index = registry.index_of(id).expect("cached table interned");
        let table = registry.table(table_index);
        let (mut from_index, mut to_index) = table.indices(row);
        let (mut from_archetype, mut to_archetype) = (id.from, id.to);
        if reverse {
            std::mem::swap(&mut from_archetype, &mut to_archetype);
            std::mem::swap(&mut from_index, &mut to_index);
        }

        cursor.driver_table[driver] = position;
        cursor.driver_row[driver] = row;
        cursor.rel_table[node] = table_index;
        cursor.rel_row[node] = row;

        let entities = world.entities();
        cursor.target_archetypes[n.from_target] = from_archetype;
        cursor.target_rows[n.from_target] = entities
            .location_of_index(from_index)
            .expect("relation endpoints are live")
            .row;
        cursor.target_archetypes[n.to_target] = to_archetype;
        cursor.target_rows[n.to_target] = entities
            .location_of_index(to_index)
            .expect("relation endpoints are live")
            .row;
        true
    }
}

// ========== Typed fetch layer ==========

/// One argument of a query tuple.
///
/// # Safety
/// `fetch` hands out references derived from raw column pointers; the
/// implementation must only be called with a cursor positioned by the filter
/// the terms were resolved against.
pub unsafe trait QueryArg<'w>: Sized {
    type Item;

    /// Term this argument contributes, with unspecified targets.
    fn term(types: &TypeRegistry) -> QueryTerm;

    /// Fetch the argument's value at the cursor position.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn fetch(
        world: &'w World,
        filter: &QueryFilter,
        cursor: &QueryCursor,
        term: &QueryTerm,
    ) -> Self::Item;
}

/// Marker for arguments that never write through their fetch.
///
/// # Safety
/// Must only be implemented for arguments whose `fetch` hands out shared
/// access.
pub unsafe trait ReadOnlyArg {}

/// Marker for tuples of read-only arguments.
///
/// # Safety
/// See [`ReadOnlyArg`].
pub unsafe trait ReadOnlyArgs {}

fn data_term<T: Component>(types: &TypeRegistry) -> QueryTerm {
    let ty = types.id_of::<T>();
    match types.category(ty) {
        Category::Component => QueryTerm::with(ty, UNSPECIFIED),
        Category::Relation { .. } => QueryTerm::related(ty, UNSPECIFIED, UNSPECIFIED),
        Category::Resource => panic!(
            "resource '{}' cannot be used as a query argument",
            types.info(ty).name()
        ),
    }
}

/// Resolve a fetch pointer for a component or relation term.
///
/// # Safety
/// Cursor must be positioned on a match of the filter.
unsafe fn data_ptr(
    world: &World,
    filter: &QueryFilter,
    cursor: &QueryCursor,
    term: &QueryTerm,
) -> *mut u8 {
    let ty = term.ty.expect("data terms carry a type");
    match term.kind {
        TermKind::Component { target, .. } => {
            let archetype = cursor.target_archetypes[target as usize];
            let row = cursor.target_rows[target as usize];
            let column = world
                .dense()
                .get(archetype)
                .expect("bound target has a table")
                .column(ty)
                .expect("bound archetype has the column");
            column.get(row)
        }
        TermKind::Relation {
            from_target,
            to_target,
        } => {
            let node = filter
                .related_index(ty, from_target as usize, to_target as usize)
                .expect("relation argument has a node");
            world
                .relations()
                .table(cursor.rel_table[node])
                .at(cursor.rel_row[node])
        }
        TermKind::Entity { .. } => unreachable!("entity terms have no data"),
    }
}

unsafe impl<'w, T: Component> QueryArg<'w> for &'w T {
    type Item = &'w T;

    fn term(types: &TypeRegistry) -> QueryTerm {
        data_term::<T>(types)
    }

    unsafe fn fetch(
        world: &'w World,
        filter: &QueryFilter,
        cursor: &QueryCursor,
        term: &QueryTerm,
    ) -> Self::Item {
        &*(data_ptr(world, filter, cursor, term) as *const T)
    }
}

unsafe impl<T: Component> ReadOnlyArg for &T {}

unsafe impl<'w, T: Component> QueryArg<'w> for &'w mut T {
    type Item = &'w mut T;

    fn term(types: &TypeRegistry) -> QueryTerm {
        data_term::<T>(types)
    }

    unsafe fn fetch(
        world: &'w World,
        filter: &QueryFilter,
        cursor: &QueryCursor,
        term: &QueryTerm,
    ) -> Self::Item {
        &mut *(data_ptr(world, filter, cursor, term) as *mut T)
    }
}

unsafe impl<'w, T: Component> QueryArg<'w> for Option<&'w T> {
    type Item = Option<&'w T>;

    fn term(types: &TypeRegistry) -> QueryTerm {
        let ty = types.id_of::<T>();
        assert!(
            types.is_component(ty),
            "optional query arguments must be components, '{}' is not",
            types.info(ty).name()
        );
        QueryTerm::opt(ty, UNSPECIFIED)
    }

    unsafe fn fetch(
        world: &'w World,
        _filter: &QueryFilter,
        cursor: &QueryCursor,
        term: &QueryTerm,
    ) -> Self::Item {
        let ty = term.ty.expect("component terms carry a type");
        let TermKind::Component { target, .. } = term.kind else {
            unreachable!("optional arguments resolve to component terms");
        };
        let archetype = cursor.target_archetypes[target as usize];
        let row = cursor.target_rows[target as usize];
        let column = world
            .dense()
            .get(archetype)
            .expect("bound target has a table")
            .column(ty)?;
        Some(&*(column.get(row) as *const T))
    }
}

unsafe impl<T: Component> ReadOnlyArg for Option<&T> {}

unsafe impl<'w, T: Component> QueryArg<'w> for Option<&'w mut T> {
    type Item = Option<&'w mut T>;

    fn term(types: &TypeRegistry) -> QueryTerm {
        <Option<&T> as QueryArg>::term(types)
    }

    unsafe fn fetch(
        world: &'w World,
        _filter: &QueryFilter,
        cursor: &QueryCursor,
        term: &QueryTerm,
    ) -> Self::Item {
        let ty = term.ty.expect("component terms carry a type");
        let TermKind::Component { target, .. } = term.kind else {
            unreachable!("optional arguments resolve to component terms");
        };
        let archetype = cursor.target_archetypes[target as usize];
        let row = cursor.target_rows[target as usize];
        let column = world
            .dense()
            .get(archetype)
            .expect("bound target has a table")
            .column(ty)?;
        Some(&mut *(column.get(row) as *mut T))
    }
}

unsafe impl<'w> QueryArg<'w> for Entity {
    type Item = Entity;

    fn term(_types: &TypeRegistry) -> QueryTerm {
        QueryTerm::entity(UNSPECIFIED)
    }

    unsafe fn fetch(
        world: &'w World,
        _filter: &QueryFilter,
        cursor: &QueryCursor,
        term: &QueryTerm,
    ) -> Self::Item {
        let TermKind::Entity { target } = term.kind else {
            unreachable!("entity arguments resolve to entity terms");
        };
        let archetype = cursor.target_archetypes[target as usize];
        let row = cursor.target_rows[target as usize];
        let index = world
            .dense()
            .get(archetype)
            .expect("bound target has a table")
            .entity(row);
        world
            .entities()
            .entity_from_index(index)
            .expect("bound rows hold live entities")
    }
}

unsafe impl ReadOnlyArg for Entity {}

/// Tuple of query arguments.
///
/// # Safety
/// See [`QueryArg`].
pub unsafe trait QueryArgs<'w> {
    type Item;

    fn terms(types: &TypeRegistry) -> Vec<QueryTerm>;

    /// # Safety
    /// See [`QueryArg::fetch`].
    unsafe fn fetch(
        world: &'w World,
        filter: &QueryFilter,
        cursor: &QueryCursor,
        terms: &[QueryTerm],
    ) -> Self::Item;
}

macro_rules! impl_query_args {
    ($($T:ident),*) => {
        unsafe impl<'w, $($T: QueryArg<'w>),*> QueryArgs<'w> for ($($T,)*) {
            type Item = ($($T::Item,)*);

            fn terms(types: &TypeRegistry) -> Vec<QueryTerm> {
                vec![$($T::term(types)),*]
            }

            #[allow(unused_assignments)]
            unsafe fn fetch(
                world: &'w World,
                filter: &QueryFilter,
                cursor: &QueryCursor,
                terms: &[QueryTerm],
            ) -> Self::Item {
                let mut i = 0;
                ($(
                    {
                        let item = $T::fetch(world, filter, cursor, &terms[i]);
                        i += 1;
                        item
                    },
                )*)
            }
        }

        unsafe impl<$($T: ReadOnlyArg),*> ReadOnlyArgs for ($($T,)*) {}
    };
}

impl_query_args!(A);
impl_query_args!(A, B);
impl_query_args!(A, B, C);
impl_query_args!(A, B, C, D);
impl_query_args!(A, B, C, D, E);
impl_query_args!(A, B, C, D, E, F);
impl_query_args!(A, B, C, D, E, F, G);
impl_query_args!(A, B, C, D, E, F, G, H);

/// A compiled, iterable query over the world.
pub struct Query<'w, Q: QueryArgs<'w>> {
    world: NonNull<World>,
    filter: QueryFilter,
    arg_terms: Vec<QueryTerm>,
    _marker: PhantomData<(&'w World, fn() -> Q)>,
}

impl<'w, Q: QueryArgs<'w>> Query<'w, Q> {
    pub(crate) fn new(world: NonNull<World>, extra_terms: Vec<QueryTerm>) -> Self {
        let world_ref = unsafe { world.as_ref() };
        let mut arg_terms = Q::terms(world_ref.types());
        let resolved = QueryTerm::resolve(&extra_terms, &mut arg_terms);
        let filter = QueryFilter::new(world_ref, &resolved);
        Self {
            world,
            filter,
            arg_terms,
            _marker: PhantomData,
        }
    }

    /// Visit tree-relation tables in the given depth order.
    pub fn traversal(mut self, traversal: Traversal) -> Self {
        self.filter.set_traversal(traversal);
        self
    }

    /// Report both halves of symmetric matches instead of deduplicating.
    pub fn include_duplicates(mut self) -> Self {
        self.filter.set_include_duplicates(true);
        self
    }

    /// Iterate over all matches.
    pub fn iter(&mut self) -> QueryIter<'_, 'w, Q> {
        let world = unsafe { self.world.as_ref() };
        self.filter.update(world);
        let cursor = QueryCursor::new(self.filter.driver_count(), self.filter.related_count());
        QueryIter {
            query: self,
            cursor,
            ext_pins: 0,
            started: false,
            exhausted: false,
        }
    }

    /// Iterate with one target pinned to a specific entity.
    pub fn iter_pinned(&mut self, target: usize, entity: Entity) -> QueryIter<'_, 'w, Q> {
        assert!(target < self.filter.target_count(), "no such target");
        let world = unsafe { self.world.as_ref() };
        self.filter.update(world);
        let mut cursor = QueryCursor::new(self.filter.driver_count(), self.filter.related_count());

        let mut exhausted = false;
        match world.entities().location(entity) {
            Some(location) => {
                cursor.target_archetypes[target] = location.archetype;
                cursor.target_rows[target] = location.row;
            }
            None => exhausted = true,
        }

        QueryIter {
            query: self,
            cursor,
            ext_pins: 1 << target,
            started: false,
            exhausted,
        }
    }

    /// The match with the primary target pinned to the entity, if any.
    pub fn at(&mut self, entity: Entity) -> Option<Q::Item> {
        self.iter_pinned(0, entity).next()
    }

    pub fn count(&mut self) -> usize {
        self.iter().count()
    }
}

/// Iterator over query matches.
pub struct QueryIter<'q, 'w, Q: QueryArgs<'w>> {
    query: &'q mut Query<'w, Q>,
    cursor: QueryCursor,
    ext_pins: u8,
    started: bool,
    exhausted: bool,
}

impl<'q, 'w, Q: QueryArgs<'w>> Iterator for QueryIter<'q, 'w, Q> {
    type Item = Q::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let world: &'w World = unsafe { &*self.query.world.as_ptr() };
        if !self.query.filter.advance(
            world,
            &mut self.cursor,
            self.ext_pins,
            &mut self.started,
        ) {
            self.exhausted = true;
            return None;
        }
        Some(unsafe { Q::fetch(world, &self.query.filter, &self.cursor, &self.query.arg_terms) })
    }
}
