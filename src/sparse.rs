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

//! Sparse relation tables
//!
//! A table stores every instance of one relation type between entities of one
//! `(from archetype, to archetype)` pair. Each row keeps the two entity
//! indices, the payload, and two intrusive linked-list links so that "all rows
//! with this from index" and "all rows with this to index" enumerate in O(k)
//! without scanning the table. A pair map gives O(1) existence tests.
//!
//! Tree-like relation types additionally partition their tables by the depth
//! of the from entity, which lets queries traverse the forest in depth order.

use ahash::AHashMap;

use crate::archetype::ArchetypeId;
use crate::column::AnyVec;
use crate::types::{DataTypeId, TypeRegistry};

const NIL: u32 = u32::MAX;

/// Packs the two entity indices into the pair-map key.
fn pair_id(from: u32, to: u32) -> u64 {
    (from as u64) | ((to as u64) << 32)
}

fn nil_to_opt(value: u32) -> Option<u32> {
    (value != NIL).then_some(value)
}

/// Identifies one sparse relation table within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SparseRelationTableId {
    pub data_type: DataTypeId,
    pub from: ArchetypeId,
    pub to: ArchetypeId,
    /// Depth of the from entity; always 0 for non-tree relations.
    pub depth: u32,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
}

#[derive(Debug, Clone, Copy)]
struct List {
    first: u32,
    last: u32,
}

#[derive(Debug, Clone, Copy)]
struct RowMeta {
    from: u32,
    to: u32,
    from_link: Link,
    to_link: Link,
}

/// Stores relations between entities of a fixed archetype pair.
pub struct SparseRelationTable {
    relations: AnyVec,
    rows: Vec<RowMeta>,
    from_rows: AHashMap<u32, List>,
    to_rows: AHashMap<u32, List>,
    pair_rows: AHashMap<u64, u32>,
}

impl SparseRelationTable {
    pub fn new(data_type: DataTypeId, types: &TypeRegistry) -> Self {
        Self {
            relations: AnyVec::new(data_type, types.info(data_type)),
            rows: Vec::new(),
            from_rows: AHashMap::new(),
            to_rows: AHashMap::new(),
            pair_rows: AHashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Add a relation between the given indices, overwriting any existing one.
    /// Returns whether the relation already existed.
    ///
    /// # Safety
    /// `src` must point to a valid value of the relation type; ownership is
    /// transferred.
    pub unsafe fn insert(&mut self, from: u32, to: u32, src: *const u8) -> bool {
        let pair = pair_id(from, to);
        if let Some(&row) = self.pair_rows.get(&pair) {
            self.relations.replace_from(row as usize, src);
            return true;
        }

        let index = self.rows.len() as u32;
        self.rows.push(RowMeta {
            from,
            to,
            from_link: Link { prev: NIL, next: NIL },
            to_link: Link { prev: NIL, next: NIL },
        });
        self.relations.push_from(src);
        self.pair_rows.insert(pair, index);
        self.append_link(index);
        false
    }

    /// Remove the relation between the given indices, if any.
    pub fn erase(&mut self, from: u32, to: u32) -> bool {
        self.erase_impl(from, to, true)
    }

    /// Remove the row without dropping its value; the caller moved it out.
    pub(crate) fn erase_forget(&mut self, from: u32, to: u32) -> bool {
        self.erase_impl(from, to, false)
    }

    fn erase_impl(&mut self, from: u32, to: u32, drop_value: bool) -> bool {
        let Some(index) = self.pair_rows.remove(&pair_id(from, to)) else {
            return false;
        };

        self.erase_link(index);

        if drop_value {
            self.relations.swap_remove_drop(index as usize);
        } else {
            // The caller moved the value out already.
            unsafe { self.relations.swap_remove_forget(index as usize) };
        }
        self.rows.swap_remove(index as usize);

        // If another row was swapped into the erased slot, re-stitch its pair
        // map entry and both of its linked lists.
        if (index as usize) < self.rows.len() {
            let moved = self.rows[index as usize];
            self.pair_rows.insert(pair_id(moved.from, moved.to), index);
            self.update_link(index);
        }

        true
    }

    /// Remove all relations with the given from index. Returns the count.
    pub fn erase_from(&mut self, from: u32) -> usize {
        let mut count = 0;
        while let Some(list) = self.from_rows.get(&from).copied() {
            let row = self.rows[list.first as usize];
            self.erase(row.from, row.to);
            count += 1;
        }
        count
    }

    /// Remove all relations with the given to index. Returns the count.
    pub fn erase_to(&mut self, to: u32) -> usize {
        let mut count = 0;
        while let Some(list) = self.to_rows.get(&to).copied() {
            let row = self.rows[list.first as usize];
            self.erase(row.from, row.to);
            count += 1;
        }
        count
    }

    /// Move all relations with the given from index into another table of the
    /// same relation type. Returns the count.
    pub fn move_from(&mut self, from: u32, other: &mut SparseRelationTable) -> usize {
        let mut count = 0;
        while let Some(list) = self.from_rows.get(&from).copied() {
            let row = self.rows[list.first as usize];
            unsafe {
                let value = self.relations.get(list.first as usize);
                other.insert(row.from, row.to, value);
            }
            self.erase_impl(row.from, row.to, false);
            count += 1;
        }
        count
    }

    /// Move all relations with the given to index into another table of the
    /// same relation type. Returns the count.
    pub fn move_to(&mut self, to: u32, other: &mut SparseRelationTable) -> usize {
        let mut count = 0;
        while let Some(list) = self.to_rows.get(&to).copied() {
            let row = self.rows[list.first as usize];
            unsafe {
                let value = self.relations.get(list.first as usize);
                other.insert(row.from, row.to, value);
            }
            self.erase_impl(row.from, row.to, false);
            count += 1;
        }
        count
    }

    pub fn contains(&self, from: u32, to: u32) -> bool {
        self.pair_rows.contains_key(&pair_id(from, to))
    }

    /// Row of the relation between the given indices, if present.
    pub fn row_of(&self, from: u32, to: u32) -> Option<u32> {
        self.pair_rows.get(&pair_id(from, to)).copied()
    }

    /// Pointer to the relation payload at the given row.
    ///
    /// # Safety
    /// `row` must be in bounds; aliasing discipline is the caller's.
    pub unsafe fn at(&self, row: u32) -> *mut u8 {
        self.relations.get(row as usize)
    }

    /// Entity indices stored at the given row.
    pub fn indices(&self, row: u32) -> (u32, u32) {
        let meta = self.rows[row as usize];
        (meta.from, meta.to)
    }

    pub fn first_from(&self, index: u32) -> Option<u32> {
        self.from_rows.get(&index).map(|list| list.first)
    }

    pub fn first_to(&self, index: u32) -> Option<u32> {
        self.to_rows.get(&index).map(|list| list.first)
    }

    pub fn next_from(&self, row: u32) -> Option<u32> {
        nil_to_opt(self.rows[row as usize].from_link.next)
    }

    pub fn next_to(&self, row: u32) -> Option<u32> {
        nil_to_opt(self.rows[row as usize].to_link.next)
    }

    /// Rows with the given from index, in list order.
    pub fn view_from(&self, index: u32) -> RelationView<'_> {
        RelationView {
            table: self,
            row: self.first_from(index),
            is_from: true,
        }
    }

    /// Rows with the given to index, in list order.
    pub fn view_to(&self, index: u32) -> RelationView<'_> {
        RelationView {
            table: self,
            row: self.first_to(index),
            is_from: false,
        }
    }

    /// All rows of the table.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        0..self.rows.len() as u32
    }

    /// Append the row to the end of both linked lists.
    fn append_link(&mut self, index: u32) {
        let (from, to) = {
            let row = self.rows[index as usize];
            (row.from, row.to)
        };

        match self.from_rows.get_mut(&from) {
            Some(list) => {
                self.rows[index as usize].from_link.prev = list.last;
                self.rows[list.last as usize].from_link.next = index;
                list.last = index;
            }
            None => {
                self.from_rows.insert(from, List { first: index, last: index });
            }
        }

        match self.to_rows.get_mut(&to) {
            Some(list) => {
                self.rows[index as usize].to_link.prev = list.last;
                self.rows[list.last as usize].to_link.next = index;
                list.last = index;
            }
            None => {
                self.to_rows.insert(to, List { first: index, last: index });
            }
        }
    }

    /// Unlink the row from both lists, dropping the head entries when a list
    /// empties.
    fn erase_link(&mut self, index: u32) {
        let row = self.rows[index as usize];

        if row.from_link.prev == NIL {
            self.from_rows.get_mut(&row.from).unwrap().first = row.from_link.next;
        } else {
            self.rows[row.from_link.prev as usize].from_link.next = row.from_link.next;
        }
        if row.from_link.next == NIL {
            self.from_rows.get_mut(&row.from).unwrap().last = row.from_link.prev;
        } else {
            self.rows[row.from_link.next as usize].from_link.prev = row.from_link.prev;
        }
        if self.from_rows[&row.from].first == NIL {
            self.from_rows.remove(&row.from);
        }

        if row.to_link.prev == NIL {
            self.to_rows.get_mut(&row.to).unwrap().first = row.to_link.next;
        } else {
            self.rows[row.to_link.prev as usize].to_link.next = row.to_link.next;
        }
        if row.to_link.next == NIL {
            self.to_rows.get_mut(&row.to).unwrap().last = row.to_link.prev;
        } else {
            self.rows[row.to_link.next as usize].to_link.prev = row.to_link.prev;
        }
        if self.to_rows[&row.to].first == NIL {
            self.to_rows.remove(&row.to);
        }
    }

    /// Make the neighbours and head entries of a row that changed index point
    /// at it again.
    fn update_link(&mut self, index: u32) {
        let row = self.rows[index as usize];

        if row.from_link.prev == NIL {
            self.from_rows.get_mut(&row.from).unwrap().first = index;
        } else {
            self.rows[row.from_link.prev as usize].from_link.next = index;
        }
        if row.from_link.next == NIL {
            self.from_rows.get_mut(&row.from).unwrap().last = index;
        } else {
            self.rows[row.from_link.next as usize].from_link.prev = index;
        }

        if row.to_link.prev == NIL {
            self.to_rows.get_mut(&row.to).unwrap().first = index;
        } else {
            self.rows[row.to_link.prev as usize].to_link.next = index;
        }
        if row.to_link.next == NIL {
            self.to_rows.get_mut(&row.to).unwrap().last = index;
        } else {
            self.rows[row.to_link.next as usize].to_link.prev = index;
        }
    }
}

/// Iterator over the rows of one side's linked list.
pub struct RelationView<'a> {
    table: &'a SparseRelationTable,
    row: Option<u32>,
    is_from: bool,
}

impl Iterator for RelationView<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let row = self.row?;
        self.row = if self.is_from {
            self.table.next_from(row)
        } else {
            self.table.next_to(row)
        };
        Some(row)
    }
}

/// All sparse relation tables of a world, interned by table id.
///
/// The table list only grows, so its length doubles as a revision counter for
/// the incremental caches kept by query nodes.
#[derive(Default)]
pub struct SparseRelationRegistry {
    tables: Vec<SparseRelationTable>,
    ids: Vec<SparseRelationTableId>,
    index: AHashMap<SparseRelationTableId, usize>,
    max_depth: AHashMap<DataTypeId, u32>,
}

impl SparseRelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the table with the given id, creating it if needed.
    pub fn ensure(&mut self, id: SparseRelationTableId, types: &TypeRegistry) -> usize {
        if let Some(&index) = self.index.get(&id) {
            return index;
        }

        let index = self.tables.len();
        self.tables.push(SparseRelationTable::new(id.data_type, types));
        self.ids.push(id);
        self.index.insert(id, index);

        let depth = self.max_depth.entry(id.data_type).or_insert(0);
        *depth = (*depth).max(id.depth);
        index
    }

    pub fn index_of(&self, id: SparseRelationTableId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn table(&self, index: usize) -> &SparseRelationTable {
        &self.tables[index]
    }

    pub fn table_mut(&mut self, index: usize) -> &mut SparseRelationTable {
        &mut self.tables[index]
    }

    pub fn id(&self, index: usize) -> SparseRelationTableId {
        self.ids[index]
    }

    pub fn ids(&self) -> &[SparseRelationTableId] {
        &self.ids
    }

    /// Number of tables; grows monotonically.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Largest depth any table of this relation type was created with.
    pub fn max_depth(&self, data_type: DataTypeId) -> u32 {
        self.max_depth.get(&data_type).copied().unwrap_or(0)
    }

    /// Disjoint mutable access to two different tables.
    ///
    /// # Panics
    /// Panics if the indices are equal.
    pub fn pair_mut(
        &mut self,
        a: usize,
        b: usize,
    ) -> (&mut SparseRelationTable, &mut SparseRelationTable) {
        assert_ne!(a, b, "cannot split-borrow the same relation table");
        if a < b {
            let (left, right) = self.tables.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = self.tables.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (TypeRegistry, SparseRelationTable) {
        let mut types = TypeRegistry::new();
        let ty = types.register_relation::<u64>(false, false);
        let table = SparseRelationTable::new(ty, &types);
        (types, table)
    }

    unsafe fn insert_value(table: &mut SparseRelationTable, from: u32, to: u32, value: u64) -> bool {
        let existed = table.insert(from, to, &value as *const u64 as *const u8);
        std::mem::forget(value);
        existed
    }

    unsafe fn value_at(table: &SparseRelationTable, from: u32, to: u32) -> u64 {
        let row = table.row_of(from, to).unwrap();
        *(table.at(row) as *const u64)
    }

    #[test]
    fn test_insert_contains_erase() {
        let (_types, mut table) = setup();
        unsafe {
            assert!(!insert_value(&mut table, 1, 2, 100));
            assert!(table.contains(1, 2));
            assert_eq!(value_at(&table, 1, 2), 100);

            // Overwrite keeps a single row.
            assert!(insert_value(&mut table, 1, 2, 200));
            assert_eq!(table.len(), 1);
            assert_eq!(value_at(&table, 1, 2), 200);
        }

        assert!(table.erase(1, 2));
        assert!(!table.contains(1, 2));
        assert!(!table.erase(1, 2));
    }

    #[test]
    fn test_view_from_walks_the_list() {
        let (_types, mut table) = setup();
        unsafe {
            insert_value(&mut table, 1, 10, 0);
            insert_value(&mut table, 2, 20, 0);
            insert_value(&mut table, 1, 11, 0);
            insert_value(&mut table, 1, 12, 0);
        }

        let tos: Vec<u32> = table.view_from(1).map(|row| table.indices(row).1).collect();
        assert_eq!(tos, vec![10, 11, 12]);

        let froms: Vec<u32> = table.view_to(20).map(|row| table.indices(row).0).collect();
        assert_eq!(froms, vec![2]);
    }

    #[test]
    fn test_erase_restitches_swapped_row() {
        let (_types, mut table) = setup();
        unsafe {
            insert_value(&mut table, 1, 10, 0);
            insert_value(&mut table, 1, 11, 0);
            insert_value(&mut table, 1, 12, 0);
        }

        // Erasing the first row moves the last row into slot 0; the from-list
        // must still enumerate the remaining relations exactly once.
        assert!(table.erase(1, 10));
        let mut tos: Vec<u32> = table.view_from(1).map(|row| table.indices(row).1).collect();
        tos.sort_unstable();
        assert_eq!(tos, vec![11, 12]);
        assert_eq!(table.row_of(1, 12), Some(0));
    }

    #[test]
    fn test_erase_from_and_to() {
        let (_types, mut table) = setup();
        unsafe {
            insert_value(&mut table, 1, 10, 0);
            insert_value(&mut table, 1, 11, 0);
            insert_value(&mut table, 2, 10, 0);
        }

        assert_eq!(table.erase_from(1), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.erase_to(10), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_move_from_preserves_values() {
        let (types, mut table) = setup();
        let ty = table.relations.element_type();
        let mut other = SparseRelationTable::new(ty, &types);
        unsafe {
            insert_value(&mut table, 1, 10, 111);
            insert_value(&mut table, 1, 11, 222);
            insert_value(&mut table, 2, 10, 333);

            assert_eq!(table.move_from(1, &mut other), 2);
            assert_eq!(table.len(), 1);
            assert_eq!(other.len(), 2);
            assert_eq!(value_at(&other, 1, 10), 111);
            assert_eq!(value_at(&other, 1, 11), 222);
            assert_eq!(value_at(&table, 2, 10), 333);
        }
    }

    #[test]
    fn test_registry_interns_and_tracks_depth() {
        let mut types = TypeRegistry::new();
        let ty = types.register_relation::<u8>(false, true);
        let mut registry = SparseRelationRegistry::new();

        let id = SparseRelationTableId {
            data_type: ty,
            from: ArchetypeId(1),
            to: ArchetypeId(2),
            depth: 3,
        };
        let a = registry.ensure(id, &types);
        let b = registry.ensure(id, &types);
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.max_depth(ty), 3);
    }
}
