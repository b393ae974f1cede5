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

//! Dense archetype tables
//!
//! One table per archetype: an entity-index column plus one [`AnyVec`] per
//! component in the archetype's signature. Row `r` of every column belongs to
//! the same entity. Swap-remove is the only deletion primitive, so iteration
//! order is unstable across mutations.

use rustc_hash::FxHashMap;

use crate::archetype::{ArchetypeGraph, ArchetypeId};
use crate::column::AnyVec;
use crate::types::{DataTypeId, TypeRegistry};

/// Column storage for a single archetype.
pub struct DenseTable {
    entities: Vec<u32>,
    columns: Vec<AnyVec>,
    column_index: FxHashMap<DataTypeId, usize>,
}

impl DenseTable {
    pub fn new(signature: &[DataTypeId], types: &TypeRegistry) -> Self {
        let mut columns = Vec::with_capacity(signature.len());
        let mut column_index = FxHashMap::default();
        for (i, &ty) in signature.iter().enumerate() {
            columns.push(AnyVec::new(ty, types.info(ty)));
            column_index.insert(ty, i);
        }
        Self {
            entities: Vec::new(),
            columns,
            column_index,
        }
    }

    /// Append a row for the entity. Every column must receive exactly one
    /// value push before the table is used again; the world upholds this
    /// within each structural operation.
    pub fn push_entity(&mut self, entity_index: u32) -> usize {
        let row = self.entities.len();
        self.entities.push(entity_index);
        row
    }

    /// Drop the row's values and swap the last row into its slot. Returns the
    /// entity index that moved into `row`, if any, so the caller can fix its
    /// location.
    pub fn swap_remove(&mut self, row: usize) -> Option<u32> {
        for column in &mut self.columns {
            column.swap_remove_drop(row);
        }
        self.entities.swap_remove(row);
        self.entities.get(row).copied()
    }

    /// Move the row into `dest`: shared columns move their value, columns only
    /// present here drop theirs, columns only present in `dest` are left for
    /// the caller to initialize. Returns the destination row and the entity
    /// index swapped into the vacated source row, if any.
    pub fn move_row_to(&mut self, row: usize, dest: &mut DenseTable) -> (usize, Option<u32>) {
        let entity_index = self.entities[row];
        let new_row = dest.push_entity(entity_index);

        for column in &mut self.columns {
            let ty = column.element_type();
            match dest.column_index.get(&ty) {
                Some(&dest_idx) => unsafe {
                    let dst = dest.columns[dest_idx].push_uninit();
                    column.swap_remove_into(row, dst);
                },
                None => column.swap_remove_drop(row),
            }
        }

        self.entities.swap_remove(row);
        (new_row, self.entities.get(row).copied())
    }

    pub fn column(&self, ty: DataTypeId) -> Option<&AnyVec> {
        self.column_index.get(&ty).map(|&i| &self.columns[i])
    }

    pub fn column_mut(&mut self, ty: DataTypeId) -> Option<&mut AnyVec> {
        match self.column_index.get(&ty) {
            Some(&i) => Some(&mut self.columns[i]),
            None => None,
        }
    }

    pub fn has_column(&self, ty: DataTypeId) -> bool {
        self.column_index.contains_key(&ty)
    }

    /// Entity index stored at the given row.
    pub fn entity(&self, row: usize) -> u32 {
        self.entities[row]
    }

    pub fn entities(&self) -> &[u32] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Holds the dense table of every archetype, created lazily the first time an
/// entity enters the archetype.
#[derive(Default)]
pub struct DenseTableRegistry {
    tables: Vec<Option<DenseTable>>,
}

impl DenseTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table for the archetype, creating it if needed.
    pub fn ensure(
        &mut self,
        archetype: ArchetypeId,
        graph: &ArchetypeGraph,
        types: &TypeRegistry,
    ) -> &mut DenseTable {
        let index = archetype.0 as usize;
        if index >= self.tables.len() {
            self.tables.resize_with(index + 1, || None);
        }
        self.tables[index]
            .get_or_insert_with(|| DenseTable::new(graph.signature(archetype), types))
    }

    pub fn get(&self, archetype: ArchetypeId) -> Option<&DenseTable> {
        self.tables.get(archetype.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, archetype: ArchetypeId) -> Option<&mut DenseTable> {
        self.tables.get_mut(archetype.0 as usize)?.as_mut()
    }

    pub fn contains(&self, archetype: ArchetypeId) -> bool {
        self.get(archetype).is_some()
    }

    /// Disjoint mutable access to two different tables, used for migration.
    ///
    /// # Panics
    /// Panics if the ids are equal or either table does not exist.
    pub fn pair_mut(
        &mut self,
        a: ArchetypeId,
        b: ArchetypeId,
    ) -> (&mut DenseTable, &mut DenseTable) {
        assert_ne!(a, b, "cannot split-borrow the same table");
        let (ai, bi) = (a.0 as usize, b.0 as usize);
        if ai < bi {
            let (left, right) = self.tables.split_at_mut(bi);
            (
                left[ai].as_mut().expect("source table missing"),
                right[0].as_mut().expect("destination table missing"),
            )
        } else {
            let (left, right) = self.tables.split_at_mut(ai);
            (
                right[0].as_mut().expect("source table missing"),
                left[bi].as_mut().expect("destination table missing"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeRegistry;

    fn setup() -> (TypeRegistry, DataTypeId, DataTypeId) {
        let mut types = TypeRegistry::new();
        let a = types.register_component::<u64>();
        let b = types.register_component::<i32>();
        (types, a, b)
    }

    unsafe fn push<T>(table: &mut DenseTable, ty: DataTypeId, value: T) {
        let dst = table.column_mut(ty).unwrap().push_uninit();
        std::ptr::write(dst as *mut T, value);
    }

    unsafe fn read<T: Copy>(table: &DenseTable, ty: DataTypeId, row: usize) -> T {
        *(table.column(ty).unwrap().get(row) as *const T)
    }

    #[test]
    fn test_push_and_swap_remove() {
        let (types, a, _) = setup();
        let mut table = DenseTable::new(&[a], &types);

        for (entity, value) in [(10u32, 100u64), (11, 101), (12, 102)] {
            table.push_entity(entity);
            unsafe { push(&mut table, a, value) };
        }

        // Removing the first row swaps the last one in.
        let swapped = table.swap_remove(0);
        assert_eq!(swapped, Some(12));
        assert_eq!(table.len(), 2);
        assert_eq!(table.entity(0), 12);
        unsafe {
            assert_eq!(read::<u64>(&table, a, 0), 102);
        }
    }

    #[test]
    fn test_move_row_shares_and_drops() {
        let (types, a, b) = setup();
        let mut src = DenseTable::new(&[a, b], &types);
        let mut dst = DenseTable::new(&[a], &types);

        src.push_entity(7);
        unsafe {
            push(&mut src, a, 40u64);
            push(&mut src, b, -1i32);
        }

        let (new_row, swapped) = src.move_row_to(0, &mut dst);
        assert_eq!(new_row, 0);
        assert_eq!(swapped, None);
        assert!(src.is_empty());
        assert_eq!(dst.entity(0), 7);
        unsafe {
            assert_eq!(read::<u64>(&dst, a, 0), 40);
        }
    }

    #[test]
    fn test_registry_lazy_creation() {
        let (types, a, _) = setup();
        let mut graph = ArchetypeGraph::new();
        let arch = graph.intern(&[a]);

        let mut tables = DenseTableRegistry::new();
        assert!(!tables.contains(arch));
        tables.ensure(arch, &graph, &types);
        assert!(tables.contains(arch));
        assert!(tables.get(arch).unwrap().is_empty());
    }
}
