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

//! Archetype interning and transition caching
//!
//! An archetype names a canonical set of component type ids. The graph interns
//! each distinct set once and caches single-component add/remove transitions,
//! which are the hot path of structural mutation.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::types::DataTypeId;

/// Identifies an interned archetype. Archetypes are never destroyed, so ids
/// stay valid for the lifetime of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub u32);

impl ArchetypeId {
    /// The archetype of entities with no components, always interned first.
    pub const EMPTY: ArchetypeId = ArchetypeId(0);
}

/// Canonical component set: sorted, deduplicated type ids.
pub type Signature = SmallVec<[DataTypeId; 8]>;

/// Interns component sets and caches add/remove transitions between them.
pub struct ArchetypeGraph {
    signatures: Vec<Signature>,
    index: AHashMap<Signature, ArchetypeId>,
    transitions: AHashMap<(ArchetypeId, DataTypeId, bool), ArchetypeId>,
}

impl ArchetypeGraph {
    pub fn new() -> Self {
        let mut graph = Self {
            signatures: Vec::with_capacity(64),
            index: AHashMap::with_capacity(64),
            transitions: AHashMap::with_capacity(128),
        };
        let empty = graph.intern(&[]);
        debug_assert_eq!(empty, ArchetypeId::EMPTY);
        graph
    }

    /// Intern the archetype for the given component set. The input does not
    /// need to be sorted; `(A, B)` and `(B, A)` map to the same archetype.
    pub fn intern(&mut self, components: &[DataTypeId]) -> ArchetypeId {
        let mut signature: Signature = SmallVec::from_slice(components);
        signature.sort();
        signature.dedup();

        if let Some(&id) = self.index.get(&signature) {
            return id;
        }

        let id = ArchetypeId(self.signatures.len() as u32);
        self.signatures.push(signature.clone());
        self.index.insert(signature, id);
        tracing::trace!(archetype = id.0, "interned archetype");
        id
    }

    /// Archetype obtained by adding one component. Cached after first use.
    pub fn with_component(&mut self, archetype: ArchetypeId, ty: DataTypeId) -> ArchetypeId {
        if let Some(&id) = self.transitions.get(&(archetype, ty, true)) {
            return id;
        }

        let mut signature = self.signatures[archetype.0 as usize].clone();
        if let Err(pos) = signature.binary_search(&ty) {
            signature.insert(pos, ty);
        }
        let id = self.intern(&signature);
        self.transitions.insert((archetype, ty, true), id);
        id
    }

    /// Archetype obtained by removing one component. Cached after first use.
    pub fn without_component(&mut self, archetype: ArchetypeId, ty: DataTypeId) -> ArchetypeId {
        if let Some(&id) = self.transitions.get(&(archetype, ty, false)) {
            return id;
        }

        let mut signature = self.signatures[archetype.0 as usize].clone();
        if let Ok(pos) = signature.binary_search(&ty) {
            signature.remove(pos);
        }
        let id = self.intern(&signature);
        self.transitions.insert((archetype, ty, false), id);
        id
    }

    pub fn signature(&self, archetype: ArchetypeId) -> &[DataTypeId] {
        &self.signatures[archetype.0 as usize]
    }

    pub fn contains(&self, archetype: ArchetypeId, ty: DataTypeId) -> bool {
        self.signatures[archetype.0 as usize].binary_search(&ty).is_ok()
    }

    /// Number of interned archetypes. Only ever grows, so this doubles as a
    /// revision counter for incremental query caches.
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

impl Default for ArchetypeGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_archetype_is_first() {
        let graph = ArchetypeGraph::new();
        assert_eq!(graph.len(), 1);
        assert!(graph.signature(ArchetypeId::EMPTY).is_empty());
    }

    #[test]
    fn test_intern_is_order_insensitive() {
        let mut graph = ArchetypeGraph::new();
        let a = DataTypeId(0);
        let b = DataTypeId(1);

        let ab = graph.intern(&[a, b]);
        let ba = graph.intern(&[b, a]);
        assert_eq!(ab, ba);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_transitions_round_trip() {
        let mut graph = ArchetypeGraph::new();
        let a = DataTypeId(0);
        let b = DataTypeId(1);

        let with_a = graph.with_component(ArchetypeId::EMPTY, a);
        let with_ab = graph.with_component(with_a, b);
        assert!(graph.contains(with_ab, a));
        assert!(graph.contains(with_ab, b));

        let back = graph.without_component(with_ab, b);
        assert_eq!(back, with_a);

        // Transitions hit the cache on the second call.
        assert_eq!(graph.with_component(with_a, b), with_ab);
    }

    #[test]
    fn test_remove_missing_component_is_identity() {
        let mut graph = ArchetypeGraph::new();
        let a = DataTypeId(0);
        let with_a = graph.with_component(ArchetypeId::EMPTY, a);
        assert_eq!(graph.without_component(with_a, DataTypeId(9)), with_a);
    }
}
