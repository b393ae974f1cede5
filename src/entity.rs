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

//! Entity identifiers and location metadata.

use crate::archetype::ArchetypeId;

/// Stable entity identity: a dense slot index plus a generation counter.
///
/// The generation is bumped every time the slot is freed, so a held id of a
/// destroyed entity fails liveness checks instead of aliasing its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    pub index: u32,
    pub generation: u32,
}

impl Entity {
    /// Sentinel id that never refers to a live entity.
    pub const DANGLING: Entity = Entity {
        index: u32::MAX,
        generation: u32::MAX,
    };

    pub fn is_dangling(self) -> bool {
        self == Self::DANGLING
    }
}

/// Entity location in archetype storage (archetype, row)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub row: usize,
}

impl EntityLocation {
    pub(crate) const PLACEHOLDER: EntityLocation = EntityLocation {
        archetype: ArchetypeId::EMPTY,
        row: usize::MAX,
    };
}

struct Slot {
    generation: u32,
    location: EntityLocation,
    alive: bool,
}

/// Allocates entity indices, tracks liveness and the archetype row each live
/// entity currently occupies. Freed indices are recycled through a free list.
#[derive(Default)]
pub struct EntityManager {
    slots: Vec<Slot>,
    free: Vec<u32>,
    alive: usize,
}

impl EntityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new entity. The location starts as a placeholder in the
    /// empty archetype; the world assigns the real row right after.
    pub fn create(&mut self) -> Entity {
        self.alive += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.alive = true;
            slot.location = EntityLocation::PLACEHOLDER;
            return Entity {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        assert!(index != u32::MAX, "entity index space exhausted");
        self.slots.push(Slot {
            generation: 0,
            location: EntityLocation::PLACEHOLDER,
            alive: true,
        });
        Entity {
            index,
            generation: 0,
        }
    }

    /// Free the entity's slot. Returns false if the id was already stale.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }

        let slot = &mut self.slots[entity.index as usize];
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(entity.index);
        self.alive -= 1;
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.index as usize)
            .map(|slot| slot.alive && slot.generation == entity.generation)
            .unwrap_or(false)
    }

    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        if self.is_alive(entity) {
            Some(self.slots[entity.index as usize].location)
        } else {
            None
        }
    }

    /// Location of a live entity addressed by raw index, as stored in tables.
    pub fn location_of_index(&self, index: u32) -> Option<EntityLocation> {
        let slot = self.slots.get(index as usize)?;
        if slot.alive {
            Some(slot.location)
        } else {
            None
        }
    }

    /// Reconstruct a full id from a raw index stored in a table row.
    pub fn entity_from_index(&self, index: u32) -> Option<Entity> {
        let slot = self.slots.get(index as usize)?;
        if slot.alive {
            Some(Entity {
                index,
                generation: slot.generation,
            })
        } else {
            None
        }
    }

    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) {
        debug_assert!(self.is_alive(entity));
        self.slots[entity.index as usize].location = location;
    }

    /// Update the row of a live entity addressed by raw index, used after a
    /// swap-remove moved its table row.
    pub fn set_location_of_index(&mut self, index: u32, location: EntityLocation) {
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.alive);
        slot.location = location;
    }

    pub fn len(&self) -> usize {
        self.alive
    }

    pub fn is_empty(&self) -> bool {
        self.alive == 0
    }

    /// Iterate over all live entities in slot order.
    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.alive.then_some(Entity {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_live_until_destroy() {
        let mut entities = EntityManager::new();
        let e = entities.create();
        assert!(entities.is_alive(e));

        assert!(entities.destroy(e));
        assert!(!entities.is_alive(e));
        assert!(!entities.destroy(e));
    }

    #[test]
    fn test_index_reuse_bumps_generation() {
        let mut entities = EntityManager::new();
        let a = entities.create();
        entities.destroy(a);

        let b = entities.create();
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(!entities.is_alive(a));
        assert!(entities.is_alive(b));
    }

    #[test]
    fn test_location_round_trip() {
        let mut entities = EntityManager::new();
        let e = entities.create();
        let loc = EntityLocation {
            archetype: ArchetypeId(3),
            row: 7,
        };
        entities.set_location(e, loc);
        assert_eq!(entities.location(e), Some(loc));
        assert_eq!(entities.location_of_index(e.index), Some(loc));
        assert_eq!(entities.entity_from_index(e.index), Some(e));
    }

    #[test]
    fn test_iter_skips_dead() {
        let mut entities = EntityManager::new();
        let a = entities.create();
        let b = entities.create();
        let c = entities.create();
        entities.destroy(b);

        let live: Vec<_> = entities.iter().collect();
        assert_eq!(live, vec![a, c]);
        assert_eq!(entities.len(), 2);
    }
}
