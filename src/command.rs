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

//! Command buffer for deferred structural mutations
//!
//! Systems must not reshape the world while query iterators are live, so they
//! record their mutations here instead. Entities created through the buffer
//! are addressed by placeholder ids that resolve to the real entities when the
//! buffer is applied at a commit point.

use crate::component::{Bundle, Component};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::world::World;

/// Placeholder for an entity a command buffer will create at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntity(u32);

/// Either a live entity or a placeholder from this buffer.
#[derive(Debug, Clone, Copy)]
pub enum EntityRef {
    Live(Entity),
    Pending(PendingEntity),
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        EntityRef::Live(entity)
    }
}

impl From<PendingEntity> for EntityRef {
    fn from(pending: PendingEntity) -> Self {
        EntityRef::Pending(pending)
    }
}

type SpawnFn = Box<dyn FnOnce(&mut World) -> Entity + Send>;
type EntityFn = Box<dyn FnOnce(&mut World, Entity) + Send>;
type PairFn = Box<dyn FnOnce(&mut World, Entity, Entity) + Send>;
type WorldFn = Box<dyn FnOnce(&mut World) -> Result<()> + Send>;

enum Command {
    Create { spawn: SpawnFn },
    Destroy(EntityRef),
    WithEntity { entity: EntityRef, apply: EntityFn },
    WithPair { from: EntityRef, to: EntityRef, apply: PairFn },
    Custom(WorldFn),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Create { .. } => write!(f, "Create(..)"),
            Command::Destroy(e) => f.debug_tuple("Destroy").field(e).finish(),
            Command::WithEntity { entity, .. } => {
                f.debug_tuple("WithEntity").field(entity).finish()
            }
            Command::WithPair { from, to, .. } => {
                f.debug_tuple("WithPair").field(from).field(to).finish()
            }
            Command::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Records structural mutations and applies them in order at commit points.
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    pending: u32,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entity spawn. The returned placeholder may be used in later
    /// commands of this buffer.
    pub fn create<B: Bundle>(&mut self, bundle: B) -> PendingEntity {
        let placeholder = PendingEntity(self.pending);
        self.pending += 1;
        self.commands.push(Command::Create {
            spawn: Box::new(move |world| world.spawn(bundle)),
        });
        placeholder
    }

    /// Queue an entity destroy.
    pub fn destroy(&mut self, entity: impl Into<EntityRef>) {
        self.commands.push(Command::Destroy(entity.into()));
    }

    /// Queue a component add.
    pub fn add<T: Component>(&mut self, entity: impl Into<EntityRef>, value: T) {
        self.commands.push(Command::WithEntity {
            entity: entity.into(),
            apply: Box::new(move |world, entity| world.add(entity, value)),
        });
    }

    /// Queue a component remove.
    pub fn remove<T: Component>(&mut self, entity: impl Into<EntityRef>) {
        self.commands.push(Command::WithEntity {
            entity: entity.into(),
            apply: Box::new(move |world, entity| {
                world.remove::<T>(entity);
            }),
        });
    }

    /// Queue a relation insert.
    pub fn relate<R: Component>(
        &mut self,
        from: impl Into<EntityRef>,
        to: impl Into<EntityRef>,
        value: R,
    ) {
        self.commands.push(Command::WithPair {
            from: from.into(),
            to: to.into(),
            apply: Box::new(move |world, from, to| world.relate(from, to, value)),
        });
    }

    /// Queue a relation remove.
    pub fn unrelate<R: Component>(&mut self, from: impl Into<EntityRef>, to: impl Into<EntityRef>) {
        self.commands.push(Command::WithPair {
            from: from.into(),
            to: to.into(),
            apply: Box::new(move |world, from, to| {
                world.unrelate::<R>(from, to);
            }),
        });
    }

    /// Queue an arbitrary world mutation, e.g. a resource update.
    pub fn run<F>(&mut self, f: F)
    where
        F: FnOnce(&mut World) -> Result<()> + Send + 'static,
    {
        self.commands.push(Command::Custom(Box::new(f)));
    }

    /// Apply all recorded commands against the world in recorded order,
    /// resolving placeholders, and clear the buffer.
    pub fn apply(&mut self, world: &mut World) -> Result<()> {
        let mut created: Vec<Entity> = Vec::new();
        let resolve = |reference: EntityRef, created: &[Entity]| -> Result<Entity> {
            match reference {
                EntityRef::Live(entity) => Ok(entity),
                EntityRef::Pending(PendingEntity(index)) => {
                    created.get(index as usize).copied().ok_or_else(|| {
                        EcsError::CommandError(format!(
                            "placeholder {index} referenced before its create command ran"
                        ))
                    })
                }
            }
        };

        for command in self.commands.drain(..) {
            match command {
                Command::Create { spawn } => {
                    created.push(spawn(world));
                }
                Command::Destroy(entity) => {
                    world.despawn(resolve(entity, &created)?);
                }
                Command::WithEntity { entity, apply } => {
                    apply(world, resolve(entity, &created)?);
                }
                Command::WithPair { from, to, apply } => {
                    let from = resolve(from, &created)?;
                    let to = resolve(to, &created)?;
                    apply(world, from, to);
                }
                Command::Custom(f) => {
                    f(world)?;
                }
            }
        }
        self.pending = 0;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Drop all recorded commands without applying them.
    pub fn clear(&mut self) {
        self.commands.clear();
        self.pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Health(u32);

    #[test]
    fn test_placeholders_resolve_in_order() {
        let mut world = World::new();
        world.register_component::<Health>();
        world.register_relation::<u32>(false, false);

        let mut buffer = CommandBuffer::new();
        let a = buffer.create((Health(1),));
        let b = buffer.create((Health(2),));
        buffer.relate(a, b, 5u32);
        buffer.add(a, Health(10));

        buffer.apply(&mut world).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(world.entity_count(), 2);

        let mut query = world.query::<(Entity, &u32, Entity)>();
        let matches: Vec<_> = query.iter().collect();
        assert_eq!(matches.len(), 1);
        let (from, value, _to) = matches[0];
        assert_eq!(*value, 5);
        assert_eq!(world.get::<Health>(from), Some(&Health(10)));
    }

    #[test]
    fn test_destroy_live_entity() {
        let mut world = World::new();
        world.register_component::<Health>();
        let e = world.spawn((Health(1),));

        let mut buffer = CommandBuffer::new();
        buffer.destroy(e);
        buffer.apply(&mut world).unwrap();
        assert!(!world.is_alive(e));
    }

    #[test]
    fn test_commands_on_dead_entity_are_noops() {
        let mut world = World::new();
        world.register_component::<Health>();
        let e = world.spawn((Health(1),));
        world.despawn(e);

        let mut buffer = CommandBuffer::new();
        buffer.add(e, Health(2));
        buffer.destroy(e);
        assert_eq!(buffer.len(), 2);
        buffer.apply(&mut world).unwrap();
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn test_clear_discards_commands() {
        let mut world = World::new();
        world.register_component::<Health>();

        let mut buffer = CommandBuffer::new();
        buffer.create((Health(1),));
        buffer.clear();
        buffer.apply(&mut world).unwrap();
        assert_eq!(world.entity_count(), 0);
    }
}
