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

//! Systems, conditions and access signatures
//!
//! A system is an opaque callable the scheduler invokes with a typed context.
//! Its declared access signature names the columns it reads and writes; the
//! signature does not gate what the body can do, but it is what any parallel
//! dispatcher would use to prove two systems conflict-free, and ordering
//! edges exist precisely to resolve the conflicts it reveals.

use std::ptr::NonNull;

use crate::command::CommandBuffer;
use crate::error::Result;
use crate::query::{Query, QueryArgs};
use crate::term::QueryTerm;
use crate::types::DataTypeId;
use crate::world::World;

/// Declared data requirements of a system.
#[derive(Debug, Clone, Default)]
pub struct SystemAccess {
    pub reads: Vec<DataTypeId>,
    pub writes: Vec<DataTypeId>,
    /// Whether the system records into the command buffer.
    pub commands: bool,
}

impl SystemAccess {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Two systems conflict when one writes a column the other touches.
    pub fn conflicts_with(&self, other: &SystemAccess) -> bool {
        for w in &self.writes {
            if other.writes.contains(w) || other.reads.contains(w) {
                return true;
            }
        }
        for r in &self.reads {
            if other.writes.contains(r) {
                return true;
            }
        }
        false
    }
}

/// Context a system body runs with: the world for queries and reads, and the
/// tick's command buffer for structural mutations.
pub struct SystemContext<'a> {
    world: NonNull<World>,
    commands: &'a mut CommandBuffer,
}

impl<'a> SystemContext<'a> {
    pub(crate) fn new(world: &mut World, commands: &'a mut CommandBuffer) -> Self {
        Self {
            world: NonNull::from(world),
            commands,
        }
    }

    pub fn world(&self) -> &World {
        unsafe { self.world.as_ref() }
    }

    /// Query with the context's world. Mutable arguments are allowed; the
    /// declared signature is the contract that keeps them race-free.
    pub fn query<'w, Q: QueryArgs<'w>>(&'w self) -> Query<'w, Q> {
        Query::new(self.world, Vec::new())
    }

    /// Query with extra terms merged into the argument terms.
    pub fn query_with<'w, Q: QueryArgs<'w>>(&'w self, extra_terms: Vec<QueryTerm>) -> Query<'w, Q> {
        Query::new(self.world, extra_terms)
    }

    /// Record deferred structural mutations.
    pub fn commands(&mut self) -> &mut CommandBuffer {
        self.commands
    }

    pub fn resource<R: 'static>(&self) -> Option<&R> {
        self.world().resource::<R>()
    }

    /// Mutable access to a resource the system's signature declares.
    pub fn resource_mut<R: 'static>(&mut self) -> Option<&mut R> {
        unsafe { self.world.as_mut() }.resource_mut::<R>()
    }
}

/// Boxed system body.
pub type SystemFn = Box<dyn FnMut(&mut SystemContext) -> Result<()> + Send>;

/// Boxed condition body.
pub type ConditionFn = Box<dyn FnMut(&mut SystemContext) -> bool + Send>;

/// A schedulable system: a name, a signature and a body.
pub struct System {
    name: String,
    access: SystemAccess,
    body: SystemFn,
}

impl System {
    pub fn new<F>(name: impl Into<String>, access: SystemAccess, body: F) -> Self
    where
        F: FnMut(&mut SystemContext) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            access,
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access(&self) -> &SystemAccess {
        &self.access
    }

    pub fn run(&mut self, ctx: &mut SystemContext) -> Result<()> {
        (self.body)(ctx)
    }
}

/// A condition: a named boolean callable guarding systems or repeat groups.
pub struct Condition {
    name: String,
    body: ConditionFn,
}

impl Condition {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnMut(&mut SystemContext) -> bool + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&mut self, ctx: &mut SystemContext) -> bool {
        (self.body)(ctx)
    }
}

/// Explicit signature building for systems, in place of reflection over the
/// body's parameters.
pub struct SystemBuilder {
    name: String,
    access: SystemAccess,
}

impl SystemBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access: SystemAccess::empty(),
        }
    }

    /// Declare a read of the given column or resource.
    pub fn reads(mut self, ty: DataTypeId) -> Self {
        if !self.access.reads.contains(&ty) {
            self.access.reads.push(ty);
        }
        self
    }

    /// Declare a write of the given column or resource.
    pub fn writes(mut self, ty: DataTypeId) -> Self {
        if !self.access.writes.contains(&ty) {
            self.access.writes.push(ty);
        }
        self
    }

    /// Declare that the system records commands.
    pub fn with_commands(mut self) -> Self {
        self.access.commands = true;
        self
    }

    /// Finish with the system body.
    pub fn build<F>(self, body: F) -> System
    where
        F: FnMut(&mut SystemContext) -> Result<()> + Send + 'static,
    {
        System {
            name: self.name,
            access: self.access,
            body: Box::new(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_conflicts() {
        let a = DataTypeId(0);
        let b = DataTypeId(1);

        let write_a = SystemAccess {
            writes: vec![a],
            ..Default::default()
        };
        let read_a = SystemAccess {
            reads: vec![a],
            ..Default::default()
        };
        let read_b = SystemAccess {
            reads: vec![b],
            ..Default::default()
        };

        assert!(write_a.conflicts_with(&write_a));
        assert!(write_a.conflicts_with(&read_a));
        assert!(read_a.conflicts_with(&write_a));
        assert!(!read_a.conflicts_with(&read_a));
        assert!(!write_a.conflicts_with(&read_b));
    }

    #[test]
    fn test_system_runs_with_context() {
        let mut world = World::new();
        world.register_component::<u64>();
        world.spawn((7u64,));

        let ty = world.types().id_of::<u64>();
        let mut system = SystemBuilder::new("sum")
            .reads(ty)
            .with_commands()
            .build(|ctx| {
                let mut total = 0u64;
                let mut query = ctx.query::<(&u64,)>();
                for (value,) in query.iter() {
                    total += *value;
                }
                assert_eq!(total, 7);
                ctx.commands().create((total,));
                Ok(())
            });

        let mut commands = CommandBuffer::new();
        let mut ctx = SystemContext::new(&mut world, &mut commands);
        system.run(&mut ctx).unwrap();
        drop(ctx);

        commands.apply(&mut world).unwrap();
        assert_eq!(world.entity_count(), 2);
    }
}
