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

//! Dispatcher: tags, settings inheritance and schedule compilation
//!
//! Tags are named handles that collect systems and apply settings (ordering
//! constraints, conditions, repeat designation) uniformly to their members.
//! Inheritance is resolved by copying settings from parent tags, then a
//! depth-first search over systems and tags produces a deterministic order
//! and lowers everything onto a [`Schedule`] node graph: one repeat node per
//! repeating tag, one condition node per condition bit and scope, only-if
//! edges for guarded systems, and order edges for before/after settings.

use std::collections::BTreeMap;

use fixedbitset::FixedBitSet;

use crate::command::CommandBuffer;
use crate::error::{EcsError, Result};
use crate::schedule::{ConditionCache, NodeId, Schedule, SystemRegistry};
use crate::system::{Condition, System};
use crate::world::World;

/// Upper bound on distinct conditions per dispatcher. Exceeding it is fatal.
pub const MAX_CONDITIONS: usize = 64;

/// Ordering, condition and grouping settings of a tag or a system.
#[derive(Clone)]
struct Settings {
    /// Tags whose members must run after this.
    before_tags: Vec<String>,
    /// Tags whose members must run before this.
    after_tags: Vec<String>,
    /// Pending systems that must run after this.
    before_systems: Vec<usize>,
    /// Pending systems that must run before this.
    after_systems: Vec<usize>,
    /// Condition bits guarding this.
    conditions: FixedBitSet,
    /// Tags whose settings this tag copies at compile time.
    inherits: Vec<String>,
    /// Whether this tag is a repeat group.
    repeating: bool,
    /// Enclosing repeat group, for sub-group tags.
    parent_group: Option<String>,
}

impl Settings {
    fn new() -> Self {
        Self {
            before_tags: Vec::new(),
            after_tags: Vec::new(),
            before_systems: Vec::new(),
            after_systems: Vec::new(),
            conditions: FixedBitSet::with_capacity(MAX_CONDITIONS),
            inherits: Vec::new(),
            repeating: false,
            parent_group: None,
        }
    }

    /// Merge another settings object into this one. Repeat designation and
    /// grouping are not inherited. `copy_conditions` is false when the other
    /// settings belong to a repeat group, whose conditions the repeat node
    /// itself owns.
    fn copy_from(&mut self, other: &Settings, copy_conditions: bool) {
        for tag in &other.before_tags {
            if !self.before_tags.contains(tag) {
                self.before_tags.push(tag.clone());
            }
        }
        for tag in &other.after_tags {
            if !self.after_tags.contains(tag) {
                self.after_tags.push(tag.clone());
            }
        }
        for &system in &other.before_systems {
            if !self.before_systems.contains(&system) {
                self.before_systems.push(system);
            }
        }
        for &system in &other.after_systems {
            if !self.after_systems.contains(&system) {
                self.after_systems.push(system);
            }
        }
        if copy_conditions {
            self.conditions.union_with(&other.conditions);
        }
    }
}

struct PendingSystem {
    system: Option<System>,
    tags: Vec<String>,
    settings: Settings,
}

struct CompiledChain {
    schedule: Schedule,
    registry: SystemRegistry,
    commands: CommandBuffer,
    cache: ConditionCache,
}

/// Collects systems, tags and constraints, then compiles and runs them.
pub struct Dispatcher {
    pending: Vec<PendingSystem>,
    tags: BTreeMap<String, Settings>,
    conditions: Vec<Option<Condition>>,
    curr_system: Option<usize>,
    curr_tag: Option<String>,
    compiled: Option<CompiledChain>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            tags: BTreeMap::new(),
            conditions: Vec::new(),
            curr_system: None,
            curr_tag: None,
            compiled: None,
        }
    }

    fn ensure_tag(&mut self, tag: &str) {
        if !self.tags.contains_key(tag) {
            self.tags.insert(tag.to_string(), Settings::new());
        }
    }

    fn intern_condition(&mut self, condition: Condition) -> usize {
        assert!(
            self.conditions.len() < MAX_CONDITIONS,
            "condition limit ({MAX_CONDITIONS}) exceeded"
        );
        self.conditions.push(Some(condition));
        self.conditions.len() - 1
    }

    /// Select (creating if needed) the tag further settings apply to.
    pub fn add_tag(&mut self, tag: &str) {
        self.ensure_tag(tag);
        self.curr_tag = Some(tag.to_string());
    }

    /// Make the current tag copy another tag's settings at compile time.
    pub fn tag_inherit(&mut self, parent: &str) {
        let Some(curr) = self.curr_tag.clone() else {
            tracing::error!("no tag currently selected");
            return;
        };
        self.ensure_tag(parent);
        let settings = self.tags.get_mut(&curr).unwrap();
        if settings.inherits.iter().any(|t| t == parent) {
            tracing::debug!(tag = %curr, parent, "tag already inherits");
            return;
        }
        settings.inherits.push(parent.to_string());
    }

    /// Make the current tag's members run before another tag's members.
    pub fn tag_before(&mut self, tag: &str) {
        let Some(curr) = self.curr_tag.clone() else {
            tracing::error!("no tag currently selected");
            return;
        };
        self.ensure_tag(tag);
        self.tags.get_mut(&curr).unwrap().before_tags.push(tag.to_string());
        self.tags.get_mut(tag).unwrap().after_tags.push(curr);
    }

    /// Make the current tag's members run after another tag's members.
    pub fn tag_after(&mut self, tag: &str) {
        let Some(curr) = self.curr_tag.clone() else {
            tracing::error!("no tag currently selected");
            return;
        };
        self.ensure_tag(tag);
        self.tags.get_mut(&curr).unwrap().after_tags.push(tag.to_string());
        self.tags.get_mut(tag).unwrap().before_tags.push(curr);
    }

    /// Guard the current tag's members with a condition. For a repeating tag
    /// this becomes the loop condition.
    pub fn tag_condition(&mut self, condition: Condition) {
        let Some(curr) = self.curr_tag.clone() else {
            tracing::error!("no tag currently selected");
            return;
        };
        let bit = self.intern_condition(condition);
        self.tags.get_mut(&curr).unwrap().conditions.insert(bit);
    }

    /// Mark the current tag as a repeat group.
    pub fn tag_repeat(&mut self) {
        let Some(curr) = self.curr_tag.clone() else {
            tracing::error!("no tag currently selected");
            return;
        };
        self.tags.get_mut(&curr).unwrap().repeating = true;
    }

    /// Nest the current tag's repeat group inside another repeating tag.
    pub fn tag_sub_group_of(&mut self, parent: &str) {
        let Some(curr) = self.curr_tag.clone() else {
            tracing::error!("no tag currently selected");
            return;
        };
        self.ensure_tag(parent);
        self.tags.get_mut(&curr).unwrap().parent_group = Some(parent.to_string());
    }

    /// Add a system and select it for further configuration.
    pub fn add_system(&mut self, system: System) {
        assert!(
            self.compiled.is_none(),
            "cannot add systems after the dispatcher compiled"
        );
        self.pending.push(PendingSystem {
            system: Some(system),
            tags: Vec::new(),
            settings: Settings::new(),
        });
        self.curr_system = Some(self.pending.len() - 1);
    }

    /// Tag the current system. Tagging with a repeating tag makes the system
    /// a member of that repeat group.
    pub fn system_tag(&mut self, tag: &str) {
        let Some(curr) = self.curr_system else {
            tracing::error!("no system currently selected");
            return;
        };
        self.ensure_tag(tag);
        if !self.pending[curr].tags.iter().any(|t| t == tag) {
            self.pending[curr].tags.push(tag.to_string());
        }
    }

    /// Make the current system run before all members of the tag.
    pub fn system_before(&mut self, tag: &str) {
        let Some(curr) = self.curr_system else {
            tracing::error!("no system currently selected");
            return;
        };
        self.ensure_tag(tag);
        self.pending[curr].settings.before_tags.push(tag.to_string());
        self.tags.get_mut(tag).unwrap().after_systems.push(curr);
    }

    /// Make the current system run after all members of the tag.
    pub fn system_after(&mut self, tag: &str) {
        let Some(curr) = self.curr_system else {
            tracing::error!("no system currently selected");
            return;
        };
        self.ensure_tag(tag);
        self.pending[curr].settings.after_tags.push(tag.to_string());
        self.tags.get_mut(tag).unwrap().before_systems.push(curr);
    }

    /// Guard the current system with a condition.
    pub fn system_condition(&mut self, condition: Condition) {
        let Some(curr) = self.curr_system else {
            tracing::error!("no system currently selected");
            return;
        };
        let bit = self.intern_condition(condition);
        self.pending[curr].settings.conditions.insert(bit);
    }

    /// First repeating tag of a system, which decides its repeat group.
    fn group_of(&self, system: usize) -> Option<&str> {
        let mut found: Option<&str> = None;
        for tag in &self.pending[system].tags {
            if self.tags.get(tag).is_some_and(|s| s.repeating) {
                if found.is_some() {
                    tracing::error!(
                        %tag,
                        "system has more than one repeating tag, keeping the first"
                    );
                } else {
                    found = Some(tag);
                }
            }
        }
        found
    }

    /// Resolve tag inheritance by copying settings from parents, depth first.
    fn resolve_inheritance(&mut self, tag: &str) {
        let parents = self
            .tags
            .get(tag)
            .map(|s| s.inherits.clone())
            .unwrap_or_default();
        if parents.is_empty() {
            return;
        }
        self.tags.get_mut(tag).unwrap().inherits.clear();
        for parent in parents {
            self.resolve_inheritance(&parent);
            if let Some(parent_settings) = self.tags.get(&parent).cloned() {
                let copy_conditions = !parent_settings.repeating;
                self.tags
                    .get_mut(tag)
                    .unwrap()
                    .copy_from(&parent_settings, copy_conditions);
            }
        }
    }

    /// Compile the pending systems and tags into a runnable schedule.
    ///
    /// A dependency cycle between tags or systems fails the compilation and
    /// the dispatcher stays uncompiled.
    pub fn compile(&mut self) -> Result<()> {
        if self.compiled.is_some() {
            return Ok(());
        }

        // 1. Tag inheritance.
        let tag_names: Vec<String> = self.tags.keys().cloned().collect();
        for tag in &tag_names {
            self.resolve_inheritance(tag);
        }

        // 2. Copy tag settings into their member systems. Repeat-group
        // conditions stay with the group; everything else transfers.
        for i in 0..self.pending.len() {
            for tag in self.pending[i].tags.clone() {
                if let Some(tag_settings) = self.tags.get(&tag).cloned() {
                    let copy_conditions = !tag_settings.repeating;
                    self.pending[i]
                        .settings
                        .copy_from(&tag_settings, copy_conditions);
                }
            }
        }

        // 3. Validate repeat groups before any state is consumed, so a failed
        // compile leaves the dispatcher usable.
        for (tag, settings) in &self.tags {
            if !settings.repeating {
                continue;
            }
            let count = settings.conditions.ones().count();
            if count != 1 {
                return Err(EcsError::ScheduleError(format!(
                    "repeating tag '{tag}' needs exactly one condition, has {count}"
                )));
            }
        }

        // 4. Topological order over systems and tags via DFS coloring.
        let order = self.sort_systems()?;

        // 5. Lower onto the schedule node graph.
        let mut registry = SystemRegistry::new();
        let mut schedule = Schedule::new();

        let mut condition_ids = Vec::with_capacity(self.conditions.len());
        for slot in &mut self.conditions {
            let condition = slot.take().expect("conditions are interned once");
            condition_ids.push(registry.add_condition(condition));
        }

        // Repeat nodes for repeating tags, outermost groups first.
        let mut repeat_nodes: BTreeMap<String, NodeId> = BTreeMap::new();
        let repeating: Vec<String> = self
            .tags
            .iter()
            .filter(|(_, s)| s.repeating)
            .map(|(name, _)| name.clone())
            .collect();
        for tag in &repeating {
            self.make_repeat_node(tag, &mut schedule, &condition_ids, &mut repeat_nodes)?;
        }

        // System nodes in compiled order.
        let mut system_nodes: Vec<Option<NodeId>> = vec![None; self.pending.len()];
        for &index in &order {
            let system = self.pending[index].system.take().expect("compiled once");
            let system_id = registry.add_system(system);
            let group = self.group_of(index).map(|tag| repeat_nodes[tag]);
            let node = schedule
                .system(system_id, group)
                .expect("group nodes are repeat nodes");
            system_nodes[index] = Some(node);
        }

        // Ordering edges from the per-system settings. Tag-level constraints
        // were copied onto the members above; edges across repeat groups are
        // lifted by the schedule itself.
        let members = |tag: &str| -> Vec<usize> {
            (0..self.pending.len())
                .filter(|&i| self.pending[i].tags.iter().any(|t| t == tag))
                .collect()
        };
        for i in 0..self.pending.len() {
            let node = system_nodes[i].expect("every system got a node");
            let settings = &self.pending[i].settings;
            for tag in &settings.after_tags {
                for other in members(tag) {
                    if other != i && !schedule.order(system_nodes[other].unwrap(), node) {
                        return Err(EcsError::CycleDetected);
                    }
                }
            }
            for tag in &settings.before_tags {
                for other in members(tag) {
                    if other != i && !schedule.order(node, system_nodes[other].unwrap()) {
                        return Err(EcsError::CycleDetected);
                    }
                }
            }
            for &other in &settings.after_systems {
                if other != i && !schedule.order(system_nodes[other].unwrap(), node) {
                    return Err(EcsError::CycleDetected);
                }
            }
            for &other in &settings.before_systems {
                if other != i && !schedule.order(node, system_nodes[other].unwrap()) {
                    return Err(EcsError::CycleDetected);
                }
            }
        }

        // Condition nodes, one per bit and repeat scope, with only-if edges.
        let mut condition_nodes: BTreeMap<(usize, Option<String>), NodeId> = BTreeMap::new();
        for i in 0..self.pending.len() {
            let node = system_nodes[i].unwrap();
            let scope = self.group_of(i).map(|t| t.to_string());
            let bits: Vec<usize> = self.pending[i].settings.conditions.ones().collect();
            for bit in bits {
                let key = (bit, scope.clone());
                let condition_node = match condition_nodes.get(&key) {
                    Some(&existing) => existing,
                    None => {
                        let group = scope.as_ref().map(|tag| repeat_nodes[tag]);
                        let created = schedule
                            .condition(condition_ids[bit], group)
                            .expect("group nodes are repeat nodes");
                        condition_nodes.insert(key, created);
                        created
                    }
                };
                if !schedule.only_if(node, condition_node) {
                    return Err(EcsError::CycleDetected);
                }
            }
        }

        self.compiled = Some(CompiledChain {
            schedule,
            registry,
            commands: CommandBuffer::new(),
            cache: ConditionCache::new(MAX_CONDITIONS),
        });
        tracing::debug!(systems = order.len(), "dispatcher compiled");
        Ok(())
    }

    fn make_repeat_node(
        &self,
        tag: &str,
        schedule: &mut Schedule,
        condition_ids: &[crate::schedule::ConditionId],
        repeat_nodes: &mut BTreeMap<String, NodeId>,
    ) -> Result<()> {
        if repeat_nodes.contains_key(tag) {
            return Ok(());
        }
        let settings = self.tags.get(tag).expect("repeating tag has settings");

        let parent = match &settings.parent_group {
            Some(parent) => {
                self.make_repeat_node(parent, schedule, condition_ids, repeat_nodes)?;
                Some(repeat_nodes[parent])
            }
            None => None,
        };

        let mut bits = settings.conditions.ones();
        let bit = bits.next().ok_or_else(|| {
            EcsError::ScheduleError(format!("repeating tag '{tag}' has no condition"))
        })?;
        if bits.next().is_some() {
            return Err(EcsError::ScheduleError(format!(
                "repeating tag '{tag}' has more than one condition"
            )));
        }

        let node = schedule
            .repeat(condition_ids[bit], parent)
            .expect("parent group nodes are repeat nodes");
        repeat_nodes.insert(tag.to_string(), node);
        Ok(())
    }

    /// Depth-first topological sort over systems and tags. White/gray/black
    /// coloring; a gray revisit is a cycle.
    fn sort_systems(&self) -> Result<Vec<usize>> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        // Node space: systems first, then tags in name order.
        let tag_names: Vec<&String> = self.tags.keys().collect();
        let total = self.pending.len() + tag_names.len();
        let mut colors = vec![WHITE; total];
        let mut order: Vec<usize> = Vec::with_capacity(self.pending.len());

        // Successors of a node: everything its settings say it runs before.
        let successors = |node: usize| -> Vec<usize> {
            let settings = if node < self.pending.len() {
                &self.pending[node].settings
            } else {
                self.tags.get(tag_names[node - self.pending.len()]).unwrap()
            };
            let mut next = Vec::new();
            for tag in &settings.before_tags {
                for (i, pending) in self.pending.iter().enumerate() {
                    if pending.tags.iter().any(|t| t == tag) {
                        next.push(i);
                    }
                }
                if let Some(pos) = tag_names.iter().position(|name| *name == tag) {
                    next.push(self.pending.len() + pos);
                }
            }
            for &system in &settings.before_systems {
                next.push(system);
            }
            next
        };

        fn visit(
            node: usize,
            colors: &mut [u8],
            order: &mut Vec<usize>,
            system_count: usize,
            successors: &dyn Fn(usize) -> Vec<usize>,
        ) -> bool {
            match colors[node] {
                BLACK => return true,
                GRAY => return false,
                _ => {}
            }
            colors[node] = GRAY;
            for next in successors(node) {
                if !visit(next, colors, order, system_count, successors) {
                    return false;
                }
            }
            colors[node] = BLACK;
            if node < system_count {
                order.push(node);
            }
            true
        }

        for node in 0..total {
            if colors[node] == WHITE
                && !visit(
                    node,
                    &mut colors,
                    &mut order,
                    self.pending.len(),
                    &successors,
                )
            {
                tracing::error!("cycle detected in the system chain");
                return Err(EcsError::CycleDetected);
            }
        }

        // Completion order lists dependents first; reverse it.
        order.reverse();
        Ok(order)
    }

    /// Compile if needed, then run one tick.
    pub fn run(&mut self, world: &mut World) -> Result<()> {
        self.compile()?;
        let chain = self.compiled.as_mut().expect("compile succeeded");
        chain.cache.reset();
        chain
            .schedule
            .run(&mut chain.registry, world, &mut chain.commands, &mut chain.cache)
    }

    pub fn system_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
