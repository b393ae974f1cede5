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

//! Schedule: the scheduler's node graph
//!
//! Three node kinds: system nodes run a system body, condition nodes gate
//! their dependents, repeat nodes re-run their member nodes while their
//! condition holds. Each node tracks how many satisfactions it needs before
//! it may run; a ready queue holds nodes whose counters reached that level,
//! and execution pops them one at a time.
//!
//! Ordering constraints between nodes living in different repeat groups are
//! lifted to the closest pair of ancestors sharing a parent group, because
//! the number of iterations of a repeat is not statically known. Any edge
//! that would introduce a cycle is rejected and the schedule is unchanged.

use std::collections::VecDeque;

use fixedbitset::FixedBitSet;

use crate::command::CommandBuffer;
use crate::error::Result;
use crate::system::{Condition, System, SystemContext};
use crate::world::World;

/// Identifies a node in the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(pub usize);

/// Identifies a system in a [`SystemRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(pub usize);

/// Identifies a condition in a [`SystemRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConditionId(pub usize);

/// Owns the systems and conditions a schedule refers to.
#[derive(Default)]
pub struct SystemRegistry {
    systems: Vec<System>,
    conditions: Vec<Condition>,
}

impl SystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_system(&mut self, system: System) -> SystemId {
        self.systems.push(system);
        SystemId(self.systems.len() - 1)
    }

    pub fn add_condition(&mut self, condition: Condition) -> ConditionId {
        self.conditions.push(condition);
        ConditionId(self.conditions.len() - 1)
    }

    pub fn system_mut(&mut self, id: SystemId) -> &mut System {
        &mut self.systems[id.0]
    }

    pub fn condition_mut(&mut self, id: ConditionId) -> &mut Condition {
        &mut self.conditions[id.0]
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    pub fn condition_count(&self) -> usize {
        self.conditions.len()
    }
}

/// Per-tick memo of condition results, so a condition shared by several nodes
/// is evaluated at most once per tick.
pub struct ConditionCache {
    evaluated: FixedBitSet,
    results: FixedBitSet,
}

impl ConditionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            evaluated: FixedBitSet::with_capacity(capacity),
            results: FixedBitSet::with_capacity(capacity),
        }
    }

    pub fn reset(&mut self) {
        self.evaluated.clear();
        self.results.clear();
    }
}

#[derive(Default)]
struct Node {
    satisfaction: i64,
    needed_satisfaction: i64,

    /// Repeat node state: currently repeating / has run at least once this
    /// tick.
    is_repeating: bool,
    already_repeated: bool,

    already_finished: bool,
    already_evaluated_to_true: bool,

    /// Enclosing repeat node, if any.
    repeat: Option<NodeId>,
    system: Option<SystemId>,
    condition: Option<ConditionId>,
    is_repeat: bool,

    /// Nodes satisfied when this node finishes.
    satisfy_on_finish: Vec<NodeId>,
    /// Nodes satisfied when this condition node returns true.
    satisfy_on_true: Vec<NodeId>,
    /// Member nodes, for repeat nodes.
    parts: Vec<NodeId>,
    /// Parts skipped by false conditions outside the repeat.
    skipped_parts: i64,

    /// Nesting depth in the repeat hierarchy.
    depth: u32,
}

/// The scheduler's executable node graph.
#[derive(Default)]
pub struct Schedule {
    nodes: Vec<Node>,
    satisfied: VecDeque<NodeId>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all nodes. Previously returned ids must no longer be used.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.satisfied.clear();
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn add_node(&mut self, repeat: Option<NodeId>) -> Option<NodeId> {
        let id = NodeId(self.nodes.len());
        if let Some(parent) = repeat {
            if !self.nodes[parent.0].is_repeat {
                return None;
            }
            self.nodes[parent.0].parts.push(id);
        }
        let depth = repeat.map_or(0, |parent| self.nodes[parent.0].depth + 1);
        self.nodes.push(Node {
            needed_satisfaction: if repeat.is_some() { 1 } else { 0 },
            repeat,
            depth,
            ..Node::default()
        });
        Some(id)
    }

    /// Add a repeat node re-running its parts while the condition holds.
    /// Returns `None` if `repeat` is not a repeat node.
    pub fn repeat(&mut self, condition: ConditionId, repeat: Option<NodeId>) -> Option<NodeId> {
        let id = self.add_node(repeat)?;
        self.nodes[id.0].is_repeat = true;
        self.nodes[id.0].condition = Some(condition);
        Some(id)
    }

    /// Add a system node. Returns `None` if `repeat` is not a repeat node.
    pub fn system(&mut self, system: SystemId, repeat: Option<NodeId>) -> Option<NodeId> {
        let id = self.add_node(repeat)?;
        self.nodes[id.0].system = Some(system);
        Some(id)
    }

    /// Add a condition node. Returns `None` if `repeat` is not a repeat node.
    pub fn condition(&mut self, condition: ConditionId, repeat: Option<NodeId>) -> Option<NodeId> {
        let id = self.add_node(repeat)?;
        self.nodes[id.0].condition = Some(condition);
        Some(id)
    }

    /// Make `node` run only when the condition node evaluated to true. The
    /// condition must be on the node's repeat chain, at the same or shallower
    /// depth. Fails by returning false, leaving the schedule unchanged.
    pub fn only_if(&mut self, node: NodeId, condition: NodeId) -> bool {
        if self.nodes[condition.0].condition.is_none() || self.nodes[condition.0].is_repeat {
            tracing::error!(
                node = node.0,
                condition = condition.0,
                "only-if target is not a condition node"
            );
            return false;
        }

        let mut left = node;
        let mut right = condition;
        self.match_node_depths(&mut left, &mut right);
        if right != condition {
            tracing::error!(
                node = node.0,
                condition = condition.0,
                "condition is not on the node's repeat chain"
            );
            return false;
        }

        if self.ordered(node, condition) {
            tracing::error!(
                node = node.0,
                condition = condition.0,
                "only-if edge would form a cycle"
            );
            return false;
        }

        self.nodes[condition.0].satisfy_on_true.push(node);
        self.nodes[node.0].needed_satisfaction += 1;
        true
    }

    /// Make `after` run only after `before` finishes. Redundant edges are
    /// dropped; an edge that would form a cycle is rejected with `false`,
    /// leaving the schedule unchanged.
    pub fn order(&mut self, before: NodeId, after: NodeId) -> bool {
        let mut before = before;
        let mut after = after;
        self.match_node_depths(&mut before, &mut after);

        if before == after {
            tracing::error!(node = before.0, "node cannot run before itself");
            return false;
        }
        if self.ordered(before, after) {
            // Redundant, skip adding it.
            return true;
        }
        if self.ordered(after, before) {
            tracing::error!(
                before = before.0,
                after = after.0,
                "ordering edge would form a cycle"
            );
            return false;
        }

        self.nodes[before.0].satisfy_on_finish.push(after);
        self.nodes[after.0].needed_satisfaction += 1;
        true
    }

    /// Whether `before` already transitively runs before `after`.
    fn ordered(&self, before: NodeId, after: NodeId) -> bool {
        let mut before = before;
        let mut after = after;
        self.match_node_depths(&mut before, &mut after);

        for &next in &self.nodes[before.0].satisfy_on_finish {
            if next == after || self.ordered(next, after) {
                return true;
            }
        }
        for &next in &self.nodes[before.0].satisfy_on_true {
            if next == after || self.ordered(next, after) {
                return true;
            }
        }
        false
    }

    /// Lift both nodes until they share an enclosing repeat node.
    fn match_node_depths(&self, left: &mut NodeId, right: &mut NodeId) {
        while self.nodes[left.0].repeat != self.nodes[right.0].repeat {
            if self.nodes[left.0].depth > self.nodes[right.0].depth {
                *left = self.nodes[left.0].repeat.expect("deeper node has a parent");
            } else {
                *right = self.nodes[right.0].repeat.expect("deeper node has a parent");
            }
        }
    }

    /// Run the schedule to completion for one tick. The command buffer is
    /// committed after every system, and condition results are memoized in
    /// the cache (repeat conditions always re-evaluate).
    pub fn run(
        &mut self,
        registry: &mut SystemRegistry,
        world: &mut World,
        commands: &mut CommandBuffer,
        cache: &mut ConditionCache,
    ) -> Result<()> {
        debug_assert!(self.satisfied.is_empty());

        // Reset in reverse order so systems added later without ordering
        // edges run first, making missing constraints noticeable.
        for i in (0..self.nodes.len()).rev() {
            let node = &mut self.nodes[i];
            node.satisfaction = 0;
            node.already_repeated = false;
            node.already_finished = false;
            node.already_evaluated_to_true = false;
            if node.needed_satisfaction == 0 {
                self.satisfied.push_back(NodeId(i));
            }
        }

        while let Some(id) = self.satisfied.pop_front() {
            self.run_node(registry, world, commands, cache, id)?;
        }
        Ok(())
    }

    fn run_node(
        &mut self,
        registry: &mut SystemRegistry,
        world: &mut World,
        commands: &mut CommandBuffer,
        cache: &mut ConditionCache,
        id: NodeId,
    ) -> Result<()> {
        if let Some(system_id) = self.nodes[id.0].system {
            {
                let mut ctx = SystemContext::new(world, commands);
                registry.system_mut(system_id).run(&mut ctx)?;
            }
            // Commit point.
            commands.apply(world)?;

            let repeat = self.nodes[id.0].repeat;
            self.increment_opt(repeat);
            let finish = self.nodes[id.0].satisfy_on_finish.clone();
            self.increment_all(&finish);
            self.nodes[id.0].already_finished = true;
            return Ok(());
        }

        // Condition or repeat node: evaluate the associated condition.
        let condition_id = self.nodes[id.0].condition.expect("node has a condition");
        let is_repeat = self.nodes[id.0].is_repeat;
        let bit = condition_id.0;

        let result = if !is_repeat && cache.evaluated.contains(bit) {
            cache.results.contains(bit)
        } else {
            let result = {
                let mut ctx = SystemContext::new(world, commands);
                registry.condition_mut(condition_id).run(&mut ctx)
            };
            if !commands.is_empty() {
                commands.apply(world)?;
            }
            cache.evaluated.insert(bit);
            cache.results.set(bit, result);
            result
        };

        if !is_repeat {
            // Whatever the result, nodes waiting for the evaluation proceed.
            let repeat = self.nodes[id.0].repeat;
            self.increment_opt(repeat);
            let finish = self.nodes[id.0].satisfy_on_finish.clone();
            self.increment_all(&finish);
            self.nodes[id.0].already_finished = true;

            if result {
                let on_true = self.nodes[id.0].satisfy_on_true.clone();
                self.increment_all(&on_true);
                self.nodes[id.0].already_evaluated_to_true = true;
                return Ok(());
            }

            // False: the guarded nodes are skipped, which counts as finished
            // for everything downstream of them.
            let node_repeat = self.nodes[id.0].repeat;
            let skipped_nodes = self.nodes[id.0].satisfy_on_true.clone();
            for skipped in skipped_nodes {
                let skipped_repeat = self.nodes[skipped.0].repeat;
                if node_repeat != skipped_repeat {
                    if let Some(repeat) = skipped_repeat {
                        self.nodes[repeat.0].skipped_parts += 1;
                    }
                }
                if let Some(repeat) = skipped_repeat {
                    if self.nodes[repeat.0].is_repeating {
                        self.increment_opt(Some(repeat));
                    }
                }
                let finish = self.nodes[skipped.0].satisfy_on_finish.clone();
                self.increment_all(&finish);
            }
            return Ok(());
        }

        // Repeat node. On re-entry, reset the state of its parts first.
        if self.nodes[id.0].already_repeated {
            let parts = self.nodes[id.0].parts.clone();
            for part in parts {
                self.nodes[part.0].satisfaction -= 1;
                self.nodes[part.0].already_repeated = false;

                if self.nodes[part.0].already_finished {
                    let finish = self.nodes[part.0].satisfy_on_finish.clone();
                    self.decrement_all(&finish);
                    self.nodes[part.0].already_finished = false;
                }
                if self.nodes[part.0].already_evaluated_to_true {
                    let on_true = self.nodes[part.0].satisfy_on_true.clone();
                    self.decrement_all(&on_true);
                    self.nodes[part.0].already_evaluated_to_true = false;
                }
            }
        }

        self.nodes[id.0].is_repeating = result;

        if !result {
            // The repeat is done; only now has it finished.
            self.nodes[id.0].skipped_parts = 0;
            let repeat = self.nodes[id.0].repeat;
            self.increment_opt(repeat);
            let finish = self.nodes[id.0].satisfy_on_finish.clone();
            self.increment_all(&finish);
            self.nodes[id.0].already_finished = true;
            return Ok(());
        }

        self.nodes[id.0].already_repeated = true;

        // Release the parts, then wait for all of them to finish before this
        // node runs again. Skipped parts count toward that sum.
        let parts = self.nodes[id.0].parts.clone();
        self.increment_all(&parts);

        let node = &mut self.nodes[id.0];
        node.satisfaction -= parts.len() as i64;
        node.satisfaction += node.skipped_parts;
        if node.satisfaction == node.needed_satisfaction {
            // An empty repeat runs again immediately.
            self.satisfied.push_back(id);
        }
        Ok(())
    }

    fn increment_opt(&mut self, node: Option<NodeId>) {
        if let Some(id) = node {
            let node = &mut self.nodes[id.0];
            node.satisfaction += 1;
            if node.satisfaction == node.needed_satisfaction {
                self.satisfied.push_back(id);
            }
        }
    }

    /// Increment in reverse order so nodes whose restrictions were added
    /// later run first.
    fn increment_all(&mut self, nodes: &[NodeId]) {
        for &id in nodes.iter().rev() {
            self.increment_opt(Some(id));
        }
    }

    fn decrement_all(&mut self, nodes: &[NodeId]) {
        for &id in nodes {
            self.nodes[id.0].satisfaction -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::SystemBuilder;
    use std::sync::{Arc, Mutex};

    type Trace = Arc<Mutex<Vec<&'static str>>>;

    fn trace_system(registry: &mut SystemRegistry, trace: &Trace, name: &'static str) -> SystemId {
        let trace = Arc::clone(trace);
        registry.add_system(SystemBuilder::new(name).build(move |_| {
            trace.lock().unwrap().push(name);
            Ok(())
        }))
    }

    fn run(schedule: &mut Schedule, registry: &mut SystemRegistry) {
        let mut world = World::new();
        let mut commands = CommandBuffer::new();
        let mut cache = ConditionCache::new(64);
        schedule
            .run(registry, &mut world, &mut commands, &mut cache)
            .unwrap();
    }

    #[test]
    fn test_order_chain_and_cycle_rejection() {
        let trace: Trace = Arc::default();
        let mut registry = SystemRegistry::new();
        let mut schedule = Schedule::new();

        let a = schedule.system(trace_system(&mut registry, &trace, "A"), None).unwrap();
        let b = schedule.system(trace_system(&mut registry, &trace, "B"), None).unwrap();
        let c = schedule.system(trace_system(&mut registry, &trace, "C"), None).unwrap();

        assert!(schedule.order(a, b));
        assert!(schedule.order(b, c));
        // Closing the loop is rejected and the schedule is untouched.
        assert!(!schedule.order(c, a));
        // Transitive edges are redundant, not cycles.
        assert!(schedule.order(a, c));

        run(&mut schedule, &mut registry);
        assert_eq!(*trace.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_unordered_nodes_run_newest_first() {
        let trace: Trace = Arc::default();
        let mut registry = SystemRegistry::new();
        let mut schedule = Schedule::new();

        schedule.system(trace_system(&mut registry, &trace, "A"), None).unwrap();
        schedule.system(trace_system(&mut registry, &trace, "B"), None).unwrap();

        run(&mut schedule, &mut registry);
        assert_eq!(*trace.lock().unwrap(), vec!["B", "A"]);
    }

    #[test]
    fn test_condition_false_skips_but_satisfies_dependents() {
        let trace: Trace = Arc::default();
        let mut registry = SystemRegistry::new();
        let mut schedule = Schedule::new();

        let cond = registry.add_condition(Condition::new("never", |_| false));
        let cond_node = schedule.condition(cond, None).unwrap();
        let guarded = schedule
            .system(trace_system(&mut registry, &trace, "guarded"), None)
            .unwrap();
        let after = schedule
            .system(trace_system(&mut registry, &trace, "after"), None)
            .unwrap();

        assert!(schedule.only_if(guarded, cond_node));
        assert!(schedule.order(guarded, after));

        run(&mut schedule, &mut registry);
        assert_eq!(*trace.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn test_condition_true_runs_guarded() {
        let trace: Trace = Arc::default();
        let mut registry = SystemRegistry::new();
        let mut schedule = Schedule::new();

        let cond = registry.add_condition(Condition::new("always", |_| true));
        let cond_node = schedule.condition(cond, None).unwrap();
        let guarded = schedule
            .system(trace_system(&mut registry, &trace, "guarded"), None)
            .unwrap();
        assert!(schedule.only_if(guarded, cond_node));

        run(&mut schedule, &mut registry);
        assert_eq!(*trace.lock().unwrap(), vec!["guarded"]);
    }

    #[test]
    fn test_shared_condition_evaluates_once() {
        let trace: Trace = Arc::default();
        let evals = Arc::new(Mutex::new(0));
        let mut registry = SystemRegistry::new();
        let mut schedule = Schedule::new();

        let evals_inner = Arc::clone(&evals);
        let cond = registry.add_condition(Condition::new("counted", move |_| {
            *evals_inner.lock().unwrap() += 1;
            true
        }));

        // Two separate condition nodes sharing one condition id: the cache
        // must keep the second node from re-running the body.
        let node1 = schedule.condition(cond, None).unwrap();
        let node2 = schedule.condition(cond, None).unwrap();
        let s1 = schedule
            .system(trace_system(&mut registry, &trace, "S1"), None)
            .unwrap();
        let s2 = schedule
            .system(trace_system(&mut registry, &trace, "S2"), None)
            .unwrap();
        assert!(schedule.only_if(s1, node1));
        assert!(schedule.only_if(s2, node2));

        run(&mut schedule, &mut registry);
        assert_eq!(*evals.lock().unwrap(), 1);
        assert_eq!(trace.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_repeat_runs_parts_k_times() {
        let trace: Trace = Arc::default();
        let mut registry = SystemRegistry::new();
        let mut schedule = Schedule::new();

        let counter = Arc::new(Mutex::new(3u32));
        let counter_inner = Arc::clone(&counter);
        let cond = registry.add_condition(Condition::new("k--", move |_| {
            let mut k = counter_inner.lock().unwrap();
            if *k == 0 {
                false
            } else {
                *k -= 1;
                true
            }
        }));

        let repeat = schedule.repeat(cond, None).unwrap();
        let s1 = schedule
            .system(trace_system(&mut registry, &trace, "S1"), Some(repeat))
            .unwrap();
        let s2 = schedule
            .system(trace_system(&mut registry, &trace, "S2"), Some(repeat))
            .unwrap();
        assert!(schedule.order(s1, s2));

        let s3 = schedule
            .system(trace_system(&mut registry, &trace, "S3"), None)
            .unwrap();
        // Ordering against a member is lifted to the repeat node.
        assert!(schedule.order(s2, s3));

        run(&mut schedule, &mut registry);
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["S1", "S2", "S1", "S2", "S1", "S2", "S3"]
        );
    }

    #[test]
    fn test_repeat_condition_false_immediately() {
        let trace: Trace = Arc::default();
        let mut registry = SystemRegistry::new();
        let mut schedule = Schedule::new();

        let cond = registry.add_condition(Condition::new("never", |_| false));
        let repeat = schedule.repeat(cond, None).unwrap();
        schedule
            .system(trace_system(&mut registry, &trace, "part"), Some(repeat))
            .unwrap();
        let after = schedule
            .system(trace_system(&mut registry, &trace, "after"), None)
            .unwrap();
        assert!(schedule.order(repeat, after));

        run(&mut schedule, &mut registry);
        assert_eq!(*trace.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn test_parts_require_repeat_parent() {
        let mut registry = SystemRegistry::new();
        let mut schedule = Schedule::new();

        let id = registry.add_system(SystemBuilder::new("s").build(|_| Ok(())));
        let not_repeat = schedule.system(id, None).unwrap();
        assert!(schedule.system(id, Some(not_repeat)).is_none());
    }
}
