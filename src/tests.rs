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

//! End-to-end scenarios across storage, queries and the scheduler.

#[cfg(test)]
mod tests {
    #![allow(clippy::module_inception)]
    use crate::sparse::SparseRelationTableId;
    use crate::term::{QueryTerm, UNSPECIFIED};
    use crate::{App, Entity, World};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, PartialEq)]
    struct A(i32);
    #[derive(Debug, PartialEq)]
    struct B(i32);
    #[derive(Debug, PartialEq)]
    struct C(i32);

    #[test]
    fn test_archetype_transitions_move_rows_between_tables() {
        let mut world = World::new();
        world.register_component::<A>();
        world.register_component::<B>();
        world.register_component::<C>();

        let e = world.spawn((A(1),));
        let arch_a = world.archetype_of(e).unwrap();

        world.add(e, B(2));
        let arch_ab = world.archetype_of(e).unwrap();
        assert_eq!(world.get::<A>(e), Some(&A(1)));
        assert_eq!(world.get::<B>(e), Some(&B(2)));
        assert_eq!(world.archetype_table_len(arch_ab), 1);
        assert_eq!(world.archetype_table_len(arch_a), 0);

        world.remove::<A>(e);
        let arch_b = world.archetype_of(e).unwrap();
        assert_eq!(world.archetype_table_len(arch_b), 1);
        assert_eq!(world.archetype_table_len(arch_ab), 0);
        assert_eq!(world.get::<A>(e), None);
        assert_eq!(world.get::<B>(e), Some(&B(2)));

        world.despawn(e);
        assert_eq!(world.archetype_table_len(arch_b), 0);
    }

    #[test]
    fn test_relation_rows_follow_endpoint_archetype() {
        let mut world = World::new();
        world.register_component::<A>();
        let rel = world.register_relation::<i32>(false, false);

        let p = world.spawn(());
        let q = world.spawn(());
        world.relate(p, q, 1i32);

        let empty = world.archetype_of(q).unwrap();
        let before = SparseRelationTableId {
            data_type: rel,
            from: empty,
            to: empty,
            depth: 0,
        };
        assert_eq!(world.relation_table_len(before), 1);

        world.add(p, A(0));
        let with_a = world.archetype_of(p).unwrap();
        let after = SparseRelationTableId {
            data_type: rel,
            from: with_a,
            to: empty,
            depth: 0,
        };
        assert_eq!(world.relation_table_len(before), 0);
        assert_eq!(world.relation_table_len(after), 1);
        assert_eq!(world.relation::<i32>(p, q), Some(&1));
    }

    #[test]
    fn test_both_endpoints_migrating_back_to_back() {
        let mut world = World::new();
        world.register_component::<A>();
        world.register_component::<B>();
        world.register_relation::<i32>(false, false);

        let p = world.spawn(());
        let q = world.spawn(());
        world.relate(p, q, 7i32);

        // Moves are applied per migration, in order.
        world.add(p, A(0));
        world.add(q, B(0));
        assert_eq!(world.relation::<i32>(p, q), Some(&7));

        world.remove::<A>(p);
        assert_eq!(world.relation::<i32>(p, q), Some(&7));
    }

    #[test]
    fn test_symmetric_relation_deduplicates() {
        #[derive(Debug, PartialEq)]
        struct Linked(i32);

        let mut world = World::new();
        world.register_relation::<Linked>(true, false);

        let a = world.spawn(());
        let b = world.spawn(());

        world.relate(a, b, Linked(1));
        world.relate(b, a, Linked(2));

        // One stored row, last write wins.
        assert_eq!(world.relation::<Linked>(a, b), Some(&Linked(2)));
        assert_eq!(world.relation::<Linked>(b, a), Some(&Linked(2)));

        let from_a: Vec<Entity> = world
            .relations_from::<Linked>(a)
            .into_iter()
            .map(|(other, _)| other)
            .collect();
        let from_b: Vec<Entity> = world
            .relations_from::<Linked>(b)
            .into_iter()
            .map(|(other, _)| other)
            .collect();
        assert_eq!(from_a, vec![b]);
        assert_eq!(from_b, vec![a]);

        // Full iteration reports the pair exactly once.
        let mut query = world.query::<(Entity, &Linked, Entity)>();
        assert_eq!(query.count(), 1);
    }

    #[test]
    fn test_tree_relation_stays_a_forest() {
        struct Parent;

        let mut world = World::new();
        world.register_relation::<Parent>(false, true);

        let a = world.spawn(());
        let b = world.spawn(());
        let c = world.spawn(());

        world.relate(b, a, Parent);
        world.relate(c, a, Parent);
        assert!(world.related::<Parent>(b, a));
        assert!(world.related::<Parent>(c, a));

        // Rejected: b already has a parent.
        world.relate(b, c, Parent);
        assert!(!world.related::<Parent>(b, c));
        assert!(world.related::<Parent>(b, a));

        // Rejected: a -> b would close a cycle.
        world.relate(a, b, Parent);
        assert!(!world.related::<Parent>(a, b));

        // The accepted forest: every entity has at most one parent.
        for entity in [a, b, c] {
            assert!(world.relations_from::<Parent>(entity).len() <= 1);
        }
    }

    #[test]
    fn test_query_with_optional_and_negative() {
        let mut world = World::new();
        world.register_component::<A>();
        world.register_component::<B>();
        let c = world.register_component::<C>();

        let e1 = world.spawn((A(1),));
        let e2 = world.spawn((A(2), B(20)));
        world.spawn((A(3), C(30)));
        world.spawn((B(40),));

        let mut query = world
            .query_with::<(Entity, &A, Option<&B>)>(vec![QueryTerm::without(c, UNSPECIFIED)]);
        let mut seen: Vec<(Entity, i32, Option<i32>)> = query
            .iter()
            .map(|(e, a, b)| (e, a.0, b.map(|b| b.0)))
            .collect();
        seen.sort_by_key(|(e, _, _)| e.index);

        assert_eq!(seen, vec![(e1, 1, None), (e2, 2, Some(20))]);
    }

    #[test]
    fn test_repeating_tag_with_downstream_system() {
        let trace: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let mut app = App::new();

        let counter = Arc::new(Mutex::new(3u32));
        let counter_inner = Arc::clone(&counter);
        app.tag("simulate").repeat_while(move |_| {
            let mut k = counter_inner.lock().unwrap();
            if *k == 0 {
                false
            } else {
                *k -= 1;
                true
            }
        });

        let inner = Arc::clone(&trace);
        app.system("S1")
            .tagged("simulate")
            .before("integrate")
            .call(move |_| {
                inner.lock().unwrap().push("S1");
                Ok(())
            });
        let inner = Arc::clone(&trace);
        app.system("S2")
            .tagged("simulate")
            .tagged("integrate")
            .call(move |_| {
                inner.lock().unwrap().push("S2");
                Ok(())
            });
        let inner = Arc::clone(&trace);
        app.system("S3").after("simulate").call(move |_| {
            inner.lock().unwrap().push("S3");
            Ok(())
        });

        app.update().unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["S1", "S2", "S1", "S2", "S1", "S2", "S3"]
        );
    }

    #[test]
    fn test_conditional_skip_keeps_downstream_alive() {
        let trace: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let mut app = App::new();

        let inner = Arc::clone(&trace);
        app.system("guarded")
            .tagged("guarded tag")
            .only_if(|_| false)
            .call(move |_| {
                inner.lock().unwrap().push("guarded");
                Ok(())
            });
        let inner = Arc::clone(&trace);
        app.system("dependent").after("guarded tag").call(move |_| {
            inner.lock().unwrap().push("dependent");
            Ok(())
        });

        app.update().unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["dependent"]);
    }

    #[test]
    fn test_commands_defer_until_after_system() {
        let mut app = App::new();
        app.add_component::<A>();
        app.add_relation::<i32>();

        app.system("spawner").with_commands().call(|ctx| {
            let world_entities = ctx.world().entity_count();
            let first = ctx.commands().create((A(1),));
            let second = ctx.commands().create((A(2),));
            ctx.commands().relate(first, second, 3i32);
            // Still deferred while the system runs.
            assert_eq!(ctx.world().entity_count(), world_entities);
            Ok(())
        });

        app.update().unwrap();
        assert_eq!(app.world().entity_count(), 2);

        let world = app.world_mut();
        let mut query = world.query::<(Entity, &i32, Entity)>();
        let matches: Vec<_> = query.iter().map(|(f, v, t)| (f, *v, t)).collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1, 3);
    }

    #[test]
    fn test_despawn_cascades_relations_both_sides() {
        let mut world = World::new();
        world.register_relation::<i32>(false, false);

        let a = world.spawn(());
        let b = world.spawn(());
        let c = world.spawn(());
        world.relate(a, b, 1i32);
        world.relate(b, c, 2i32);
        world.relate(c, a, 3i32);

        world.despawn(b);
        assert!(world.relations_from::<i32>(a).is_empty());
        assert_eq!(world.relations_from::<i32>(c).len(), 1);

        let mut query = world.query::<(Entity, &i32, Entity)>();
        assert_eq!(query.count(), 1);
    }
}
