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

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata_ecs::{Entity, World};

#[derive(Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Clone, Copy)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

struct Near(f32);

fn bench_spawn(c: &mut Criterion) {
    c.bench_function("spawn_10k_two_components", |b| {
        b.iter(|| {
            let mut world = World::new();
            world.register_component::<Position>();
            world.register_component::<Velocity>();
            for i in 0..10_000 {
                let f = i as f32;
                world.spawn((
                    Position { x: f, y: f, z: f },
                    Velocity { x: 1.0, y: 0.0, z: 0.0 },
                ));
            }
            black_box(world.entity_count())
        })
    });
}

fn bench_add_remove(c: &mut Criterion) {
    c.bench_function("add_remove_component_1k", |b| {
        let mut world = World::new();
        world.register_component::<Position>();
        world.register_component::<Velocity>();
        let entities: Vec<Entity> = (0..1_000)
            .map(|i| {
                let f = i as f32;
                world.spawn((Position { x: f, y: f, z: f },))
            })
            .collect();

        b.iter(|| {
            for &entity in &entities {
                world.add(entity, Velocity { x: 0.0, y: 1.0, z: 0.0 });
            }
            for &entity in &entities {
                world.remove::<Velocity>(entity);
            }
        })
    });
}

fn bench_relations(c: &mut Criterion) {
    c.bench_function("relate_unrelate_1k", |b| {
        let mut world = World::new();
        world.register_relation::<Near>(false, false);
        let hub = world.spawn(());
        let others: Vec<Entity> = (0..1_000).map(|_| world.spawn(())).collect();

        b.iter(|| {
            for &other in &others {
                world.relate(hub, other, Near(1.0));
            }
            for &other in &others {
                world.unrelate::<Near>(hub, other);
            }
        })
    });
}

fn bench_query_iteration(c: &mut Criterion) {
    c.bench_function("query_iter_10k", |b| {
        let mut world = World::new();
        world.register_component::<Position>();
        world.register_component::<Velocity>();
        for i in 0..10_000 {
            let f = i as f32;
            if i % 2 == 0 {
                world.spawn((
                    Position { x: f, y: f, z: f },
                    Velocity { x: 1.0, y: 0.0, z: 0.0 },
                ));
            } else {
                world.spawn((Position { x: f, y: f, z: f },));
            }
        }

        b.iter(|| {
            let mut total = 0.0f32;
            let mut query = world.query::<(&Position, &Velocity)>();
            for (position, velocity) in query.iter() {
                total += position.x * velocity.x;
            }
            black_box(total)
        })
    });
}

criterion_group!(
    benches,
    bench_spawn,
    bench_add_remove,
    bench_relations,
    bench_query_iteration
);
criterion_main!(benches);
