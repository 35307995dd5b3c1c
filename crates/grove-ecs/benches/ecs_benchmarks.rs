//! Storage and submission benchmarks.
//!
//! - building and submitting N entities into one group
//! - dense iteration over two parallel component buffers
//! - swapping half of a group to another group entity by entity
//! - whole-group swap (re-keying, independent of entity count)
//! - O(1) lookups by EGID
//!
//! Run with: `cargo bench --bench ecs_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use grove_ecs::prelude::*;

// ---------------------------------------------------------------------------
// Benchmark component types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
}
impl Component for Position {}

#[derive(Debug, Default, Clone, Copy)]
struct Velocity {
    dx: f32,
    dy: f32,
}
impl Component for Velocity {}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A db with `count` moving entities in the first of two groups.
fn populated(count: u32) -> (EntitiesDb, EntityDescriptor, GroupId, GroupId) {
    let mut db = EntitiesDb::new();
    let desc = db.descriptor().with::<Position>().with::<Velocity>().build().unwrap();
    let [a, b] = [db.allocate_group().unwrap(), db.allocate_group().unwrap()];
    for id in 0..count {
        db.build_entity(Egid::new(id, a), &desc)
            .unwrap()
            .init(Velocity { dx: 1.0, dy: 0.5 })
            .unwrap();
    }
    db.submit_entities().unwrap();
    (db, desc, a, b)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_build_and_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_and_submit");
    for count in [1_000u32, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let mut db = EntitiesDb::new();
                    let desc = db.descriptor().with::<Position>().with::<Velocity>().build().unwrap();
                    let g = db.allocate_group().unwrap();
                    (db, desc, g)
                },
                |(mut db, desc, g)| {
                    for id in 0..count {
                        db.build_entity(Egid::new(id, g), &desc).unwrap();
                    }
                    black_box(db.submit_entities().unwrap());
                    db
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_iterate(c: &mut Criterion) {
    let (mut db, _, _, _) = populated(100_000);
    c.bench_function("iterate_100k_pos_vel", |b| {
        b.iter(|| {
            for batch in db.query_all_mut::<(&mut Position, &Velocity)>() {
                let (pos, vel) = batch.buffers;
                for (p, v) in pos.iter_mut().zip(vel) {
                    p.x += v.dx;
                    p.y += v.dy;
                }
            }
        });
    });
}

fn bench_swap_entities(c: &mut Criterion) {
    c.bench_function("swap_half_of_10k", |b| {
        b.iter_batched(
            || populated(10_000),
            |(mut db, desc, from, to)| {
                for id in (0..10_000).step_by(2) {
                    db.swap_entity_group(Egid::new(id, from), to, &desc);
                }
                black_box(db.submit_entities().unwrap());
                db
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_swap_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("swap_group");
    for count in [1_000u32, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || populated(count),
                |(mut db, _, from, to)| {
                    db.swap_group(from, to);
                    black_box(db.submit_entities().unwrap());
                    db
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let (db, _, g, _) = populated(100_000);
    c.bench_function("lookup_100k", |b| {
        b.iter(|| {
            let mut sum = 0.0f32;
            for id in (0..100_000).step_by(7) {
                sum += db.get::<Velocity>(Egid::new(id, g)).map_or(0.0, |v| v.dx);
            }
            black_box(sum)
        });
    });
}

criterion_group!(
    benches,
    bench_build_and_submit,
    bench_iterate,
    bench_swap_entities,
    bench_swap_group,
    bench_lookup,
);
criterion_main!(benches);
