use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dashmap::DashMap;
use rand::prelude::*;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use tricache_rs::TypeTripleCache;

struct Marker<const N: usize>;

macro_rules! ids {
    ($($n:literal)*) => { vec![$(TypeId::of::<Marker<$n>>()),*] };
}

type Triple = (TypeId, TypeId, TypeId);

fn triples() -> Vec<Triple> {
    let types = ids!(0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15);
    let contexts = ids!(16 17 18 19);
    let mut out = Vec::new();
    for &s in &types {
        for &t in &types {
            for &c in &contexts {
                out.push((s, t, c));
            }
        }
    }
    out.shuffle(&mut rand::thread_rng());
    out
}

fn bench_lookup_tricache(c: &mut Criterion) {
    let keys = triples();
    let cache = TypeTripleCache::<u64>::with_capacity(16);
    for (i, &(s, t, ctx)) in keys.iter().enumerate() {
        cache.get_or_insert_with(s, t, ctx, |_, _, _| i as u64);
    }
    c.bench_function("tricache_lookup_hit", |b| {
        b.iter(|| {
            let mut acc = 0u64;
            for &(s, t, ctx) in &keys {
                acc = acc.wrapping_add(cache.get(s, t, ctx).unwrap());
            }
            black_box(acc)
        })
    });
}

fn bench_lookup_dashmap(c: &mut Criterion) {
    let keys = triples();
    let map = DashMap::<Triple, u64>::with_capacity(16);
    for (i, &key) in keys.iter().enumerate() {
        map.insert(key, i as u64);
    }
    c.bench_function("dashmap_lookup_hit", |b| {
        b.iter(|| {
            let mut acc = 0u64;
            for key in &keys {
                acc = acc.wrapping_add(*map.get(key).unwrap());
            }
            black_box(acc)
        })
    });
}

fn bench_lookup_hashmap(c: &mut Criterion) {
    let keys = triples();
    let mut map = HashMap::<Triple, u64>::with_capacity(16);
    for (i, &key) in keys.iter().enumerate() {
        map.insert(key, i as u64);
    }
    c.bench_function("hashmap_lookup_hit", |b| {
        b.iter(|| {
            let mut acc = 0u64;
            for key in &keys {
                acc = acc.wrapping_add(*map.get(key).unwrap());
            }
            black_box(acc)
        })
    });
}

fn bench_concurrent_lookup_tricache(c: &mut Criterion) {
    let keys = Arc::new(triples());
    let cache = Arc::new(TypeTripleCache::<u64>::with_capacity(16));
    for (i, &(s, t, ctx)) in keys.iter().enumerate() {
        cache.get_or_insert_with(s, t, ctx, |_, _, _| i as u64);
    }
    c.bench_function("tricache_concurrent_lookup", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let cache = cache.clone();
                    let keys = keys.clone();
                    std::thread::spawn(move || {
                        let mut acc = 0u64;
                        for &(s, t, ctx) in keys.iter() {
                            acc = acc.wrapping_add(cache.get(s, t, ctx).unwrap());
                        }
                        acc
                    })
                })
                .collect();
            let mut total = 0u64;
            for handle in handles {
                total = total.wrapping_add(handle.join().unwrap());
            }
            black_box(total)
        })
    });
}

fn bench_concurrent_lookup_dashmap(c: &mut Criterion) {
    let keys = Arc::new(triples());
    let map = Arc::new(DashMap::<Triple, u64>::with_capacity(16));
    for (i, &key) in keys.iter().enumerate() {
        map.insert(key, i as u64);
    }
    c.bench_function("dashmap_concurrent_lookup", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let map = map.clone();
                    let keys = keys.clone();
                    std::thread::spawn(move || {
                        let mut acc = 0u64;
                        for key in keys.iter() {
                            acc = acc.wrapping_add(*map.get(key).unwrap());
                        }
                        acc
                    })
                })
                .collect();
            let mut total = 0u64;
            for handle in handles {
                total = total.wrapping_add(handle.join().unwrap());
            }
            black_box(total)
        })
    });
}

criterion_group!(
    benches,
    bench_lookup_tricache,
    bench_lookup_dashmap,
    bench_lookup_hashmap,
    bench_concurrent_lookup_tricache,
    bench_concurrent_lookup_dashmap
);
criterion_main!(benches);
