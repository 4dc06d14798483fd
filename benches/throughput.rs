use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::HashMap;

use vectormap_rs::{Config, VectorMap};

fn bench_reput_get_delete_vectormap(c: &mut Criterion) {
    c.bench_function("vectormap_reput_get_delete", |b| {
        b.iter(|| {
            let m = VectorMap::new(Config {
                mem_cap: 64 << 20,
                num_shards: 8,
                capacity_hint: 8192,
                ..Config::default()
            });
            for i in 0..50_000u64 {
                m.reput(&i.to_le_bytes(), &i.to_le_bytes());
            }
            for i in 0..50_000u64 {
                let _ = m.get(&i.to_le_bytes());
            }
            for i in 0..50_000u64 {
                let _ = m.delete(&i.to_le_bytes());
            }
            black_box(m.items())
        })
    });
}

fn bench_reput_get_delete_hashmap(c: &mut Criterion) {
    c.bench_function("hashmap_insert_get_remove", |b| {
        b.iter(|| {
            let mut m: HashMap<Vec<u8>, Vec<u8>> = HashMap::with_capacity(8192);
            for i in 0..50_000u64 {
                m.insert(i.to_le_bytes().to_vec(), i.to_le_bytes().to_vec());
            }
            for i in 0..50_000u64 {
                let _ = m.get(i.to_le_bytes().as_slice());
            }
            for i in 0..50_000u64 {
                let _ = m.remove(i.to_le_bytes().as_slice());
            }
            black_box(m.len())
        })
    });
}

fn bench_hot_reads(c: &mut Criterion) {
    let m = VectorMap::new(Config {
        mem_cap: 64 << 20,
        num_shards: 8,
        capacity_hint: 8192,
        ..Config::default()
    });
    for i in 0..10_000u64 {
        m.reput(&i.to_le_bytes(), &[0u8; 64]);
    }

    c.bench_function("vectormap_get_hot", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            black_box(m.get(&i.to_le_bytes()))
        })
    });

    c.bench_function("vectormap_has_hot", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            black_box(m.has(&i.to_le_bytes()))
        })
    });
}

fn bench_in_place_update(c: &mut Criterion) {
    let m = VectorMap::new(Config {
        mem_cap: 64 << 20,
        num_shards: 8,
        capacity_hint: 1024,
        ..Config::default()
    });
    for i in 0..1_000u64 {
        m.reput(&i.to_le_bytes(), &[0u8; 32]);
    }

    c.bench_function("vectormap_put_in_place", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 1_000;
            black_box(m.put(&i.to_le_bytes(), &[i as u8; 32]))
        })
    });
}

criterion_group!(
    benches,
    bench_reput_get_delete_vectormap,
    bench_reput_get_delete_hashmap,
    bench_hot_reads,
    bench_in_place_update
);
criterion_main!(benches);
