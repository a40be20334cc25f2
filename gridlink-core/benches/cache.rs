use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gridlink_core::cache::{cache_id, Cache, CacheIndex, CacheKey};
use gridlink_core::property::{ObjectStore, PropertySpec};
use gridlink_core::{CommunicationType, ValueKind, VarMap};

criterion_group!(cache, hash_key, populate_index, write_cache);
criterion_main!(cache);

fn store(props: usize) -> ObjectStore {
    let mut store = ObjectStore::new();
    let specs = (0..props)
        .map(|n| PropertySpec::new(&format!("p{}", n), ValueKind::Float).with_value("1.5"))
        .collect();
    store.add_object("bench", specs).unwrap();
    store
}

fn hash_key(c: &mut Criterion) {
    let key = CacheKey {
        object: 1,
        offset: 64,
        size: 8,
        remote: "feeder.node_12.voltage_A".to_string(),
    };
    c.bench_function("cache_id", |b| b.iter(|| black_box(cache_id(&key, 0x10000))));
}

fn populate_index(c: &mut Criterion) {
    let store = store(200);
    let mut map = VarMap::new();
    for n in 0..200 {
        map.add(&format!("bench.p{} -> remote.p{}", n, n), CommunicationType::Unknown)
            .unwrap();
    }
    map.resolve(&store);

    c.bench_function("populate_index_200", |b| {
        b.iter(|| {
            let mut index = CacheIndex::new();
            let mut cache = Cache::new("write_cache");
            for entry in map.iter() {
                cache.add_item(&mut index, entry, None).unwrap();
            }
            black_box(index.modulo())
        })
    });
}

fn write_cache(c: &mut Criterion) {
    let store = store(50);
    let mut map = VarMap::new();
    for n in 0..50 {
        map.add(&format!("bench.p{} -> remote.p{}", n, n), CommunicationType::Unknown)
            .unwrap();
    }
    map.resolve(&store);
    let mut index = CacheIndex::new();
    let mut cache = Cache::new("write_cache");

    c.bench_function("write_cache_50", |b| {
        b.iter(|| {
            for entry in map.iter_mut() {
                cache.write(&mut index, entry, None).unwrap();
            }
        })
    });
}
