use criterion::{black_box, criterion_group, criterion_main, Criterion};

use podb::codec::AttrCodec;
use podb::database::{Database, DatabaseOptions};
use podb::error::CResult;
use podb::value::{AttrMap, Value};

fn sample_attrs() -> AttrMap {
    let mut attrs = AttrMap::new();
    attrs.insert("name".to_string(), Value::Str("alice".to_string()));
    attrs.insert("age".to_string(), Value::Int(30));
    attrs.insert("balance".to_string(), Value::Float(1.5));
    attrs.insert("active".to_string(), Value::Bool(true));
    attrs
}

fn bench_codec_round_trip(c: &mut Criterion) {
    let codec = AttrCodec::new();
    let attrs = sample_attrs();
    let encoded = codec.encode(&attrs, &[]).unwrap();

    c.bench_function("codec encode", |b| {
        b.iter(|| codec.encode(black_box(&attrs), &[]).unwrap())
    });

    struct NoRefs;
    impl podb::codec::RefResolver for NoRefs {
        fn resolve_ref(&self, _oid: podb::oid::Oid) -> CResult<podb::object::Handle> {
            unreachable!("sample attrs carry no object references")
        }
    }
    let refs = NoRefs;
    let blob_host: std::sync::Weak<dyn podb::blob::BlobHost> = std::sync::Weak::new();

    c.bench_function("codec decode", |b| {
        b.iter(|| codec.decode(black_box(&encoded), &[], &refs, blob_host.clone()).unwrap())
    });
}

fn bench_log_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_with(
        dir.path().join("bench.podb"),
        DatabaseOptions { create: true, lock: true, fsync: false },
    )
    .unwrap();

    let root = db.new_object(AttrMap::new());
    db.elect(&root);
    db.commit().unwrap();

    let mut counter = 0i64;
    c.bench_function("append transaction", |b| {
        b.iter(|| {
            counter += 1;
            db.checkout(&root).unwrap();
            root.set("counter".to_string(), Value::Int(black_box(counter))).unwrap();
            db.commit().unwrap();
        })
    });
}

fn bench_log_catch_up(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let writer = Database::open(dir.path().join("catchup.podb")).unwrap();
    let root = writer.new_object(AttrMap::new());
    writer.elect(&root);
    writer.commit().unwrap();
    for i in 0..100 {
        writer.checkout(&root).unwrap();
        root.set("n".to_string(), Value::Int(i)).unwrap();
        writer.commit().unwrap();
    }

    c.bench_function("catch up 100 transactions", |b| {
        b.iter(|| {
            let reader = Database::open(dir.path().join("catchup.podb")).unwrap();
            black_box(reader.tx_count());
        })
    });
}

criterion_group!(benches, bench_codec_round_trip, bench_log_append, bench_log_catch_up);
criterion_main!(benches);
