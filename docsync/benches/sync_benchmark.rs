use criterion::{criterion_group, criterion_main, Criterion};
use docsync::{
    BroadcastRelay, CrdtDocument, DocumentId, DocumentRecord, DocumentStore, MemoryStore,
    RecordStore, StoreConfig, YrsDocument, DEFAULT_TEXT,
};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

/// A document with `edits` appended words and its full-state encoding.
fn edited_document(edits: usize) -> (YrsDocument, Vec<u8>) {
    let mut doc = YrsDocument::new();
    for i in 0..edits {
        doc.append_text(DEFAULT_TEXT, &format!("word{i} "));
    }
    let state = doc.encode_state();
    (doc, state)
}

fn bench_merge_small_delta(c: &mut Criterion) {
    let (base, state) = edited_document(1_000);
    let mut author = YrsDocument::load_state(&state).unwrap();
    let delta = author.append_text(DEFAULT_TEXT, "typed");
    drop(base);

    c.bench_function("merge_delta_into_1k_edit_doc", |b| {
        b.iter_batched(
            || YrsDocument::load_state(&state).unwrap(),
            |mut doc| {
                doc.apply_delta(black_box(&delta)).unwrap();
                black_box(doc);
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_encode_state(c: &mut Criterion) {
    let (doc, _) = edited_document(1_000);

    c.bench_function("encode_state_1k_edits", |b| {
        b.iter(|| black_box(doc.encode_state()))
    });
}

fn bench_load_state(c: &mut Criterion) {
    let (_, state) = edited_document(1_000);

    c.bench_function("load_state_1k_edits", |b| {
        b.iter(|| black_box(YrsDocument::load_state(black_box(&state)).unwrap()))
    });
}

fn bench_relay_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay_fanout");
    let payload = Arc::new(vec![7u8; 64]);

    for subscribers in [1usize, 10, 100] {
        let relay = BroadcastRelay::new(256);
        let origin = Uuid::new_v4();
        let _subscriptions: Vec<_> = (0..subscribers)
            .map(|_| relay.subscribe(Uuid::new_v4()))
            .collect();

        group.bench_function(format!("{subscribers}_peers"), |b| {
            b.iter(|| black_box(relay.relay_delta(origin, Arc::clone(&payload))))
        });
    }
    group.finish();
}

fn bench_memory_store_flush(c: &mut Criterion) {
    let store = MemoryStore::new();
    let (_, state) = edited_document(200);
    let mut record = DocumentRecord::new(DocumentId::parse("bench").unwrap(), "ws", "bench");
    record.content = state;

    c.bench_function("memory_store_put_document", |b| {
        b.iter(|| {
            record.version += 1;
            store.put_document(black_box(&record), None).unwrap();
        })
    });
}

fn bench_rocks_store_flush(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("docsync_bench_flush_{}", Uuid::new_v4()));
    let store = DocumentStore::open(StoreConfig::for_testing(&dir)).unwrap();
    let (_, state) = edited_document(200);
    let mut record = DocumentRecord::new(DocumentId::parse("bench").unwrap(), "ws", "bench");
    record.content = state;

    c.bench_function("rocks_store_put_document", |b| {
        b.iter(|| {
            record.version += 1;
            store.put_document(black_box(&record), None).unwrap();
        })
    });

    c.bench_function("rocks_store_load_document", |b| {
        b.iter(|| black_box(store.load_document(&record.id).unwrap()))
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_merge_small_delta,
    bench_encode_state,
    bench_load_state,
    bench_relay_fanout,
    bench_memory_store_flush,
    bench_rocks_store_flush,
);
criterion_main!(benches);
