//! Performance benchmarks for stash-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stash_engine::{
    Candidate, FieldOperation, Matcher, ObjectId, ObjectState, OperationSet, Query,
    SubqueryResults, Value,
};

fn scores(count: usize) -> Vec<Candidate> {
    (0..count)
        .map(|i| {
            let id = format!("score_{i}");
            let state = ObjectState::from_fields(
                "GameScore",
                [
                    ("player", Value::from(format!("Player {}", i % 50))),
                    ("score", Value::from(i as i64 * 7 % 1000)),
                    ("cheatMode", Value::from(i % 10 == 0)),
                ],
            )
            .unwrap()
            .with_object_id(id.clone());
            Candidate::new(ObjectId::Server(id), state)
        })
        .collect()
}

fn bench_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("operations");

    group.bench_function("record_coalesce", |b| {
        b.iter(|| {
            let mut batch = OperationSet::new("b");
            for i in 0..100 {
                batch
                    .record(
                        black_box("score"),
                        FieldOperation::Increment { amount: i as f64 },
                    )
                    .unwrap();
            }
            batch
        })
    });

    group.bench_function("apply_batch", |b| {
        let state = ObjectState::new("GameScore");
        let mut batch = OperationSet::new("b");
        for i in 0..50 {
            batch
                .record(format!("field_{i}"), FieldOperation::Set { value: i.into() })
                .unwrap();
        }
        b.iter(|| batch.apply_to(black_box(&state)))
    });

    group.finish();
}

fn bench_local_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_query");

    for size in [100, 1000, 5000].iter() {
        let candidates = scores(*size);

        group.bench_with_input(BenchmarkId::new("filter_sort_page", size), size, |b, _| {
            let query = Query::new("GameScore")
                .where_greater_than("score", 500)
                .where_equal_to("cheatMode", false)
                .order_by_descending("score")
                .limit(20);
            let matcher = Matcher::new(&query, &SubqueryResults::new()).unwrap();
            b.iter(|| matcher.execute(black_box(candidates.clone())))
        });

        group.bench_with_input(BenchmarkId::new("count", size), size, |b, _| {
            let query = Query::new("GameScore").where_starts_with("player", "Player 1");
            let matcher = Matcher::new(&query, &SubqueryResults::new()).unwrap();
            b.iter(|| matcher.count(black_box(&candidates)))
        });
    }

    group.finish();
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoding");
    let state = scores(1).remove(0).state;

    group.bench_function("state_to_json", |b| {
        b.iter(|| serde_json::to_string(black_box(&state)))
    });

    let json = serde_json::to_string(&state).unwrap();
    group.bench_function("state_from_json", |b| {
        b.iter(|| serde_json::from_str::<ObjectState>(black_box(&json)))
    });

    group.finish();
}

criterion_group!(benches, bench_operations, bench_local_query, bench_encoding);
criterion_main!(benches);
