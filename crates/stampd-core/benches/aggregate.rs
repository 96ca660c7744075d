use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stampd_core::{sha256, AggregateTree};

fn digests(n: u32) -> Vec<[u8; 32]> {
    (0..n).map(|i| sha256(&i.to_le_bytes())).collect()
}

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate");
    for n in [1u32, 1_000, 100_000] {
        let batch = digests(n);
        group.bench_with_input(BenchmarkId::new("build", n), &batch, |b, batch| {
            b.iter(|| AggregateTree::build(black_box(batch)).expect("build"))
        });

        let tree = AggregateTree::build(&batch).expect("build");
        group.bench_with_input(BenchmarkId::new("proof_last", n), &tree, |b, tree| {
            b.iter(|| tree.proof(black_box(tree.len() - 1)).expect("proof"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_aggregate);
criterion_main!(benches);
