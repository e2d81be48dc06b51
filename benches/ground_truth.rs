//! Benchmarks for exact ground-truth computation and ensemble queries.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ambit::{
    find_nearest, DistanceMetric, EnsembleIndex, EnsembleParams, Matrix, PartitioningIndex,
    SearchParams,
};

fn random_matrix(rows: usize, dim: usize, seed: u64) -> Matrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..rows * dim).map(|_| rng.random::<f32>()).collect();
    Matrix::new(data, rows, dim).unwrap()
}

fn bench_find_nearest(c: &mut Criterion) {
    let dataset = random_matrix(10_000, 32, 1);
    let query = random_matrix(1, 32, 2);

    c.bench_function("find_nearest/10k_x_32/k10", |b| {
        b.iter(|| {
            find_nearest(
                black_box(&dataset),
                black_box(query.row(0)),
                10,
                0,
                DistanceMetric::L2,
            )
            .unwrap()
        })
    });
}

fn bench_ensemble_search(c: &mut Criterion) {
    let dataset = random_matrix(10_000, 32, 3);
    let mut index = EnsembleIndex::with_data(
        &dataset,
        DistanceMetric::L2,
        EnsembleParams::default().with_seed(4),
    )
    .unwrap();
    index.build().unwrap();

    let query = random_matrix(1, 32, 5);
    let params = SearchParams {
        checks: 128,
        eps: 0.0,
    };

    c.bench_function("ensemble_search/10k_x_32/k10/checks128", |b| {
        b.iter(|| {
            index
                .knn_search(black_box(query.row(0)), 10, &params)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_find_nearest, bench_ensemble_search);
criterion_main!(benches);
