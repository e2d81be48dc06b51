//! Property-based tests for the sampler, the candidate collector and the
//! exact-neighbor routine.

use std::collections::HashSet;

use ambit::{compute_ground_truth, find_nearest, DistanceMetric, KnnResultSet, Matrix, UniqueRandom};
use proptest::prelude::*;

/// Oracle: stable sort by distance, ties kept in index order, then slice
/// out `[skip, skip + nn)`.
fn sort_oracle(data: &Matrix, query: &[f32], nn: usize, skip: usize) -> Vec<usize> {
    let mut order: Vec<(usize, f32)> = data
        .iter_rows()
        .enumerate()
        .map(|(i, row)| (i, DistanceMetric::L2.distance(row, query)))
        .collect();
    order.sort_by(|a, b| a.1.total_cmp(&b.1));
    order
        .into_iter()
        .skip(skip)
        .take(nn)
        .map(|(i, _)| i)
        .collect()
}

prop_compose! {
    fn arb_matrix(max_rows: usize, dim: usize)(
        rows in prop::collection::vec(
            prop::collection::vec(-50.0f32..50.0, dim),
            1..max_rows,
        )
    ) -> Matrix {
        Matrix::from_rows(&rows).unwrap()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn sampler_emits_a_permutation(n in 0usize..256, seed in any::<u64>()) {
        let vals: Vec<usize> = UniqueRandom::with_seed(n, seed).collect();
        prop_assert_eq!(vals.len(), n);
        prop_assert!(vals.iter().all(|&v| v < n));
        let unique: HashSet<usize> = vals.iter().copied().collect();
        prop_assert_eq!(unique.len(), n);
    }

    #[test]
    fn sampler_reinit_rounds_both_satisfy_uniqueness(
        n in 1usize..128,
        seed in any::<u64>(),
    ) {
        let mut gen = UniqueRandom::with_seed(n, seed);
        let first: Vec<usize> = (&mut gen).collect();
        prop_assert_eq!(gen.next(), None);

        gen.init(n);
        let second: Vec<usize> = (&mut gen).collect();

        for round in [&first, &second] {
            let unique: HashSet<usize> = round.iter().copied().collect();
            prop_assert_eq!(unique.len(), n);
            prop_assert!(round.iter().all(|&v| v < n));
        }
    }

    #[test]
    fn collector_holds_the_smallest_distances(
        dists in prop::collection::vec(0.0f32..100.0, 1..64),
        k in 1usize..16,
    ) {
        let mut set = KnnResultSet::new(k);
        for (i, &d) in dists.iter().enumerate() {
            set.push(i, d);
        }

        let held: Vec<f32> = set.neighbors().iter().map(|n| n.dist).collect();
        prop_assert!(held.windows(2).all(|w| w[0] <= w[1]), "not ascending: {held:?}");

        let mut expected = dists.clone();
        expected.sort_by(f32::total_cmp);
        expected.truncate(k);
        prop_assert_eq!(held, expected);
    }

    #[test]
    fn collector_never_exceeds_capacity(
        dists in prop::collection::vec(0.0f32..100.0, 0..64),
        k in 0usize..8,
    ) {
        let mut set = KnnResultSet::new(k);
        for (i, &d) in dists.iter().enumerate() {
            set.push(i, d);
        }
        prop_assert!(set.len() <= k);
        prop_assert_eq!(set.len(), k.min(dists.len()));
    }

    #[test]
    fn find_nearest_matches_sort_oracle(
        data in arb_matrix(40, 4),
        query in prop::collection::vec(-50.0f32..50.0, 4),
        nn in 1usize..8,
        skip in 0usize..3,
    ) {
        let got = find_nearest(&data, &query, nn, skip, DistanceMetric::L2).unwrap();
        let expected = sort_oracle(&data, &query, nn, skip);
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn self_query_with_skip_excludes_identity(
        data in arb_matrix(30, 3),
        nn in 1usize..4,
    ) {
        // query every row against its own dataset; skip=1 must drop the
        // zero-distance self match when all rows are distinct
        // +0.0 canonicalizes -0.0 so value-equal rows count as duplicates
        let distinct: HashSet<Vec<u32>> = data
            .iter_rows()
            .map(|r| r.iter().map(|v| (v + 0.0).to_bits()).collect())
            .collect();
        prop_assume!(distinct.len() == data.rows());

        for i in 0..data.rows() {
            let got = find_nearest(&data, data.row(i), nn, 1, DistanceMetric::L2).unwrap();
            prop_assert!(!got.contains(&i));
        }
    }

    #[test]
    fn batch_ground_truth_matches_single_queries(
        data in arb_matrix(30, 3),
        queries in arb_matrix(8, 3),
    ) {
        let batch = compute_ground_truth(&data, &queries, 4, 0, DistanceMetric::L2).unwrap();
        prop_assert_eq!(batch.len(), queries.rows());
        for (i, row) in batch.iter().enumerate() {
            let single = find_nearest(&data, queries.row(i), 4, 0, DistanceMetric::L2).unwrap();
            prop_assert_eq!(row.clone(), single);
        }
    }
}
