//! End-to-end tests through the public API:
//! raw matrix → affinities → optimization → embedding.

use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tsne_core::{
    AffinityConfig, DegeneratePolicy, Embedding, InputError, Matrix, NodeId, SpaceTree, Tsne,
    TsneError, TsneParams, joint_affinities,
};

fn gauss(rng: &mut SmallRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// `clusters` Gaussian blobs in `dims` dimensions, returned with labels.
fn gaussian_clusters(
    clusters: usize,
    per_cluster: usize,
    dims: usize,
    seed: u64,
) -> (Matrix, Vec<usize>) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let centers: Vec<Vec<f64>> = (0..clusters)
        .map(|_| (0..dims).map(|_| gauss(&mut rng) * 5.0).collect())
        .collect();
    let mut rows = Vec::with_capacity(clusters * per_cluster);
    let mut labels = Vec::with_capacity(clusters * per_cluster);
    for (label, center) in centers.iter().enumerate() {
        for _ in 0..per_cluster {
            rows.push(center.iter().map(|c| c + gauss(&mut rng)).collect::<Vec<f64>>());
            labels.push(label);
        }
    }
    (Matrix::from_rows(&rows).unwrap(), labels)
}

fn distance(e: &Embedding, i: usize, j: usize) -> f64 {
    e.point(i)
        .iter()
        .zip(e.point(j))
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt()
}

/// (mean intra-cluster distance, mean inter-cluster distance)
fn cluster_distances(e: &Embedding, labels: &[usize]) -> (f64, f64) {
    let (mut intra, mut intra_n, mut inter, mut inter_n) = (0.0, 0usize, 0.0, 0usize);
    for i in 0..e.n() {
        for j in (i + 1)..e.n() {
            let d = distance(e, i, j);
            if labels[i] == labels[j] {
                intra += d;
                intra_n += 1;
            } else {
                inter += d;
                inter_n += 1;
            }
        }
    }
    (intra / intra_n as f64, inter / inter_n as f64)
}

/// Test 1: three well-separated clusters in 50-D stay separated in 2-D.
#[test]
fn three_clusters_separate_across_seeds() {
    let (data, labels) = gaussian_clusters(3, 50, 50, 2024);

    for seed in [1, 2, 3] {
        let params = TsneParams {
            perplexity: 20.0,
            theta: 0.5,
            max_iter: 1000,
            seed: Some(seed),
            ..TsneParams::default()
        };
        let result = Tsne::new(params).run(&data).unwrap();
        assert!(result.report.is_clean(), "{:?}", result.report);
        assert!(result.embedding.as_slice().iter().all(|v| v.is_finite()));

        let (intra, inter) = cluster_distances(&result.embedding, &labels);
        assert!(
            intra < inter,
            "seed {seed}: intra {intra:.3} should be below inter {inter:.3}"
        );
    }
}

/// Test 2: exact t-SNE (θ = 0) separates the clusters too.
#[test]
fn exact_mode_separates_clusters() {
    let (data, labels) = gaussian_clusters(3, 20, 10, 99);
    let params = TsneParams {
        perplexity: 5.0,
        theta: 0.0,
        max_iter: 400,
        seed: Some(5),
        ..TsneParams::default()
    };
    let result = Tsne::new(params).run(&data).unwrap();
    assert_eq!(result.report.neighbors, 59);
    let (intra, inter) = cluster_distances(&result.embedding, &labels);
    assert!(intra < inter, "intra {intra:.3} vs inter {inter:.3}");
}

/// Test 3: a duplicated input point neither crashes nor explodes.
#[test]
fn duplicate_points_stay_finite_and_close() {
    let mut rng = SmallRng::seed_from_u64(17);
    let mut rows: Vec<Vec<f64>> = (0..40)
        .map(|_| (0..8).map(|_| rng.random::<f64>()).collect())
        .collect();
    rows[1] = rows[0].clone();
    let data = Matrix::from_rows(&rows).unwrap();

    let params = TsneParams {
        perplexity: 5.0,
        max_iter: 300,
        seed: Some(8),
        ..TsneParams::default()
    };
    let result = Tsne::new(params).run(&data).unwrap();
    let e = &result.embedding;
    assert!(e.as_slice().iter().all(|v| v.is_finite()));
    assert!(result.cost.total.is_finite());

    let pair = distance(e, 0, 1);
    let mut total = 0.0;
    let mut count = 0;
    for i in 0..e.n() {
        for j in (i + 1)..e.n() {
            total += distance(e, i, j);
            count += 1;
        }
    }
    let mean = total / count as f64;
    assert!(pair < mean, "duplicate pair {pair:.3} vs mean {mean:.3}");
}

/// Test 4: an all-identical dataset runs under the fallback policy and is
/// refused under the reject policy.
#[test]
fn identical_dataset_policies() {
    let data = Matrix::from_rows(&vec![vec![2.0, -1.0, 0.5]; 12]).unwrap();
    let params = TsneParams {
        perplexity: 2.0,
        max_iter: 100,
        seed: Some(4),
        ..TsneParams::default()
    };
    let result = Tsne::new(params.clone()).run(&data).unwrap();
    assert_eq!(result.report.degenerate.len(), 12);
    assert!(result.embedding.as_slice().iter().all(|v| v.is_finite()));

    let strict = TsneParams {
        affinity: AffinityConfig {
            degenerate: DegeneratePolicy::Reject,
            ..AffinityConfig::default()
        },
        ..params
    };
    match Tsne::new(strict).run(&data) {
        Err(TsneError::Input(InputError::DegenerateNeighborhood { indices })) => {
            assert_eq!(indices.len(), 12);
        }
        other => panic!("expected degenerate error, got {other:?}"),
    }
}

/// Test 5: too few points is an input error, not a panic.
#[test]
fn single_point_rejected() {
    let data = Matrix::from_rows(&[vec![1.0, 2.0]]).unwrap();
    let err = Tsne::new(TsneParams::default()).run(&data).unwrap_err();
    assert_eq!(err, TsneError::Input(InputError::TooFewPoints { n: 1 }));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn joint_affinities_form_symmetric_distribution(
        seed in any::<u64>(),
        n in 12usize..60,
        dims in 1usize..6,
        perplexity in 1.5f64..3.5,
    ) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let flat: Vec<f64> = (0..n * dims).map(|_| rng.random::<f64>() * 10.0).collect();
        let data = Matrix::from_flat(n, dims, flat).unwrap();
        let k = (3.0 * perplexity) as usize;
        let (p, _) = joint_affinities(&data, perplexity, k, &AffinityConfig::default(), &mut rng).unwrap();

        prop_assert!((p.sum() - 1.0).abs() < 1e-9);
        for (i, j, v) in p.iter() {
            prop_assert!(i != j);
            prop_assert!(v >= 0.0);
            prop_assert!((v - p.get(j, i)).abs() < 1e-15);
        }
    }

    #[test]
    fn tree_aggregates_match_children(
        seed in any::<u64>(),
        n in 1usize..200,
        dims in 2usize..=3,
    ) {
        let mut rng = SmallRng::seed_from_u64(seed);
        // Coarse grid values force plenty of coincident points.
        let coords: Vec<f64> = (0..n * dims).map(|_| rng.random_range(0..6) as f64).collect();
        let e = Embedding::from_flat(n, dims, coords).unwrap();
        let tree = SpaceTree::build(&e);

        prop_assert_eq!(tree.node(NodeId::ROOT).mass(), n);
        for node in tree.nodes() {
            if node.is_leaf() {
                continue;
            }
            let mass: usize = node.children().map(|c| tree.node(c).mass()).sum();
            prop_assert_eq!(node.mass(), mass);
            for d in 0..dims {
                let weighted: f64 = node
                    .children()
                    .map(|c| tree.node(c).centroid()[d] * tree.node(c).mass() as f64)
                    .sum();
                prop_assert!((node.centroid()[d] - weighted / mass as f64).abs() < 1e-9);
            }
        }
    }
}
