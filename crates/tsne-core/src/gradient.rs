//! KL-divergence gradient of the embedding.
//!
//! gradient_i = Σ_j p_ij q̂_ij (y_i − y_j) − (1/Z) Σ_j q̂_ij² (y_i − y_j)
//! with q̂_ij = (1 + ‖y_i − y_j‖²)⁻¹ and Z = Σ_{i≠j} q̂_ij. The constant
//! factor 4 of the analytic gradient is folded into the learning rate.
//!
//! The attractive sum runs over the sparse affinities only; the repulsive
//! sum goes through the Barnes-Hut tree, or over all pairs when θ = 0.
//! Both passes are data-parallel over points with disjoint output rows.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::affinity::Affinities;
use crate::constants::MIN_PROBABILITY;
use crate::embedding::Embedding;
use crate::tree::SpaceTree;

/// Source of the repulsive forces.
#[derive(Clone, Copy, Debug)]
pub enum Repulsion<'a> {
    BarnesHut { tree: &'a SpaceTree, theta: f64 },
    Exact,
}

impl Repulsion<'_> {
    fn accumulate(&self, coords: &[f64], index: usize, dims: usize, force: &mut [f64]) -> f64 {
        match self {
            Repulsion::BarnesHut { tree, theta } => {
                tree.accumulate_repulsion(coords, index, *theta, force)
            }
            Repulsion::Exact => exact_repulsion(coords, index, dims, force),
        }
    }
}

/// All-pairs repulsion for one point. Returns its share of Z.
pub fn exact_repulsion(coords: &[f64], index: usize, dims: usize, force: &mut [f64]) -> f64 {
    force.fill(0.0);
    let target = &coords[index * dims..(index + 1) * dims];
    let mut sum_q = 0.0;
    for (j, other) in coords.chunks_exact(dims).enumerate() {
        if j == index {
            continue;
        }
        let dist_sq: f64 = target.iter().zip(other).map(|(a, b)| (a - b) * (a - b)).sum();
        let q = 1.0 / (1.0 + dist_sq);
        sum_q += q;
        for (f, (a, b)) in force.iter_mut().zip(target.iter().zip(other)) {
            *f += q * q * (a - b);
        }
    }
    sum_q
}

/// Attractive forces Σ_j exaggeration · p_ij · q̂_ij · (y_i − y_j), into `out`.
pub fn attractive_forces(p: &Affinities, embedding: &Embedding, exaggeration: f64, out: &mut [f64]) {
    let dims = embedding.dims();
    let coords = embedding.as_slice();
    out.par_chunks_mut(dims).enumerate().for_each(|(i, force)| {
        force.fill(0.0);
        let target = &coords[i * dims..(i + 1) * dims];
        let (cols, values) = p.row(i);
        for (&j, &p_ij) in cols.iter().zip(values) {
            let other = &coords[j * dims..(j + 1) * dims];
            let dist_sq: f64 = target.iter().zip(other).map(|(a, b)| (a - b) * (a - b)).sum();
            let mult = exaggeration * p_ij / (1.0 + dist_sq);
            for (f, (a, b)) in force.iter_mut().zip(target.iter().zip(other)) {
                *f += mult * (a - b);
            }
        }
    });
}

/// Unnormalized repulsive forces into `out`. Returns Z.
pub fn repulsive_forces(embedding: &Embedding, repulsion: Repulsion<'_>, out: &mut [f64]) -> f64 {
    let dims = embedding.dims();
    let coords = embedding.as_slice();
    let partial: Vec<f64> = out
        .par_chunks_mut(dims)
        .enumerate()
        .map(|(i, force)| repulsion.accumulate(coords, i, dims, force))
        .collect();
    // Fixed summation order: a seeded run must reproduce bit for bit.
    partial.iter().sum()
}

/// Gradient buffers reused across iterations.
#[derive(Clone, Debug, Default)]
pub struct Gradient {
    values: Vec<f64>,
    repulsive: Vec<f64>,
    z: f64,
}

impl Gradient {
    pub fn new(n: usize, dims: usize) -> Self {
        Self {
            values: vec![0.0; n * dims],
            repulsive: vec![0.0; n * dims],
            z: 0.0,
        }
    }

    /// Recompute the gradient for the current embedding.
    pub fn evaluate(
        &mut self,
        p: &Affinities,
        embedding: &Embedding,
        repulsion: Repulsion<'_>,
        exaggeration: f64,
    ) {
        let len = embedding.as_slice().len();
        self.values.resize(len, 0.0);
        self.repulsive.resize(len, 0.0);

        attractive_forces(p, embedding, exaggeration, &mut self.values);
        let z = repulsive_forces(embedding, repulsion, &mut self.repulsive).max(MIN_PROBABILITY);
        self.values
            .par_iter_mut()
            .zip(self.repulsive.par_iter())
            .for_each(|(g, r)| *g -= r / z);
        self.z = z;
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Normalization constant of the last evaluation.
    pub fn z(&self) -> f64 {
        self.z
    }

    /// Points with a NaN or infinite gradient component.
    pub fn non_finite_points(&self, dims: usize) -> Vec<usize> {
        self.values
            .chunks_exact(dims)
            .enumerate()
            .filter(|(_, g)| g.iter().any(|v| !v.is_finite()))
            .map(|(i, _)| i)
            .collect()
    }
}

/// KL(P ‖ Q), total and per point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub total: f64,
    pub per_point: Vec<f64>,
}

/// Σ_ij p_ij ln(p_ij / q_ij) over the non-zero affinities. Z comes from the
/// same repulsion source as the gradient, so under Barnes-Hut it is an
/// approximation too.
pub fn kl_divergence(p: &Affinities, embedding: &Embedding, repulsion: Repulsion<'_>) -> Cost {
    let dims = embedding.dims();
    let coords = embedding.as_slice();
    let mut scratch = vec![0.0; coords.len()];
    let z = repulsive_forces(embedding, repulsion, &mut scratch).max(MIN_PROBABILITY);

    let per_point: Vec<f64> = (0..embedding.n())
        .into_par_iter()
        .map(|i| {
            let target = &coords[i * dims..(i + 1) * dims];
            let (cols, values) = p.row(i);
            cols.iter()
                .zip(values)
                .map(|(&j, &p_ij)| {
                    let other = &coords[j * dims..(j + 1) * dims];
                    let dist_sq: f64 =
                        target.iter().zip(other).map(|(a, b)| (a - b) * (a - b)).sum();
                    let q_ij = 1.0 / (1.0 + dist_sq) / z;
                    p_ij * (p_ij.max(MIN_PROBABILITY) / q_ij.max(MIN_PROBABILITY)).ln()
                })
                .sum()
        })
        .collect();

    Cost {
        total: per_point.iter().sum(),
        per_point,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::{AffinityConfig, joint_affinities};
    use crate::matrix::Matrix;
    use approx::assert_relative_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(11)
    }

    fn setup(n: usize) -> (Affinities, Embedding) {
        let mut rng = rng();
        let data: Vec<f64> = (0..n * 5).map(|_| rng.random::<f64>()).collect();
        let data = Matrix::from_flat(n, 5, data).unwrap();
        let (p, _) =
            joint_affinities(&data, 5.0, 15, &AffinityConfig::default(), &mut rng).unwrap();
        let coords = (0..n * 2).map(|_| rng.random::<f64>() * 4.0 - 2.0).collect();
        (p, Embedding::from_flat(n, 2, coords).unwrap())
    }

    /// Brute-force gradient straight from the definition.
    fn reference_gradient(p: &Affinities, e: &Embedding) -> Vec<f64> {
        let n = e.n();
        let q = |i: usize, j: usize| {
            let d: f64 = (0..2).map(|k| (e.point(i)[k] - e.point(j)[k]).powi(2)).sum();
            1.0 / (1.0 + d)
        };
        let mut z = 0.0;
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    z += q(i, j);
                }
            }
        }
        let mut grad = vec![0.0; n * 2];
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let qij = q(i, j);
                let coef = p.get(i, j) * qij - qij * qij / z;
                for k in 0..2 {
                    grad[i * 2 + k] += coef * (e.point(i)[k] - e.point(j)[k]);
                }
            }
        }
        grad
    }

    #[test]
    fn test_exact_gradient_matches_definition() {
        let (p, e) = setup(40);
        let mut g = Gradient::new(40, 2);
        g.evaluate(&p, &e, Repulsion::Exact, 1.0);
        let expected = reference_gradient(&p, &e);
        for (a, b) in g.values().iter().zip(&expected) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_barnes_hut_close_to_exact() {
        let (p, e) = setup(200);
        let tree = SpaceTree::build(&e);
        let mut exact = Gradient::new(200, 2);
        exact.evaluate(&p, &e, Repulsion::Exact, 1.0);
        let mut approx = Gradient::new(200, 2);
        approx.evaluate(&p, &e, Repulsion::BarnesHut { tree: &tree, theta: 0.5 }, 1.0);

        let norm: f64 = exact.values().iter().map(|v| v * v).sum::<f64>().sqrt();
        let err: f64 = exact
            .values()
            .iter()
            .zip(approx.values())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        assert!(err / norm < 0.1, "relative error {}", err / norm);
        assert_relative_eq!(approx.z(), exact.z(), max_relative = 0.05);
    }

    #[test]
    fn test_gradient_sums_to_zero() {
        // Forces are pairwise antisymmetric, so the net force vanishes.
        let (p, e) = setup(60);
        let mut g = Gradient::new(60, 2);
        g.evaluate(&p, &e, Repulsion::Exact, 12.0);
        for k in 0..2 {
            let net: f64 = g.values().iter().skip(k).step_by(2).sum();
            assert!(net.abs() < 1e-10, "net force {net}");
        }
    }

    #[test]
    fn test_exaggeration_scales_attraction_only() {
        let (p, e) = setup(30);
        let mut a1 = vec![0.0; 60];
        let mut a4 = vec![0.0; 60];
        attractive_forces(&p, &e, 1.0, &mut a1);
        attractive_forces(&p, &e, 4.0, &mut a4);
        for (x, y) in a1.iter().zip(&a4) {
            assert_relative_eq!(x * 4.0, *y, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_kl_divergence_non_negative_and_finite() {
        let (p, e) = setup(50);
        let cost = kl_divergence(&p, &e, Repulsion::Exact);
        assert!(cost.total.is_finite());
        assert!(cost.total >= 0.0, "KL {}", cost.total);
        assert_eq!(cost.per_point.len(), 50);
        assert_relative_eq!(cost.per_point.iter().sum::<f64>(), cost.total, epsilon = 1e-12);
    }

    #[test]
    fn test_coincident_points_finite_gradient() {
        let (p, e) = setup(20);
        let mut coords = e.as_slice().to_vec();
        coords[2] = coords[0];
        coords[3] = coords[1];
        let e = Embedding::from_flat(20, 2, coords).unwrap();
        let tree = SpaceTree::build(&e);
        let mut g = Gradient::new(20, 2);
        g.evaluate(&p, &e, Repulsion::BarnesHut { tree: &tree, theta: 0.5 }, 1.0);
        assert!(g.non_finite_points(2).is_empty());
    }
}
