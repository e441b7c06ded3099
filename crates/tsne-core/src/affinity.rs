//! Input-space affinities.
//!
//! Each point gets a Gaussian conditional distribution over its K nearest
//! neighbors, with a per-point bandwidth bisected until the distribution's
//! entropy matches log(perplexity). The conditionals are then symmetrized
//! into one joint distribution stored as a CSR sparse matrix.

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::constants::{BANDWIDTH_MAX_STEPS, BANDWIDTH_TOLERANCE};
use crate::error::InputError;
use crate::matrix::Matrix;
use crate::vptree::VpTree;

/// What to do with points whose neighbors all sit at distance zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegeneratePolicy {
    /// Uniform distribution over the neighbors, reported but not fatal.
    #[default]
    Fallback,
    /// Abort with `InputError::DegenerateNeighborhood`.
    Reject,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    /// Allowed |H - log(perplexity)| in nats.
    pub tolerance: f64,
    pub max_steps: usize,
    pub degenerate: DegeneratePolicy,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            tolerance: BANDWIDTH_TOLERANCE,
            max_steps: BANDWIDTH_MAX_STEPS,
            degenerate: DegeneratePolicy::default(),
        }
    }
}

/// Outcome of one bandwidth search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bandwidth {
    /// Gaussian precision, 1 / (2σ²).
    pub beta: f64,
    /// Entropy of the final distribution, in nats.
    pub entropy: f64,
    pub converged: bool,
}

/// Non-fatal findings of the affinity pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AffinityReport {
    /// Neighbors searched per point.
    pub neighbors: usize,
    /// Points whose bandwidth missed the tolerance within the step budget.
    pub unconverged: Vec<usize>,
    /// Points with zero distinct neighbors, given a uniform distribution.
    pub degenerate: Vec<usize>,
}

impl AffinityReport {
    pub fn is_clean(&self) -> bool {
        self.unconverged.is_empty() && self.degenerate.is_empty()
    }
}

/// Row-compressed sparse matrix of probabilities.
#[derive(Clone, Debug, PartialEq)]
pub struct Affinities {
    row_ptr: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
}

impl Affinities {
    pub fn n(&self) -> usize {
        self.row_ptr.len() - 1
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn row(&self, i: usize) -> (&[usize], &[f64]) {
        let range = self.row_ptr[i]..self.row_ptr[i + 1];
        (&self.cols[range.clone()], &self.values[range])
    }

    /// Entry (i, j), zero when absent. Columns are sorted within a row.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        let (cols, values) = self.row(i);
        cols.binary_search(&j).map(|pos| values[pos]).unwrap_or(0.0)
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.n()).flat_map(move |i| {
            let (cols, values) = self.row(i);
            cols.iter().zip(values).map(move |(&j, &v)| (i, j, v))
        })
    }

    /// Build from unsorted triplets. Duplicate (row, col) entries are summed.
    fn from_triplets(n: usize, mut triplets: Vec<(usize, usize, f64)>) -> Self {
        triplets.par_sort_unstable_by_key(|&(i, j, _)| (i, j));

        let mut row_ptr = vec![0usize; n + 1];
        let mut cols = Vec::with_capacity(triplets.len());
        let mut values: Vec<f64> = Vec::with_capacity(triplets.len());
        let mut last: Option<(usize, usize)> = None;

        for (i, j, v) in triplets {
            if last == Some((i, j)) {
                if let Some(tail) = values.last_mut() {
                    *tail += v;
                }
                continue;
            }
            last = Some((i, j));
            row_ptr[i + 1] += 1;
            cols.push(j);
            values.push(v);
        }
        for i in 0..n {
            row_ptr[i + 1] += row_ptr[i];
        }

        Self {
            row_ptr,
            cols,
            values,
        }
    }
}

/// Bisect the precision of a Gaussian over `sq_distances` until its entropy
/// matches ln(perplexity). Returns the normalized probabilities.
///
/// Distances are shifted by their minimum before exponentiation, which
/// leaves the normalized distribution unchanged and keeps the row sum ≥ 1.
pub fn calibrate_row(
    sq_distances: &[f64],
    perplexity: f64,
    config: &AffinityConfig,
) -> (Vec<f64>, Bandwidth) {
    let k = sq_distances.len();
    let target = perplexity.ln();
    let d_min = sq_distances.iter().copied().fold(f64::INFINITY, f64::min);
    let d_max = sq_distances.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if k == 0 {
        return (
            Vec::new(),
            Bandwidth {
                beta: 1.0,
                entropy: 0.0,
                converged: false,
            },
        );
    }

    // Equal distances: every bandwidth yields the same uniform row.
    if d_max - d_min <= 0.0 {
        let entropy = (k as f64).ln();
        return (
            vec![1.0 / k as f64; k],
            Bandwidth {
                beta: 1.0,
                entropy,
                converged: (entropy - target).abs() < config.tolerance,
            },
        );
    }

    let mut beta = 1.0;
    let mut min_beta = f64::NEG_INFINITY;
    let mut max_beta = f64::INFINITY;
    let mut probs = vec![0.0; k];
    let mut result = Bandwidth {
        beta,
        entropy: 0.0,
        converged: false,
    };

    for _ in 0..config.max_steps.max(1) {
        let mut sum_p = 0.0;
        let mut weighted = 0.0;
        for (p, &d) in probs.iter_mut().zip(sq_distances) {
            let shifted = d - d_min;
            *p = (-beta * shifted).exp();
            sum_p += *p;
            weighted += shifted * *p;
        }
        let entropy = sum_p.ln() + beta * weighted / sum_p;
        for p in probs.iter_mut() {
            *p /= sum_p;
        }
        result = Bandwidth {
            beta,
            entropy,
            converged: false,
        };

        let diff = entropy - target;
        if diff.abs() < config.tolerance {
            result.converged = true;
            break;
        }
        if diff > 0.0 {
            // Too flat: sharpen.
            min_beta = beta;
            beta = if max_beta.is_infinite() {
                beta * 2.0
            } else {
                (beta + max_beta) / 2.0
            };
        } else {
            max_beta = beta;
            beta = if min_beta.is_infinite() {
                beta / 2.0
            } else {
                (beta + min_beta) / 2.0
            };
        }
    }

    (probs, result)
}

/// Per-point conditional distributions p(j|i) over the `k` nearest neighbors.
pub fn conditional_affinities(
    data: &Matrix,
    perplexity: f64,
    k: usize,
    config: &AffinityConfig,
    rng: &mut impl Rng,
) -> Result<(Affinities, AffinityReport), InputError> {
    let n = data.rows();
    let tree = VpTree::build(data, rng);
    let neighbors = tree.knn_all(k);

    let rows: Vec<(Vec<f64>, Bandwidth, bool)> = neighbors
        .par_iter()
        .map(|hits| {
            let sq: Vec<f64> = hits.iter().map(|h| h.distance * h.distance).collect();
            let degenerate = sq.iter().all(|&d| d == 0.0);
            let (probs, bandwidth) = calibrate_row(&sq, perplexity, config);
            (probs, bandwidth, degenerate)
        })
        .collect();

    let mut report = AffinityReport {
        neighbors: k,
        ..AffinityReport::default()
    };
    let mut triplets = Vec::with_capacity(n * k);
    for (i, (hits, (probs, bandwidth, degenerate))) in neighbors.iter().zip(rows).enumerate() {
        if degenerate {
            report.degenerate.push(i);
        } else if !bandwidth.converged {
            report.unconverged.push(i);
        }
        triplets.extend(hits.iter().zip(probs).map(|(h, p)| (i, h.index, p)));
    }

    if !report.degenerate.is_empty() && config.degenerate == DegeneratePolicy::Reject {
        return Err(InputError::DegenerateNeighborhood {
            indices: report.degenerate,
        });
    }
    if !report.unconverged.is_empty() {
        tracing::warn!(
            "bandwidth search missed tolerance for {} of {n} points; using last bandwidth",
            report.unconverged.len()
        );
    }
    if !report.degenerate.is_empty() {
        tracing::warn!(
            "{} points have no distinct neighbors; using uniform affinities",
            report.degenerate.len()
        );
    }

    Ok((Affinities::from_triplets(n, triplets), report))
}

/// Joint distribution p_ij = (p(j|i) + p(i|j)) / (2N), normalized by the
/// actual total so it sums to one even when some rows are not exact.
pub fn symmetrize(conditional: &Affinities) -> Affinities {
    let n = conditional.n();
    let mut triplets = Vec::with_capacity(conditional.nnz() * 2);
    for (i, j, p) in conditional.iter() {
        if i == j {
            continue;
        }
        triplets.push((i, j, p));
        triplets.push((j, i, p));
    }
    let mut joint = Affinities::from_triplets(n, triplets);
    let total = joint.sum();
    if total > 0.0 {
        for v in &mut joint.values {
            *v /= total;
        }
    }
    joint
}

/// Full affinity pass: neighbor search, calibration, symmetrization.
pub fn joint_affinities(
    data: &Matrix,
    perplexity: f64,
    k: usize,
    config: &AffinityConfig,
    rng: &mut impl Rng,
) -> Result<(Affinities, AffinityReport), InputError> {
    let (conditional, report) = conditional_affinities(data, perplexity, k, config, rng)?;
    tracing::debug!(
        "conditional affinities: {} entries over {} points",
        conditional.nnz(),
        conditional.n()
    );
    Ok((symmetrize(&conditional), report))
}
