use std::borrow::Cow;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::affinity::{AffinityConfig, AffinityReport, joint_affinities};
use crate::constants::{
    DEFAULT_MAX_ITER, DEFAULT_NO_DIMS, DEFAULT_PERPLEXITY, DEFAULT_THETA, MAX_EMBED_DIMS,
    NEIGHBORS_PER_PERPLEXITY,
};
use crate::embedding::Embedding;
use crate::error::{InputError, Result};
use crate::gradient::Cost;
use crate::matrix::Matrix;
use crate::optimizer::{Optimizer, RunStatus, Schedule};

/// Starting layout of the embedding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Init {
    #[default]
    Random,
    Pca,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsneParams {
    pub perplexity: f64,
    /// Barnes-Hut accuracy; 0.0 runs exact t-SNE.
    pub theta: f64,
    pub no_dims: usize,
    pub max_iter: usize,
    /// Fixed seed for reproducible runs; `None` seeds from the OS.
    pub seed: Option<u64>,
    pub init: Init,
    /// Zero-mean the input and scale it into [-1, 1] before distances.
    pub normalize_input: bool,
    pub affinity: AffinityConfig,
    pub schedule: Schedule,
}

impl Default for TsneParams {
    fn default() -> Self {
        Self {
            perplexity: DEFAULT_PERPLEXITY,
            theta: DEFAULT_THETA,
            no_dims: DEFAULT_NO_DIMS,
            max_iter: DEFAULT_MAX_ITER,
            seed: None,
            init: Init::default(),
            normalize_input: true,
            affinity: AffinityConfig::default(),
            schedule: Schedule::default(),
        }
    }
}

impl TsneParams {
    /// Check the parameters against a dataset of `n` points.
    pub fn validate(&self, n: usize) -> std::result::Result<(), InputError> {
        let invalid = |name: &'static str, reason: String| {
            Err(InputError::InvalidParameter { name, reason })
        };

        if n < 2 {
            return Err(InputError::TooFewPoints { n });
        }
        if !(self.perplexity.is_finite() && self.perplexity > 0.0) {
            return invalid("perplexity", format!("must be positive, got {}", self.perplexity));
        }
        if ((n - 1) as f64) < NEIGHBORS_PER_PERPLEXITY * self.perplexity {
            return invalid(
                "perplexity",
                format!(
                    "{} is too large for {n} points (need N - 1 >= 3 * perplexity)",
                    self.perplexity
                ),
            );
        }
        if !(self.theta.is_finite() && self.theta >= 0.0) {
            return invalid("theta", format!("must be finite and >= 0, got {}", self.theta));
        }
        if !(2..=MAX_EMBED_DIMS).contains(&self.no_dims) {
            return invalid("no_dims", format!("must be 2 or 3, got {}", self.no_dims));
        }
        let s = &self.schedule;
        if !(s.learning_rate.is_finite() && s.learning_rate > 0.0) {
            return invalid("learning_rate", format!("must be positive, got {}", s.learning_rate));
        }
        if !(s.exaggeration.is_finite() && s.exaggeration > 0.0) {
            return invalid("exaggeration", format!("must be positive, got {}", s.exaggeration));
        }
        if !(s.min_gain > 0.0) {
            return invalid("min_gain", format!("must be positive, got {}", s.min_gain));
        }
        if !(self.affinity.tolerance > 0.0) {
            return invalid(
                "tolerance",
                format!("must be positive, got {}", self.affinity.tolerance),
            );
        }
        Ok(())
    }

    /// Neighbors per point: ⌊3·perplexity⌋, or everyone for exact t-SNE.
    pub fn neighbor_count(&self, n: usize) -> usize {
        let all = n.saturating_sub(1);
        if self.theta == 0.0 {
            return all;
        }
        ((NEIGHBORS_PER_PERPLEXITY * self.perplexity) as usize).clamp(1, all.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TsneResult {
    pub embedding: Embedding,
    /// KL divergence of the final embedding.
    pub cost: Cost,
    pub status: RunStatus,
    pub report: AffinityReport,
}

/// Barnes-Hut t-SNE runner.
#[derive(Clone, Debug, Default)]
pub struct Tsne {
    params: TsneParams,
}

impl Tsne {
    pub fn new(params: TsneParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &TsneParams {
        &self.params
    }

    pub fn run(&self, data: &Matrix) -> Result<TsneResult> {
        self.run_with_cancel(data, None)
    }

    /// Full pipeline. A set `cancel` flag ends the optimization at the next
    /// iteration boundary and returns the embedding as of that point.
    pub fn run_with_cancel(&self, data: &Matrix, cancel: Option<&AtomicBool>) -> Result<TsneResult> {
        let p = &self.params;
        let n = data.rows();
        p.validate(n)?;

        let bad = data.non_finite_rows();
        if !bad.is_empty() {
            return Err(InputError::NonFinite { indices: bad }.into());
        }

        let mut rng = match p.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };

        let data: Cow<'_, Matrix> = if p.normalize_input {
            let mut owned = data.clone();
            owned.normalize();
            Cow::Owned(owned)
        } else {
            Cow::Borrowed(data)
        };

        let k = p.neighbor_count(n);
        tracing::info!(
            "computing input similarities: N={n}, D={}, perplexity={}, K={k}",
            data.cols(),
            p.perplexity
        );
        let start = Instant::now();
        let (affinities, report) = joint_affinities(&data, p.perplexity, k, &p.affinity, &mut rng)?;
        tracing::info!(
            "input similarities computed in {:.2}s ({} non-zero entries)",
            start.elapsed().as_secs_f64(),
            affinities.nnz()
        );

        let embedding = match p.init {
            Init::Random => Embedding::random(n, p.no_dims, &mut rng)?,
            Init::Pca => Embedding::pca(&data, p.no_dims, &mut rng)?,
        };

        tracing::info!(
            "learning embedding: {} iterations, theta={}",
            p.max_iter,
            p.theta
        );
        let mut optimizer = Optimizer::new(&affinities, embedding, p.theta, p.schedule.clone());
        let status = optimizer.run(p.max_iter, cancel)?;
        let cost = optimizer.cost();

        Ok(TsneResult {
            embedding: optimizer.into_embedding(),
            cost,
            status,
            report,
        })
    }
}
