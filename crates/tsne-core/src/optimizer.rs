use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::affinity::Affinities;
use crate::embedding::Embedding;
use crate::error::{Result, TsneError};
use crate::gradient::{Cost, Gradient, Repulsion, kl_divergence};
use crate::tree::SpaceTree;

/// Learning-rate, momentum, exaggeration and gain schedule.
///
/// Defaults follow van der Maaten's Barnes-Hut t-SNE reference settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    pub learning_rate: f64,
    /// Factor applied to the affinities during the early phase.
    pub exaggeration: f64,
    /// First iteration without exaggeration.
    pub stop_lying_iter: usize,
    pub momentum: f64,
    pub final_momentum: f64,
    /// First iteration using `final_momentum`.
    pub mom_switch_iter: usize,
    pub gain_increment: f64,
    pub gain_decay: f64,
    pub min_gain: f64,
    /// Move the centroid back to the origin after every update.
    pub recenter: bool,
    /// Log the KL cost every this many iterations. 0 disables.
    pub report_every: usize,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            learning_rate: 200.0,
            exaggeration: 12.0,
            stop_lying_iter: 250,
            momentum: 0.5,
            final_momentum: 0.8,
            mom_switch_iter: 250,
            gain_increment: 0.2,
            gain_decay: 0.8,
            min_gain: 0.01,
            recenter: true,
            report_every: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    EarlyExaggeration,
    Normal,
}

impl Schedule {
    pub fn phase_at(&self, iteration: usize) -> Phase {
        if iteration < self.stop_lying_iter {
            Phase::EarlyExaggeration
        } else {
            Phase::Normal
        }
    }

    pub fn exaggeration_at(&self, iteration: usize) -> f64 {
        match self.phase_at(iteration) {
            Phase::EarlyExaggeration => self.exaggeration,
            Phase::Normal => 1.0,
        }
    }

    pub fn momentum_at(&self, iteration: usize) -> f64 {
        if iteration < self.mom_switch_iter {
            self.momentum
        } else {
            self.final_momentum
        }
    }
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    /// Completed iterations.
    pub iterations: usize,
    /// Stopped early by the cancel flag.
    pub cancelled: bool,
}

/// Momentum gradient descent over the embedding.
pub struct Optimizer<'a> {
    p: &'a Affinities,
    embedding: Embedding,
    schedule: Schedule,
    theta: f64,
    velocity: Vec<f64>,
    gains: Vec<f64>,
    tree: SpaceTree,
    gradient: Gradient,
    iteration: usize,
}

impl<'a> Optimizer<'a> {
    /// `theta == 0.0` uses exact all-pairs repulsion and never builds a tree.
    pub fn new(p: &'a Affinities, embedding: Embedding, theta: f64, schedule: Schedule) -> Self {
        let len = embedding.as_slice().len();
        let gradient = Gradient::new(embedding.n(), embedding.dims());
        Self {
            p,
            embedding,
            schedule,
            theta,
            velocity: vec![0.0; len],
            gains: vec![1.0; len],
            tree: SpaceTree::default(),
            gradient,
            iteration: 0,
        }
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    pub fn into_embedding(self) -> Embedding {
        self.embedding
    }

    pub fn gains(&self) -> &[f64] {
        &self.gains
    }

    fn rebuild_tree(&mut self) {
        if self.theta > 0.0 {
            self.tree.rebuild(&self.embedding);
        }
    }

    /// One full iteration: rebuild, gradient, gain/velocity update, move.
    pub fn step(&mut self) -> Result<()> {
        let t = self.iteration;
        self.rebuild_tree();

        let exaggeration = self.schedule.exaggeration_at(t);
        let repulsion = repulsion_for(&self.tree, self.theta);
        self.gradient
            .evaluate(self.p, &self.embedding, repulsion, exaggeration);

        let bad = self.gradient.non_finite_points(self.embedding.dims());
        if !bad.is_empty() {
            return Err(TsneError::Numerical {
                iteration: t,
                indices: bad,
            });
        }

        let s = &self.schedule;
        let momentum = s.momentum_at(t);
        let coords = self.embedding.as_mut_slice();
        for (((y, v), gain), &g) in coords
            .iter_mut()
            .zip(self.velocity.iter_mut())
            .zip(self.gains.iter_mut())
            .zip(self.gradient.values())
        {
            // Opposite signs mean the gradient still points the way we are
            // already moving.
            *gain = if sign(g) != sign(*v) {
                *gain + s.gain_increment
            } else {
                *gain * s.gain_decay
            };
            *gain = gain.max(s.min_gain);
            *v = momentum * *v - s.learning_rate * *gain * g;
            *y += *v;
        }

        let bad = self.embedding.non_finite_points();
        if !bad.is_empty() {
            return Err(TsneError::Numerical {
                iteration: t,
                indices: bad,
            });
        }

        if s.recenter {
            self.embedding.recenter();
        }

        if t + 1 == s.stop_lying_iter {
            tracing::debug!("iteration {t}: early exaggeration off");
        }
        if t + 1 == s.mom_switch_iter {
            tracing::debug!("iteration {t}: momentum -> {}", s.final_momentum);
        }

        self.iteration += 1;
        Ok(())
    }

    /// KL divergence of the current embedding.
    pub fn cost(&mut self) -> Cost {
        self.rebuild_tree();
        kl_divergence(self.p, &self.embedding, repulsion_for(&self.tree, self.theta))
    }

    /// Iterate until `max_iter` total iterations have run. The cancel flag is
    /// checked between iterations only, so the embedding always reflects a
    /// completed update.
    pub fn run(&mut self, max_iter: usize, cancel: Option<&AtomicBool>) -> Result<RunStatus> {
        let start = Instant::now();
        let mut last_report = Instant::now();

        while self.iteration < max_iter {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                tracing::info!("cancelled after {} iterations", self.iteration);
                return Ok(RunStatus {
                    iterations: self.iteration,
                    cancelled: true,
                });
            }

            self.step()?;

            let t = self.iteration;
            let every = self.schedule.report_every;
            if every > 0 && (t % every == 0 || t == max_iter) {
                let cost = self.cost();
                tracing::info!(
                    "iteration {t}: error is {:.6} ({:.2}s)",
                    cost.total,
                    last_report.elapsed().as_secs_f64()
                );
                last_report = Instant::now();
            }
        }

        tracing::info!(
            "fitting performed in {:.2}s over {} iterations",
            start.elapsed().as_secs_f64(),
            self.iteration
        );
        Ok(RunStatus {
            iterations: self.iteration,
            cancelled: false,
        })
    }
}

fn repulsion_for(tree: &SpaceTree, theta: f64) -> Repulsion<'_> {
    if theta > 0.0 {
        Repulsion::BarnesHut { tree, theta }
    } else {
        Repulsion::Exact
    }
}

fn sign(x: f64) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}
