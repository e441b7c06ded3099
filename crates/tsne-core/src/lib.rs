//! Barnes-Hut t-SNE embedding engine.
//!
//! Reduces N high-dimensional points to a 2-D or 3-D embedding that keeps
//! local neighborhoods intact. Input affinities are calibrated per point to
//! a target perplexity over its nearest neighbors (vantage-point tree), and
//! the embedding is optimized by momentum gradient descent whose repulsive
//! forces are approximated with a quadtree/octree rebuilt every iteration.
//!
//! No file or process I/O happens here; see `tsne-store` for exchange
//! formats and `tsne-cli` for the command-line front end.

pub mod affinity;
pub mod constants;
pub mod embedding;
pub mod error;
pub mod gradient;
pub mod matrix;
pub mod optimizer;
pub mod tree;
pub mod tsne;
pub mod vptree;

pub use affinity::{
    Affinities, AffinityConfig, AffinityReport, Bandwidth, DegeneratePolicy, calibrate_row,
    joint_affinities, symmetrize,
};
pub use constants::{
    DEFAULT_MAX_ITER, DEFAULT_NO_DIMS, DEFAULT_PERPLEXITY, DEFAULT_THETA, MIN_PROBABILITY,
};
pub use embedding::Embedding;
pub use error::{InputError, Result, TsneError};
pub use gradient::{Cost, Gradient, Repulsion, kl_divergence};
pub use matrix::Matrix;
pub use optimizer::{Optimizer, Phase, RunStatus, Schedule};
pub use tree::{Node, NodeId, SpaceTree};
pub use tsne::{Init, Tsne, TsneParams, TsneResult};
pub use vptree::{Neighbor, VpTree};
