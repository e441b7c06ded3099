/// Default output dimensionality
pub const DEFAULT_NO_DIMS: usize = 2;

/// Default perplexity (effective neighborhood size)
pub const DEFAULT_PERPLEXITY: f64 = 30.0;

/// Default Barnes-Hut accuracy. 0.0 runs exact t-SNE.
pub const DEFAULT_THETA: f64 = 0.5;

/// Default iteration budget
pub const DEFAULT_MAX_ITER: usize = 1000;

/// Nearest neighbors per point, as a multiple of the perplexity
pub const NEIGHBORS_PER_PERPLEXITY: f64 = 3.0;

/// Bandwidth search: entropy tolerance (nats)
pub const BANDWIDTH_TOLERANCE: f64 = 1e-5;

/// Bandwidth search: bisection step budget
pub const BANDWIDTH_MAX_STEPS: usize = 200;

/// Floor applied to probabilities and Z before divisions and logarithms
pub const MIN_PROBABILITY: f64 = 1e-12;

/// Standard deviation of the random initial embedding
pub const INIT_STD_DEV: f64 = 1e-4;

/// Spatial index depth cap. Coincident points stop splitting here.
pub const MAX_TREE_DEPTH: usize = 48;

/// Largest supported embedding dimensionality
pub const MAX_EMBED_DIMS: usize = 3;

/// Child slots per tree node (2^MAX_EMBED_DIMS)
pub const MAX_CHILDREN: usize = 1 << MAX_EMBED_DIMS;
