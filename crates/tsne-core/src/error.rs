use std::fmt;

/// Malformed or degenerate input. Aborts the run before optimization starts.
#[derive(Debug, Clone, PartialEq)]
pub enum InputError {
    TooFewPoints { n: usize },
    EmptyDimensions,
    RaggedRow { row: usize, expected: usize, found: usize },
    NonFinite { indices: Vec<usize> },
    DegenerateNeighborhood { indices: Vec<usize> },
    InvalidParameter { name: &'static str, reason: String },
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::TooFewPoints { n } => {
                write!(f, "need at least 2 points, got {n}")
            }
            InputError::EmptyDimensions => write!(f, "input points have zero dimensions"),
            InputError::RaggedRow {
                row,
                expected,
                found,
            } => write!(f, "row {row} has {found} values, expected {expected}"),
            InputError::NonFinite { indices } => {
                write!(f, "non-finite coordinates in points {}", preview(indices))
            }
            InputError::DegenerateNeighborhood { indices } => write!(
                f,
                "points with zero distinct neighbors: {}",
                preview(indices)
            ),
            InputError::InvalidParameter { name, reason } => {
                write!(f, "invalid parameter '{name}': {reason}")
            }
        }
    }
}

impl std::error::Error for InputError {}

#[derive(Debug, Clone, PartialEq)]
pub enum TsneError {
    Input(InputError),
    /// Non-finite gradient. The embedding is discarded, the run must restart.
    Numerical { iteration: usize, indices: Vec<usize> },
}

impl fmt::Display for TsneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsneError::Input(e) => write!(f, "input error: {e}"),
            TsneError::Numerical { iteration, indices } => write!(
                f,
                "non-finite gradient at iteration {iteration} for points {}",
                preview(indices)
            ),
        }
    }
}

impl std::error::Error for TsneError {}

impl From<InputError> for TsneError {
    fn from(e: InputError) -> Self {
        TsneError::Input(e)
    }
}

pub type Result<T> = std::result::Result<T, TsneError>;

/// First few indices, enough to locate the problem in a large dataset.
fn preview(indices: &[usize]) -> String {
    const SHOWN: usize = 8;
    let head: Vec<String> = indices.iter().take(SHOWN).map(|i| i.to_string()).collect();
    if indices.len() > SHOWN {
        format!("[{}, ... {} total]", head.join(", "), indices.len())
    } else {
        format!("[{}]", head.join(", "))
    }
}
