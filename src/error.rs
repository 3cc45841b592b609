use thiserror::Error;

/// Result type for model construction and forward calls.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised at the model's interface boundaries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("output size {size} is not a multiple of {factor}")]
    ResolutionNotDivisible { size: usize, factor: usize },

    #[error("{what}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("non-finite value in {what}: {value}")]
    NonFinite { what: &'static str, value: f64 },
}

impl ModelError {
    pub(crate) fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        ModelError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
