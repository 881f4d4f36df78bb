use crate::decomposition::DecompositionError;
use thiserror::Error;

/// Errors surfaced by accumulator transitions, merges and finalization.
///
/// None of these are recoverable inside the core: a failed row aborts the
/// aggregation it belongs to, and retrying (for example a Newton step with
/// different starting coefficients) is left to the caller.
#[derive(Debug, Error)]
pub enum RegressionError {
    /// Non-finite response or feature values, or a finalization request on
    /// sums that are no longer finite.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The feature vector on the first row does not fit the 16-bit width domain.
    #[error("number of independent variables must be between 1 and {limit} (found {found})")]
    DomainError { found: usize, limit: usize },

    /// Two states (or a state and a row) that cannot be combined.
    #[error("incompatible transition states: {0}")]
    IncompatibleState(String),

    /// The Newton step cannot be taken from the accumulated statistics.
    #[error("no solution found: {0}")]
    NoSolutionFound(String),

    #[error("decomposition of the accumulated matrix failed: {0}")]
    Decomposition(#[from] DecompositionError),
}
