use crate::error::RegressionError;
use ndarray::{ArrayBase, Data, Dimension};

/// Largest feature count an accumulator can be sized for.
pub const MAX_WIDTH: usize = u16::MAX as usize;

#[inline]
pub fn all_finite<S, D>(values: &ArrayBase<S, D>) -> bool
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    values.iter().all(|v| v.is_finite())
}

/// Rejects NaN and infinite entries before they reach any running sum.
///
/// A non-finite matrix can make the eigen solver loop indefinitely, so the check
/// happens on every row rather than once at finalization.
pub fn ensure_finite<S, D>(values: &ArrayBase<S, D>, what: &str) -> Result<(), RegressionError>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    if all_finite(values) {
        Ok(())
    } else {
        Err(RegressionError::InvalidInput(format!("{what} is not finite")))
    }
}

pub fn ensure_finite_scalar(value: f64, what: &str) -> Result<(), RegressionError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RegressionError::InvalidInput(format!("{what} is not finite")))
    }
}

/// Validates the width of a feature vector against an accumulator.
///
/// `current` is `None` while the accumulator is still the identity; the first row
/// must then lie in the `1..=MAX_WIDTH` domain. Afterwards every row has to match.
pub fn check_width(current: Option<usize>, found: usize) -> Result<(), RegressionError> {
    match current {
        None if found == 0 || found > MAX_WIDTH => Err(RegressionError::DomainError {
            found,
            limit: MAX_WIDTH,
        }),
        None => Ok(()),
        Some(width) if width != found => Err(RegressionError::IncompatibleState(format!(
            "row has {found} independent variables but the state was sized for {width}"
        ))),
        Some(_) => Ok(()),
    }
}

pub fn check_merge_width(left: usize, right: usize) -> Result<(), RegressionError> {
    if left == right {
        Ok(())
    } else {
        Err(RegressionError::IncompatibleState(format!(
            "cannot merge a state of width {left} with a state of width {right}"
        )))
    }
}
