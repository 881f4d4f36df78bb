use crate::error::RegressionError;

/// Common surface of every sufficient-statistics state.
///
/// The identity element is `Default::default()`: no rows, no width, all sums
/// zero. `merge` must be commutative and associative up to floating-point
/// rounding, and merging with the identity must leave the other side unchanged.
pub trait Accumulator: Clone + Default {
    fn row_count(&self) -> u64;

    /// Number of features, `0` while the state is still the identity.
    fn width(&self) -> usize;

    fn is_identity(&self) -> bool {
        self.row_count() == 0
    }

    /// Folds `other` into `self`. On error `self` is left untouched.
    fn merge(&mut self, other: &Self) -> Result<(), RegressionError>;
}

/// Combines shard states with a balanced pairwise reduction.
///
/// An empty iterator yields the identity.
pub fn merge_all<A, I>(states: I) -> Result<A, RegressionError>
where
    A: Accumulator,
    I: IntoIterator<Item = A>,
{
    let mut level: Vec<A> = states.into_iter().collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut pending = level.into_iter();
        while let Some(mut left) = pending.next() {
            if let Some(right) = pending.next() {
                left.merge(&right)?;
            }
            next.push(left);
        }
        level = next;
    }
    Ok(level.pop().unwrap_or_default())
}
