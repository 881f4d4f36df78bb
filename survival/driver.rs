//! Outer Newton loop for the Cox model.
//!
//! Each iteration is one complete pass over the data: the caller folds every
//! shard starting from the previous finalized state, merges the shards, and
//! hands back the merged accumulator. Iterations are strictly sequential
//! because the coefficients of step `k` drive every transition of step `k + 1`.

use crate::config::NewtonConfig;
use crate::decomposition::SymmetricDecomposer;
use crate::error::RegressionError;
use crate::survival::cox::{CoxResult, CoxState};

/// Outcome of [`run_newton`].
#[derive(Debug, Clone)]
pub struct CoxFit {
    /// Last finalized state.
    pub state: CoxState,
    pub result: CoxResult,
    pub iterations: usize,
    pub converged: bool,
}

/// Repeats transition → merge → final until the log-likelihood settles.
///
/// `pass` receives the finalized state of the previous step (`None` on the
/// first step) and must return the fully merged accumulator of one pass over
/// all rows.
pub fn run_newton<D, P>(
    config: &NewtonConfig,
    decomposer: &D,
    mut pass: P,
) -> Result<CoxFit, RegressionError>
where
    D: SymmetricDecomposer + ?Sized,
    P: FnMut(Option<&CoxState>) -> Result<CoxState, RegressionError>,
{
    let mut previous: Option<CoxState> = None;

    for iteration in 1..=config.max_iterations {
        let merged = pass(previous.as_ref())?;
        let Some(finalized) = merged.finalize(decomposer)? else {
            return Err(RegressionError::NoSolutionFound(
                "Newton pass did not aggregate any rows".to_string(),
            ));
        };

        let distance = previous
            .as_ref()
            .map(|prior| finalized.distance(prior))
            .unwrap_or(f64::INFINITY);
        log::info!(
            "Cox iteration {iteration}: log-likelihood={:.10}, distance={distance:.3e}",
            finalized.log_likelihood
        );

        if distance < config.tolerance {
            let result = finalized.result(decomposer)?;
            return Ok(CoxFit {
                state: finalized,
                result,
                iterations: iteration,
                converged: true,
            });
        }
        previous = Some(finalized);
    }

    log::warn!(
        "Cox regression did not converge within {} iterations (tolerance {:.1e})",
        config.max_iterations,
        config.tolerance
    );
    let Some(state) = previous else {
        return Err(RegressionError::NoSolutionFound(
            "no Newton iteration was run".to_string(),
        ));
    };
    let result = state.result(decomposer)?;
    Ok(CoxFit {
        state,
        result,
        iterations: config.max_iterations,
        converged: false,
    })
}
