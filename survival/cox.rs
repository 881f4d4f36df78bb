//! Newton-Raphson state for the Cox proportional-hazards model.
//!
//! One pass over the data (rows ordered by descending event time) accumulates
//! the gradient and Hessian of the partial log-likelihood at a fixed
//! coefficient vector. The running `S = Σ exp(βᵀx)` and `H = Σ exp(βᵀx)·x` are
//! the risk-set sums at the current row, which is why the contribution of each
//! row uses the running values rather than totals.
//!
//! `coef` is carried across Newton steps. Every other statistic belongs to a
//! single step and starts from zero when the next step is seeded.

use crate::accumulator::Accumulator;
use crate::decomposition::SymmetricDecomposer;
use crate::error::RegressionError;
use crate::guards::{all_finite, check_merge_width, check_width, ensure_finite};
use crate::inference::{normal_two_sided, ratio_or_zero, standard_errors};
use crate::packing::{PackedReader, PackedWriter};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Zip};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoxState {
    pub num_rows: u64,
    pub width: usize,
    /// Coefficients the current pass is evaluated at.
    pub coef: Array1<f64>,

    /// Running `Σ exp(βᵀx)`.
    pub s: f64,
    /// Running `Σ exp(βᵀx)·x`.
    pub h: Array1<f64>,
    pub grad: Array1<f64>,
    pub log_likelihood: f64,
    /// Running `Σ exp(βᵀx)·x·xᵀ`.
    pub v: Array2<f64>,
    pub hessian: Array2<f64>,
}

/// Coefficients and Wald diagnostics of a Cox fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoxResult {
    pub coef: Array1<f64>,
    pub log_likelihood: f64,
    pub std_err: Array1<f64>,
    pub z_stats: Array1<f64>,
    pub p_values: Array1<f64>,
    /// Condition number of the Hessian.
    pub condition_no: f64,
    pub num_rows: u64,
}

impl CoxState {
    /// Sizes an empty state and starts a Newton step at `coef`.
    fn start_step(&mut self, coef: Array1<f64>) {
        let width = coef.len();
        log::debug!("Starting Cox Newton step with {width} independent variables");
        self.num_rows = 0;
        self.width = width;
        self.coef = coef;
        self.reset();
    }

    /// Zeroes the intra-iteration statistics.
    fn reset(&mut self) {
        self.s = 0.0;
        self.h = Array1::zeros(self.width);
        self.grad = Array1::zeros(self.width);
        self.log_likelihood = 0.0;
        self.v = Array2::zeros((self.width, self.width));
        self.hessian = Array2::zeros((self.width, self.width));
    }

    /// Coefficients a step seeded from `previous` starts at.
    fn seed_coefficients(
        previous: Option<&CoxState>,
        width: usize,
    ) -> Result<Array1<f64>, RegressionError> {
        let Some(previous) = previous else {
            return Ok(Array1::zeros(width));
        };
        if previous.is_identity() {
            return Err(RegressionError::IncompatibleState(
                "previous Newton step did not see any rows".to_string(),
            ));
        }
        if previous.width != width {
            return Err(RegressionError::IncompatibleState(format!(
                "previous Newton step has {} coefficients but the row has {width} independent variables",
                previous.width
            )));
        }
        ensure_finite(&previous.coef, "coefficients of the previous Newton step")?;
        Ok(previous.coef.clone())
    }

    /// Folds one row into the current Newton step.
    ///
    /// `previous` is the finalized state of the preceding step and is only
    /// consulted on the first row, where its coefficients seed this step.
    pub fn transition<S>(
        &mut self,
        x: &ArrayBase<S, Ix1>,
        previous: Option<&CoxState>,
    ) -> Result<(), RegressionError>
    where
        S: Data<Elem = f64>,
    {
        ensure_finite(x, "design matrix")?;
        if self.is_identity() {
            check_width(None, x.len())?;
            let coef = Self::seed_coefficients(previous, x.len())?;
            self.start_step(coef);
        } else {
            check_width(Some(self.width), x.len())?;
        }

        self.num_rows += 1;

        let xc = self.coef.dot(x);
        let s = xc.exp();

        self.s += s;
        self.h.scaled_add(s, x);
        for (i, &xi) in x.iter().enumerate() {
            if xi == 0.0 {
                continue;
            }
            let mut row = self.v.row_mut(i);
            row.scaled_add(s * xi, x);
        }

        let inv_s = 1.0 / self.s;
        self.grad += x;
        self.grad.scaled_add(-inv_s, &self.h);
        for ((i, j), value) in self.hessian.indexed_iter_mut() {
            *value += self.h[i] * self.h[j] * inv_s * inv_s - self.v[[i, j]] * inv_s;
        }
        self.log_likelihood += xc - self.s.ln();
        Ok(())
    }

    /// Takes one Newton step: `coef - hessian⁻¹ · grad`, step size 1.
    ///
    /// Returns `None` when no rows were seen. The step statistics are kept in
    /// the returned state so that [`CoxState::distance`] can compare steps.
    pub fn finalize<D>(&self, decomposer: &D) -> Result<Option<CoxState>, RegressionError>
    where
        D: SymmetricDecomposer + ?Sized,
    {
        if self.is_identity() {
            return Ok(None);
        }
        self.ensure_solvable()?;

        let decomposition = decomposer.decompose(self.hessian.view())?;
        let step = decomposition.pseudo_inverse.dot(&self.grad);

        let mut next = self.clone();
        next.coef = &self.coef - &step;
        if !all_finite(&next.coef) {
            return Err(RegressionError::NoSolutionFound(
                "Newton step produced non-finite coefficients".to_string(),
            ));
        }
        log::debug!(
            "Cox Newton step over {} rows: log-likelihood={:.8}, condition number={:.3e}",
            self.num_rows,
            self.log_likelihood,
            decomposition.condition_no
        );
        Ok(Some(next))
    }

    fn ensure_solvable(&self) -> Result<(), RegressionError> {
        if !all_finite(&self.hessian) || !all_finite(&self.grad) {
            return Err(RegressionError::NoSolutionFound(
                "over- or underflow in intermediate calculation; input data is likely of poor numerical condition"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Convergence criterion between two finalized states.
    pub fn distance(&self, other: &CoxState) -> f64 {
        (self.log_likelihood - other.log_likelihood).abs()
    }

    /// Packages the coefficients with Wald statistics from the observed information.
    pub fn result<D>(&self, decomposer: &D) -> Result<CoxResult, RegressionError>
    where
        D: SymmetricDecomposer + ?Sized,
    {
        if self.is_identity() {
            return Err(RegressionError::InvalidInput(
                "cannot summarize a Cox state without any rows".to_string(),
            ));
        }
        self.ensure_solvable()?;

        let information = self.hessian.mapv(|value| -value);
        let decomposition = decomposer.decompose(information.view())?;
        let std_err = standard_errors(&decomposition.pseudo_inverse, 1.0);
        let z_stats = Zip::from(&self.coef)
            .and(&std_err)
            .map_collect(|&c, &se| ratio_or_zero(c, se));
        let p_values = z_stats.mapv(normal_two_sided);

        Ok(CoxResult {
            coef: self.coef.clone(),
            log_likelihood: self.log_likelihood,
            std_err,
            z_stats,
            p_values,
            condition_no: decomposition.condition_no,
            num_rows: self.num_rows,
        })
    }

    pub fn to_external(&self) -> Vec<f64> {
        if self.is_identity() {
            return PackedWriter::identity();
        }
        let mut writer = PackedWriter::new(self.num_rows, self.width);
        writer
            .vector(&self.coef)
            .scalar(self.s)
            .vector(&self.h)
            .vector(&self.grad)
            .scalar(self.log_likelihood)
            .matrix(&self.v)
            .matrix(&self.hessian);
        writer.finish()
    }

    pub fn from_external(data: &[f64]) -> Result<Self, RegressionError> {
        let Some((header, mut reader)) = PackedReader::open(data)? else {
            return Ok(Self::default());
        };
        let width = header.width;
        let state = Self {
            num_rows: header.row_count,
            width,
            coef: reader.vector(width)?,
            s: reader.scalar()?,
            h: reader.vector(width)?,
            grad: reader.vector(width)?,
            log_likelihood: reader.scalar()?,
            v: reader.matrix(width)?,
            hessian: reader.matrix(width)?,
        };
        reader.finish()?;
        Ok(state)
    }
}

impl Accumulator for CoxState {
    fn row_count(&self) -> u64 {
        self.num_rows
    }

    fn width(&self) -> usize {
        self.width
    }

    /// Sums the step statistics of two shards of the same Newton step.
    ///
    /// Both shards must have been seeded with identical coefficients; the
    /// shared coefficient vector is kept rather than summed.
    fn merge(&mut self, other: &Self) -> Result<(), RegressionError> {
        if other.is_identity() {
            return Ok(());
        }
        if self.is_identity() {
            *self = other.clone();
            return Ok(());
        }
        check_merge_width(self.width, other.width)?;
        if self.coef != other.coef {
            return Err(RegressionError::IncompatibleState(
                "cannot merge states from different Newton steps (coefficients differ)"
                    .to_string(),
            ));
        }

        self.num_rows += other.num_rows;
        self.s += other.s;
        self.h += &other.h;
        self.grad += &other.grad;
        self.log_likelihood += other.log_likelihood;
        self.v += &other.v;
        self.hessian += &other.hessian;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposition::EigenDecomposer;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn fold(rows: &[Array1<f64>], previous: Option<&CoxState>) -> CoxState {
        let mut state = CoxState::default();
        for x in rows {
            state.transition(x, previous).unwrap();
        }
        state
    }

    #[test]
    fn first_row_contributes_nothing_to_gradient() {
        let state = fold(&[array![1.5, -0.5]], None);
        assert_eq!(state.num_rows, 1);
        assert_eq!(state.width, 2);
        assert_eq!(state.coef, array![0.0, 0.0]);
        assert_eq!(state.s, 1.0);
        assert_eq!(state.h, array![1.5, -0.5]);
        assert_eq!(state.grad, array![0.0, 0.0]);
        assert_eq!(state.log_likelihood, 0.0);
        for value in state.hessian.iter() {
            assert_abs_diff_eq!(*value, 0.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn running_statistics_match_hand_computation() {
        let state = fold(&[array![1.0], array![2.0]], None);
        assert_eq!(state.s, 2.0);
        assert_eq!(state.h, array![3.0]);
        assert_eq!(state.v, array![[5.0]]);
        assert_abs_diff_eq!(state.grad[0], 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(state.hessian[[0, 0]], -0.25, epsilon = 1e-15);
        assert_abs_diff_eq!(state.log_likelihood, -(2.0_f64).ln(), epsilon = 1e-15);
    }

    #[test]
    fn newton_step_uses_inverse_hessian() {
        let state = fold(&[array![1.0], array![2.0]], None);
        let next = state
            .finalize(&EigenDecomposer::default())
            .unwrap()
            .expect("rows were seen");
        // 0 - (-0.25)⁻¹ · 0.5
        assert_abs_diff_eq!(next.coef[0], 2.0, epsilon = 1e-12);
        assert_eq!(next.grad, state.grad);
        assert_eq!(next.log_likelihood, state.log_likelihood);
    }

    #[test]
    fn previous_step_seeds_coefficients_and_resets_statistics() {
        let mut previous = fold(&[array![1.0, 0.0], array![0.0, 1.0]], None);
        previous.coef = array![0.3, -0.2];

        let state = fold(&[array![2.0, 1.0]], Some(&previous));
        assert_eq!(state.num_rows, 1);
        assert_eq!(state.coef, array![0.3, -0.2]);
        let s = (0.6_f64 - 0.2).exp();
        assert_abs_diff_eq!(state.s, s, epsilon = 1e-15);
        assert_abs_diff_eq!(state.h[0], 2.0 * s, epsilon = 1e-15);
        assert_abs_diff_eq!(state.log_likelihood, 0.4 - s.ln(), epsilon = 1e-15);
        assert_abs_diff_eq!(state.grad[0], 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(state.grad[1], 0.0, epsilon = 1e-15);
    }

    #[test]
    fn previous_step_must_match_width_and_have_rows() {
        let previous = fold(&[array![1.0, 0.0]], None);
        let mut state = CoxState::default();
        let err = state.transition(&array![1.0], Some(&previous)).unwrap_err();
        assert!(matches!(err, RegressionError::IncompatibleState(_)));
        assert!(state.is_identity());

        let err = state
            .transition(&array![1.0], Some(&CoxState::default()))
            .unwrap_err();
        assert!(matches!(err, RegressionError::IncompatibleState(_)));
        assert!(state.is_identity());
    }

    #[test]
    fn non_finite_row_leaves_state_untouched() {
        let mut state = fold(&[array![1.0, 2.0], array![0.5, 0.5]], None);
        let before = state.clone();
        let err = state.transition(&array![f64::NAN, 1.0], None).unwrap_err();
        assert!(matches!(err, RegressionError::InvalidInput(_)));
        let err = state
            .transition(&array![1.0, f64::NEG_INFINITY], None)
            .unwrap_err();
        assert!(matches!(err, RegressionError::InvalidInput(_)));
        assert_eq!(state, before);
    }

    #[test]
    fn first_row_width_domain() {
        let mut state = CoxState::default();
        let err = state.transition(&Array1::<f64>::zeros(0), None).unwrap_err();
        assert!(matches!(err, RegressionError::DomainError { found: 0, .. }));
        let err = state
            .transition(&Array1::<f64>::zeros(65_536), None)
            .unwrap_err();
        assert!(matches!(err, RegressionError::DomainError { found: 65_536, .. }));
    }

    #[test]
    fn merge_identity_and_commutativity() {
        let a = fold(&[array![1.0, 0.5], array![0.2, 0.1]], None);
        let b = fold(&[array![-1.0, 2.0], array![0.0, 1.0], array![3.0, 0.0]], None);

        let mut with_identity = a.clone();
        with_identity.merge(&CoxState::default()).unwrap();
        assert_eq!(with_identity, a);
        let mut from_identity = CoxState::default();
        from_identity.merge(&a).unwrap();
        assert_eq!(from_identity, a);

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert_eq!(ab.num_rows, 5);
        assert_eq!(ab.coef, a.coef);
        assert_abs_diff_eq!(ab.log_likelihood, ba.log_likelihood, epsilon = 1e-12);
        for (l, r) in ab.hessian.iter().zip(ba.hessian.iter()) {
            assert_abs_diff_eq!(*l, *r, epsilon = 1e-12);
        }
    }

    #[test]
    fn merge_is_associative() {
        let a = fold(&[array![1.0, 0.5], array![0.2, 0.1]], None);
        let b = fold(&[array![-1.0, 2.0]], None);
        let c = fold(&[array![0.0, 1.0], array![3.0, 0.0], array![-0.4, 0.7]], None);

        let mut ab_c = a.clone();
        ab_c.merge(&b).unwrap();
        ab_c.merge(&c).unwrap();

        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut a_bc = a.clone();
        a_bc.merge(&bc).unwrap();

        assert_eq!(ab_c.num_rows, 6);
        assert_eq!(ab_c.num_rows, a_bc.num_rows);
        assert_eq!(ab_c.coef, a_bc.coef);
        assert_abs_diff_eq!(ab_c.s, a_bc.s, epsilon = 1e-12);
        assert_abs_diff_eq!(ab_c.log_likelihood, a_bc.log_likelihood, epsilon = 1e-12);
        for (l, r) in ab_c.h.iter().zip(a_bc.h.iter()) {
            assert_abs_diff_eq!(*l, *r, epsilon = 1e-12);
        }
        for (l, r) in ab_c.grad.iter().zip(a_bc.grad.iter()) {
            assert_abs_diff_eq!(*l, *r, epsilon = 1e-12);
        }
        for (l, r) in ab_c.v.iter().zip(a_bc.v.iter()) {
            assert_abs_diff_eq!(*l, *r, epsilon = 1e-12);
        }
        for (l, r) in ab_c.hessian.iter().zip(a_bc.hessian.iter()) {
            assert_abs_diff_eq!(*l, *r, epsilon = 1e-12);
        }
    }

    #[test]
    fn merge_rejects_width_and_step_mismatch() {
        let mut a = fold(&[array![1.0, 0.5]], None);
        let before = a.clone();
        let narrow = fold(&[array![1.0]], None);
        assert!(matches!(
            a.merge(&narrow),
            Err(RegressionError::IncompatibleState(_))
        ));

        let mut seeded_from = fold(&[array![1.0, 0.0]], None);
        seeded_from.coef = array![0.1, 0.1];
        let other_step = fold(&[array![0.0, 1.0]], Some(&seeded_from));
        assert!(matches!(
            a.merge(&other_step),
            Err(RegressionError::IncompatibleState(_))
        ));
        assert_eq!(a, before);
    }

    #[test]
    fn empty_state_finalizes_to_none() {
        let finalized = CoxState::default()
            .finalize(&EigenDecomposer::default())
            .unwrap();
        assert!(finalized.is_none());
    }

    #[test]
    fn non_finite_hessian_has_no_solution() {
        let mut state = fold(&[array![1.0], array![2.0]], None);
        state.hessian[[0, 0]] = f64::NAN;
        let err = state.finalize(&EigenDecomposer::default()).unwrap_err();
        assert!(matches!(err, RegressionError::NoSolutionFound(_)));

        let mut state = fold(&[array![1.0], array![2.0]], None);
        state.grad[0] = f64::INFINITY;
        let err = state.finalize(&EigenDecomposer::default()).unwrap_err();
        assert!(matches!(err, RegressionError::NoSolutionFound(_)));
    }

    #[test]
    fn distance_is_absolute_log_likelihood_difference() {
        let mut a = CoxState::default();
        let mut b = CoxState::default();
        a.log_likelihood = -3.5;
        b.log_likelihood = -1.25;
        assert_eq!(a.distance(&b), 2.25);
        assert_eq!(b.distance(&a), 2.25);
    }

    #[test]
    fn result_reports_wald_statistics() {
        let state = fold(&[array![1.0], array![2.0]], None);
        let result = state.result(&EigenDecomposer::default()).unwrap();
        // Observed information is 0.25, so the standard error is 2.
        assert_abs_diff_eq!(result.std_err[0], 2.0, epsilon = 1e-12);
        assert_eq!(result.z_stats[0], 0.0);
        assert_abs_diff_eq!(result.p_values[0], 1.0, epsilon = 1e-12);
        assert_eq!(result.num_rows, 2);
    }

    #[test]
    fn external_round_trip() {
        let state = fold(&[array![1.0, 0.5, -1.0], array![0.2, 0.1, 0.0]], None);
        let packed = state.to_external();
        assert_eq!(CoxState::from_external(&packed).unwrap(), state);
        assert_eq!(
            CoxState::from_external(&CoxState::default().to_external()).unwrap(),
            CoxState::default()
        );
        let mut extended = packed;
        extended.push(1.0);
        assert!(CoxState::from_external(&extended).is_err());
    }
}
