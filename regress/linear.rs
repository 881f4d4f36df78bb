//! # Streaming ordinary least squares
//!
//! The state keeps the sufficient statistics of a linear model: the row count,
//! `Σy`, `Σy²`, `Xᵀy` and `XᵀX`. Rows are folded in one at a time and never
//! revisited, shard states are summed field by field, and the normal equations
//! are solved once at the end through the pseudo-inverse of `XᵀX`, so a
//! singular design still produces the minimum-norm solution.

use crate::accumulator::Accumulator;
use crate::decomposition::SymmetricDecomposer;
use crate::error::RegressionError;
use crate::guards::{
    all_finite, check_merge_width, check_width, ensure_finite, ensure_finite_scalar,
};
use crate::inference::{ratio_or_zero, standard_errors, student_t_two_sided};
use crate::packing::{PackedReader, PackedWriter};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Zip};
use serde::{Deserialize, Serialize};

/// Transition state of the least-squares aggregate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinearRegressionState {
    pub num_rows: u64,
    pub width: usize,
    pub y_sum: f64,
    pub y_square_sum: f64,
    /// `Xᵀy` for the rows seen so far.
    pub xt_y: Array1<f64>,
    /// `XᵀX` for the rows seen so far. Symmetric by construction.
    pub xt_x: Array2<f64>,
}

/// Coefficients and diagnostics of a finalized least-squares fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearRegressionResult {
    pub coef: Array1<f64>,
    pub r2: f64,
    pub std_err: Array1<f64>,
    pub t_stats: Array1<f64>,
    pub p_values: Array1<f64>,
    /// Condition number of `XᵀX`.
    pub condition_no: f64,
    pub num_rows: u64,
    /// Explained sum of squares after clamping.
    pub ess: f64,
    /// Total sum of squares after clamping.
    pub tss: f64,
    pub rss: f64,
    /// Residual mean square, `rss / (n - width)`.
    pub variance: f64,
}

impl LinearRegressionState {
    /// Sizes an empty state for `width` independent variables.
    fn initialize(&mut self, width: usize) {
        log::debug!("Sizing linear regression state for {width} independent variables");
        self.width = width;
        self.xt_y = Array1::zeros(width);
        self.xt_x = Array2::zeros((width, width));
    }

    /// Folds one observation into the state.
    ///
    /// The first row fixes the width. Non-finite input is rejected before any
    /// field is touched, so a failed call leaves the state as it was.
    pub fn transition<S>(&mut self, y: f64, x: &ArrayBase<S, Ix1>) -> Result<(), RegressionError>
    where
        S: Data<Elem = f64>,
    {
        ensure_finite_scalar(y, "dependent variable")?;
        ensure_finite(x, "design matrix")?;
        check_width((!self.is_identity()).then_some(self.width), x.len())?;

        if self.is_identity() {
            self.initialize(x.len());
        }

        self.num_rows += 1;
        self.y_sum += y;
        self.y_square_sum += y * y;
        self.xt_y.scaled_add(y, x);
        for (i, &xi) in x.iter().enumerate() {
            if xi == 0.0 {
                continue;
            }
            let mut row = self.xt_x.row_mut(i);
            row.scaled_add(xi, x);
        }
        Ok(())
    }

    /// Solves the normal equations and computes the fit diagnostics.
    pub fn finalize<D>(&self, decomposer: &D) -> Result<LinearRegressionResult, RegressionError>
    where
        D: SymmetricDecomposer + ?Sized,
    {
        if self.is_identity() {
            return Err(RegressionError::InvalidInput(
                "cannot finalize a linear regression without any rows".to_string(),
            ));
        }
        if !all_finite(&self.xt_x) || !all_finite(&self.xt_y) {
            return Err(RegressionError::InvalidInput(
                "design matrix is not finite".to_string(),
            ));
        }

        let decomposition = decomposer.decompose(self.xt_x.view())?;
        let inverse_of_xt_x = &decomposition.pseudo_inverse;

        let coef = inverse_of_xt_x.dot(&self.xt_y);
        let n = self.num_rows as f64;
        let mean_correction = self.y_sum * self.y_sum / n;

        let mut ess = self.xt_y.dot(&coef) - mean_correction;
        let mut tss = self.y_square_sum - mean_correction;

        // Both are non-negative in exact arithmetic; rounding can push them below.
        if tss < 0.0 {
            tss = 0.0;
        }
        if ess < 0.0 {
            ess = 0.0;
        }
        // tss is known more accurately than ess.
        if ess > tss {
            log::debug!("Clamping explained sum of squares {ess} to total {tss}");
            ess = tss;
        }

        let r2 = if tss == 0.0 { 1.0 } else { ess / tss };
        let rss = tss - ess;
        let degrees_of_freedom = n - self.width as f64;
        // Undefined without residual degrees of freedom, including n == width.
        let variance = if degrees_of_freedom > 0.0 {
            rss / degrees_of_freedom
        } else {
            f64::NAN
        };

        let std_err = standard_errors(inverse_of_xt_x, variance);
        let t_stats = Zip::from(&coef)
            .and(&std_err)
            .map_collect(|&c, &se| ratio_or_zero(c, se));
        let p_values = t_stats.mapv(|t| student_t_two_sided(t, degrees_of_freedom));

        log::debug!(
            "Finalized linear regression over {} rows: r2={r2:.6}, condition number={:.3e}",
            self.num_rows,
            decomposition.condition_no
        );

        Ok(LinearRegressionResult {
            coef,
            r2,
            std_err,
            t_stats,
            p_values,
            condition_no: decomposition.condition_no,
            num_rows: self.num_rows,
            ess,
            tss,
            rss,
            variance,
        })
    }

    pub fn to_external(&self) -> Vec<f64> {
        if self.is_identity() {
            return PackedWriter::identity();
        }
        let mut writer = PackedWriter::new(self.num_rows, self.width);
        writer
            .scalar(self.y_sum)
            .scalar(self.y_square_sum)
            .vector(&self.xt_y)
            .matrix(&self.xt_x);
        writer.finish()
    }

    pub fn from_external(data: &[f64]) -> Result<Self, RegressionError> {
        let Some((header, mut reader)) = PackedReader::open(data)? else {
            return Ok(Self::default());
        };
        let state = Self {
            num_rows: header.row_count,
            width: header.width,
            y_sum: reader.scalar()?,
            y_square_sum: reader.scalar()?,
            xt_y: reader.vector(header.width)?,
            xt_x: reader.matrix(header.width)?,
        };
        reader.finish()?;
        Ok(state)
    }
}

impl Accumulator for LinearRegressionState {
    fn row_count(&self) -> u64 {
        self.num_rows
    }

    fn width(&self) -> usize {
        self.width
    }

    fn merge(&mut self, other: &Self) -> Result<(), RegressionError> {
        if other.is_identity() {
            return Ok(());
        }
        if self.is_identity() {
            *self = other.clone();
            return Ok(());
        }
        check_merge_width(self.width, other.width)?;

        self.num_rows += other.num_rows;
        self.y_sum += other.y_sum;
        self.y_square_sum += other.y_square_sum;
        self.xt_y += &other.xt_y;
        self.xt_x += &other.xt_x;
        Ok(())
    }
}
