//! Per-death-time partial sums for stratified and tied-time Cox extensions.
//!
//! The state collects `Σ exp(βᵀx)`, `Σ exp(βᵀx)·x` and `Σ exp(βᵀx)·x·xᵀ` over the
//! rows sharing one death time, at a coefficient vector broadcast with every row.
//! Finalization does not take a Newton step; it packages the sums for a
//! combiner that assembles the likelihood across death times.

use crate::accumulator::Accumulator;
use crate::error::RegressionError;
use crate::guards::{check_merge_width, check_width, ensure_finite, ensure_finite_scalar};
use crate::packing::{PackedReader, PackedWriter};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntermediateCoxState {
    pub num_rows: u64,
    pub width: usize,
    /// Death time every row of this state belongs to.
    pub time_death: f64,
    pub coef: Array1<f64>,

    pub exp_coef_x: f64,
    pub x_exp_coef_x: Array1<f64>,
    pub xx_trans_exp_coef_x: Array2<f64>,
}

/// Sums of one death time, handed to the higher-level combiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateCoxResult {
    pub time_death: f64,
    pub coef: Array1<f64>,
    pub exp_coef_x: f64,
    pub x_exp_coef_x: Array1<f64>,
    pub xx_trans_exp_coef_x: Array2<f64>,
}

impl IntermediateCoxState {
    fn initialize(&mut self, time_death: f64, coef: Array1<f64>) {
        let width = coef.len();
        log::debug!("Sizing intermediate Cox state for death time {time_death} and {width} variables");
        self.num_rows = 0;
        self.width = width;
        self.time_death = time_death;
        self.coef = coef;
        self.reset();
    }

    fn reset(&mut self) {
        self.exp_coef_x = 0.0;
        self.x_exp_coef_x = Array1::zeros(self.width);
        self.xx_trans_exp_coef_x = Array2::zeros((self.width, self.width));
    }

    fn check_key<S>(
        &self,
        time_death: f64,
        coef: &ArrayBase<S, Ix1>,
    ) -> Result<(), RegressionError>
    where
        S: Data<Elem = f64>,
    {
        if time_death != self.time_death {
            return Err(RegressionError::IncompatibleState(format!(
                "row has death time {time_death} but the state collects death time {}",
                self.time_death
            )));
        }
        if *coef != self.coef {
            return Err(RegressionError::IncompatibleState(
                "row carries different coefficients than the state".to_string(),
            ));
        }
        Ok(())
    }

    /// Folds one row with death time `time_death`, evaluated at `coef`.
    ///
    /// On the first row `previous`, if given, seeds the death time and
    /// coefficients; the row must then agree with them.
    pub fn transition<S, T>(
        &mut self,
        x: &ArrayBase<S, Ix1>,
        time_death: f64,
        coef: &ArrayBase<T, Ix1>,
        previous: Option<&IntermediateCoxState>,
    ) -> Result<(), RegressionError>
    where
        S: Data<Elem = f64>,
        T: Data<Elem = f64>,
    {
        ensure_finite(x, "design matrix")?;
        ensure_finite_scalar(time_death, "death time")?;
        ensure_finite(coef, "coefficients")?;
        if coef.len() != x.len() {
            return Err(RegressionError::IncompatibleState(format!(
                "row has {} independent variables but {} coefficients",
                x.len(),
                coef.len()
            )));
        }

        if self.is_identity() {
            check_width(None, x.len())?;
            match previous {
                Some(previous) if !previous.is_identity() => {
                    check_merge_width(previous.width, x.len())?;
                    previous.check_key(time_death, coef)?;
                }
                Some(_) => {
                    return Err(RegressionError::IncompatibleState(
                        "previous intermediate state did not see any rows".to_string(),
                    ));
                }
                None => {}
            }
            self.initialize(time_death, coef.to_owned());
        } else {
            check_width(Some(self.width), x.len())?;
            self.check_key(time_death, coef)?;
        }

        self.num_rows += 1;
        let s = self.coef.dot(x).exp();
        self.exp_coef_x += s;
        self.x_exp_coef_x.scaled_add(s, x);
        for (i, &xi) in x.iter().enumerate() {
            if xi == 0.0 {
                continue;
            }
            let mut row = self.xx_trans_exp_coef_x.row_mut(i);
            row.scaled_add(s * xi, x);
        }
        Ok(())
    }

    /// Pass-through: `None` without rows, otherwise the collected sums.
    pub fn finalize(&self) -> Option<IntermediateCoxResult> {
        if self.is_identity() {
            return None;
        }
        Some(IntermediateCoxResult {
            time_death: self.time_death,
            coef: self.coef.clone(),
            exp_coef_x: self.exp_coef_x,
            x_exp_coef_x: self.x_exp_coef_x.clone(),
            xx_trans_exp_coef_x: self.xx_trans_exp_coef_x.clone(),
        })
    }

    pub fn to_external(&self) -> Vec<f64> {
        if self.is_identity() {
            return PackedWriter::identity();
        }
        let mut writer = PackedWriter::new(self.num_rows, self.width);
        writer
            .scalar(self.time_death)
            .vector(&self.coef)
            .scalar(self.exp_coef_x)
            .vector(&self.x_exp_coef_x)
            .matrix(&self.xx_trans_exp_coef_x);
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
            time_death: reader.scalar()?,
            coef: reader.vector(width)?,
            exp_coef_x: reader.scalar()?,
            x_exp_coef_x: reader.vector(width)?,
            xx_trans_exp_coef_x: reader.matrix(width)?,
        };
        reader.finish()?;
        Ok(state)
    }
}

impl Accumulator for IntermediateCoxState {
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
        self.check_key(other.time_death, &other.coef)?;

        self.num_rows += other.num_rows;
        self.exp_coef_x += other.exp_coef_x;
        self.x_exp_coef_x += &other.x_exp_coef_x;
        self.xx_trans_exp_coef_x += &other.xx_trans_exp_coef_x;
        Ok(())
    }
}
