//! Symmetric eigen decomposition and Moore-Penrose pseudo-inverse.
//!
//! Finalization of both models needs the generalized inverse of a symmetric
//! matrix (`XᵀX` for least squares, the Hessian for the Cox Newton step) and the
//! condition number of that matrix. The accumulators only depend on the
//! [`SymmetricDecomposer`] trait, so a host can inject its own backend; the
//! default [`EigenDecomposer`] runs faer's self-adjoint eigen solver over an
//! ndarray view.

use faer::diag::DiagRef;
use faer::linalg::solvers;
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("expected a square matrix, found shape {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
}

fn eigenvalues_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let column = diag.column_vector().as_mat();
    Array1::from_shape_fn(column.nrows(), |i| column[(i, 0)])
}

/// Matrix handed to faer: borrowed when the ndarray layout is contiguous,
/// copied otherwise.
enum FaerInput<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerInput<'a> {
    fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => {
                Self::Borrowed(MatRef::from_row_major_slice(slice, rows, cols))
            }
            Some(slice) if array.t().is_standard_layout() => {
                Self::Borrowed(MatRef::from_column_major_slice(slice, rows, cols))
            }
            _ => Self::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        }
    }

    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            Self::Borrowed(view) => *view,
            Self::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Output of the decomposition service.
#[derive(Debug, Clone)]
pub struct SymmetricDecomposition {
    pub eigenvalues: Array1<f64>,
    pub pseudo_inverse: Array2<f64>,
    /// Ratio of the largest to the smallest absolute eigenvalue.
    /// Infinite for singular input.
    pub condition_no: f64,
}

/// The decomposition capability consumed by finalization.
///
/// Callers guarantee the matrix is finite and symmetric.
pub trait SymmetricDecomposer {
    fn decompose(
        &self,
        matrix: ArrayView2<'_, f64>,
    ) -> Result<SymmetricDecomposition, DecompositionError>;
}

/// Eigen-based pseudo-inverse.
///
/// Eigenvalues whose magnitude does not exceed
/// `relative_tolerance * n * max|λ|` are treated as zero when inverting.
#[derive(Debug, Clone, Copy)]
pub struct EigenDecomposer {
    pub relative_tolerance: f64,
}

impl Default for EigenDecomposer {
    fn default() -> Self {
        Self {
            relative_tolerance: f64::EPSILON,
        }
    }
}

impl SymmetricDecomposer for EigenDecomposer {
    fn decompose(
        &self,
        matrix: ArrayView2<'_, f64>,
    ) -> Result<SymmetricDecomposition, DecompositionError> {
        let (rows, cols) = matrix.dim();
        if rows != cols {
            return Err(DecompositionError::NotSquare { rows, cols });
        }
        if rows == 0 {
            return Ok(SymmetricDecomposition {
                eigenvalues: Array1::zeros(0),
                pseudo_inverse: Array2::zeros((0, 0)),
                condition_no: 1.0,
            });
        }

        let input = FaerInput::new(&matrix);
        let eigen = input
            .as_ref()
            .self_adjoint_eigen(Side::Lower)
            .map_err(DecompositionError::SelfAdjointEigen)?;
        let values = eigenvalues_to_array(eigen.S());
        let vectors = eigen.U();

        let max_abs = values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let min_abs = values.iter().fold(f64::INFINITY, |acc, v| acc.min(v.abs()));
        let cutoff = self.relative_tolerance * rows as f64 * max_abs;

        let mut pseudo_inverse = Array2::<f64>::zeros((rows, rows));
        for (k, &lambda) in values.iter().enumerate() {
            if lambda.abs() <= cutoff || lambda == 0.0 {
                continue;
            }
            for i in 0..rows {
                let scaled = vectors[(i, k)] / lambda;
                for j in 0..rows {
                    pseudo_inverse[[i, j]] += scaled * vectors[(j, k)];
                }
            }
        }

        let condition_no = if min_abs > 0.0 {
            max_abs / min_abs
        } else {
            f64::INFINITY
        };

        Ok(SymmetricDecomposition {
            eigenvalues: values,
            pseudo_inverse,
            condition_no,
        })
    }
}
