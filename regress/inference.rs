use ndarray::{Array1, Array2};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

/// `numerator / denominator`, except that `0 / 0` is `0`.
///
/// A zero coefficient with zero standard error is known exactly, so its test
/// statistic is `0` (p-value `1`). A non-zero coefficient over a zero standard
/// error stays a signed infinity.
#[inline]
pub fn ratio_or_zero(numerator: f64, denominator: f64) -> f64 {
    if numerator == 0.0 && denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// `sqrt(scale * covariance[i, i])` per coefficient.
///
/// A negative diagonal entry can only come from rounding in the generalized
/// inverse of a positive semi-definite matrix and maps to a zero standard error.
pub fn standard_errors(covariance: &Array2<f64>, scale: f64) -> Array1<f64> {
    covariance.diag().mapv(|diagonal| {
        if diagonal < 0.0 {
            0.0
        } else {
            (scale * diagonal).sqrt()
        }
    })
}

/// Two-sided p-value of `t` under a Student-t distribution.
///
/// Degrees of freedom that do not define a distribution give `NaN`.
pub fn student_t_two_sided(t: f64, degrees_of_freedom: f64) -> f64 {
    let Ok(dist) = StudentsT::new(0.0, 1.0, degrees_of_freedom) else {
        return f64::NAN;
    };
    if t.is_nan() {
        return f64::NAN;
    }
    if t.is_infinite() {
        return 0.0;
    }
    (2.0 * dist.sf(t.abs())).clamp(0.0, 1.0)
}

/// Two-sided p-value of a Wald statistic under the standard normal.
pub fn normal_two_sided(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    if z.is_infinite() {
        return 0.0;
    }
    match Normal::new(0.0, 1.0) {
        Ok(dist) => (2.0 * dist.sf(z.abs())).clamp(0.0, 1.0),
        Err(_) => f64::NAN,
    }
}
