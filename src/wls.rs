//! Weighted normal equations on centered data.
//!
//! Forms `XᵗWX` and `XᵗWy` with the parallel reductions, drops collinear
//! columns with the pivot-dropping Cholesky of [`crate::collinear`], and
//! solves the reduced system with a `nalgebra` Cholesky factor.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::collinear::find_collinear_variables;
use crate::error::{EngineError, EngineResult};
use crate::reduce;

/// Solution of one weighted least-squares problem.
#[derive(Debug, Clone)]
pub struct WlsSolution {
    /// One entry per input column; dropped columns are NaN.
    pub coefficients: Array1<f64>,
    /// Indices of the columns that entered the solve.
    pub kept: Vec<usize>,
    /// Indices of the columns dropped as collinear.
    pub dropped: Vec<usize>,
    /// `(XᵗWX)⁻¹` over the kept columns, in `kept` order.
    pub xtwx_inv: Array2<f64>,
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
}

impl WlsSolution {
    /// Kept coefficients, in `kept` order.
    pub fn kept_coefficients(&self) -> Array1<f64> {
        self.kept.iter().map(|&j| self.coefficients[j]).collect()
    }
}

/// Solve `min Σ w_i (y_i - x_i β)²`.
///
/// `reference_scale[j]` is the magnitude column `j` is compared to when
/// deciding collinearity (typically its weighted sum of squares before
/// centering); the pivot threshold is `tol * reference_scale[j]`. Without it
/// the diagonal of `XᵗWX` is used.
pub fn solve(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    weights: Option<&[f64]>,
    reference_scale: Option<&[f64]>,
    tol: f64,
) -> EngineResult<WlsSolution> {
    let (n, k) = x.dim();
    if y.len() != n {
        return Err(EngineError::InvalidDesign(format!(
            "response has length {}, regressors have {n} rows",
            y.len()
        )));
    }

    if k == 0 {
        return Ok(WlsSolution {
            coefficients: Array1::zeros(0),
            kept: Vec::new(),
            dropped: Vec::new(),
            xtwx_inv: Array2::zeros((0, 0)),
            fitted: Array1::zeros(n),
            residuals: y.to_owned(),
        });
    }

    let xtwx = reduce::cross_product(x, weights);
    let xtwy = reduce::cross_vector(x, y, weights);

    let diagonal: Vec<f64>;
    let scale = match reference_scale {
        Some(s) => s,
        None => {
            diagonal = xtwx.diag().to_vec();
            &diagonal
        }
    };
    let collinear = find_collinear_variables(xtwx.view(), tol, Some(scale))?;
    if collinear.all_collinear {
        return Err(EngineError::AllCollinear { n_columns: k });
    }

    let (kept, dropped): (Vec<usize>, Vec<usize>) =
        (0..k).partition(|&j| !collinear.excluded[j]);

    let reduced = xtwx.select(Axis(0), &kept).select(Axis(1), &kept);
    let chol = factor(reduced.view())?;
    let rhs = DVector::from_iterator(kept.len(), kept.iter().map(|&j| xtwy[j]));
    let beta_kept: Array1<f64> = chol.solve(&rhs).iter().copied().collect();
    let xtwx_inv = symmetrized(to_array(&chol.inverse()));

    let mut coefficients = Array1::from_elem(k, f64::NAN);
    for (&j, &b) in kept.iter().zip(beta_kept.iter()) {
        coefficients[j] = b;
    }

    let fitted = x.select(Axis(1), &kept).dot(&beta_kept);
    let residuals = &y - &fitted;

    Ok(WlsSolution {
        coefficients,
        kept,
        dropped,
        xtwx_inv,
        fitted,
        residuals,
    })
}

/// Copy into a column-major `DMatrix`.
fn to_dmatrix(a: ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[(i, j)])
}

fn to_array(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(m.shape(), |(i, j)| m[(i, j)])
}

/// Average `a` with its transpose.
fn symmetrized(mut a: Array2<f64>) -> Array2<f64> {
    let k = a.nrows();
    for i in 0..k {
        for j in 0..i {
            let avg = 0.5 * (a[(i, j)] + a[(j, i)]);
            a[(i, j)] = avg;
            a[(j, i)] = avg;
        }
    }
    a
}

fn factor(a: ArrayView2<f64>) -> EngineResult<Cholesky<f64, Dyn>> {
    if !a.is_square() || a.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::NotPositiveDefinite);
    }
    Cholesky::new(to_dmatrix(a)).ok_or(EngineError::NotPositiveDefinite)
}

/// Inverse of a symmetric positive-definite matrix.
pub fn invert_spd(a: &Array2<f64>) -> EngineResult<Array2<f64>> {
    Ok(symmetrized(to_array(&factor(a.view())?.inverse())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_exact_fit() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let y = array![1.0, 3.0, 5.0, 7.0];
        let sol = solve(x.view(), y.view(), None, None, 1e-10).unwrap();
        assert_relative_eq!(sol.coefficients[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(sol.coefficients[1], 2.0, epsilon = 1e-12);
        assert!(sol.residuals.iter().all(|r| r.abs() < 1e-12));
    }

    #[test]
    fn test_weighted_matches_scaled_rows() {
        let x = array![[1.0, 0.5], [1.0, 1.5], [1.0, 2.0], [1.0, 4.0], [1.0, 3.0]];
        let y = array![1.0, 2.0, 2.5, 6.0, 3.0];
        let w = [1.0, 4.0, 1.0, 9.0, 0.25];

        let weighted = solve(x.view(), y.view(), Some(&w), None, 1e-10).unwrap();

        let sw: Vec<f64> = w.iter().map(|v: &f64| v.sqrt()).collect();
        let xs = Array2::from_shape_fn((5, 2), |(i, j)| x[[i, j]] * sw[i]);
        let ys = Array1::from_shape_fn(5, |i| y[i] * sw[i]);
        let scaled = solve(xs.view(), ys.view(), None, None, 1e-10).unwrap();

        for j in 0..2 {
            assert_relative_eq!(weighted.coefficients[j], scaled.coefficients[j], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_collinear_column_is_nan() {
        let x = array![[1.0, 2.0, 0.3], [2.0, 4.0, 1.0], [3.0, 6.0, 0.2], [4.0, 8.0, 2.0]];
        let y = array![1.0, 2.0, 3.0, 5.0];
        let sol = solve(x.view(), y.view(), None, None, 1e-10).unwrap();
        assert_eq!(sol.dropped, vec![1]);
        assert_eq!(sol.kept, vec![0, 2]);
        assert!(sol.coefficients[1].is_nan());
        assert_eq!(sol.xtwx_inv.dim(), (2, 2));
    }

    #[test]
    fn test_all_collinear_is_fatal() {
        let x = Array2::<f64>::zeros((3, 2));
        let y = array![1.0, 2.0, 3.0];
        let err = solve(x.view(), y.view(), None, None, 1e-10).unwrap_err();
        assert!(matches!(err, EngineError::AllCollinear { n_columns: 2 }));
    }

    #[test]
    fn test_inverse() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let inv = invert_spd(&a).unwrap();
        let eye = a.dot(&inv);
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(eye[(i, j)], if i == j { 1.0 } else { 0.0 }, epsilon = 1e-12);
            }
        }
        assert!(matches!(
            invert_spd(&array![[1.0, 2.0], [2.0, 1.0]]),
            Err(EngineError::NotPositiveDefinite)
        ));
    }
}
