use ndarray::{Array1, Array2, ArrayView2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollinearityError {
    #[error("Input matrix must be square, got {rows}x{cols}")]
    NonSquareMatrix { rows: usize, cols: usize },

    #[error("Tolerance must be positive and finite, got {value}")]
    InvalidTolerance { value: f64 },

    #[error("Reference scale has length {len}, expected {expected}")]
    ScaleLength { len: usize, expected: usize },
}

/// Columns flagged by [`find_collinear_variables`].
#[derive(Debug, Clone, PartialEq)]
pub struct CollinearColumns {
    /// `true` for every column expressible through the columns before it.
    pub excluded: Array1<bool>,
    pub n_excluded: usize,
    /// Every column was excluded.
    pub all_collinear: bool,
}

/// Detects collinear variables with a pivot-dropping Cholesky decomposition
/// of a cross-product matrix `XᵗX`.
///
/// A column is excluded when its remaining pivot falls below `tol` (or
/// `tol * scale[j]` when a reference scale is given). Later columns are then
/// factored as if the excluded one never existed, so the first column of a
/// dependent set is kept.
pub fn find_collinear_variables(
    x: ArrayView2<f64>,
    tol: f64,
    scale: Option<&[f64]>,
) -> Result<CollinearColumns, CollinearityError> {
    if !(tol > 0.0 && tol.is_finite()) {
        return Err(CollinearityError::InvalidTolerance { value: tol });
    }

    let k = x.ncols();
    if !x.is_square() {
        return Err(CollinearityError::NonSquareMatrix {
            rows: x.nrows(),
            cols: k,
        });
    }
    if let Some(s) = scale {
        if s.len() != k {
            return Err(CollinearityError::ScaleLength {
                len: s.len(),
                expected: k,
            });
        }
    }

    let mut r = Array2::<f64>::zeros((k, k));
    let mut id_excl = vec![false; k];
    let mut n_excl = 0usize;

    for j in 0..k {
        let mut r_jj = x[(j, j)];
        for m in 0..j {
            if id_excl[m] {
                continue;
            }
            let r_mj = r[(m, j)];
            r_jj -= r_mj * r_mj;
        }

        let threshold = scale.map_or(tol, |s| tol * s[j]);
        if r_jj < threshold || r_jj <= 0.0 {
            id_excl[j] = true;
            n_excl += 1;
            continue;
        }

        let rjj_sqrt = r_jj.sqrt();
        r[(j, j)] = rjj_sqrt;

        for i in (j + 1)..k {
            let mut value = x[(i, j)];
            for m in 0..j {
                if id_excl[m] {
                    continue;
                }
                value -= r[(m, i)] * r[(m, j)];
            }
            r[(j, i)] = value / rjj_sqrt;
        }
    }

    Ok(CollinearColumns {
        excluded: Array1::from_vec(id_excl),
        n_excluded: n_excl,
        all_collinear: k > 0 && n_excl == k,
    })
}
