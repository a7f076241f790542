//! Parallel reductions over observations.
//!
//! Every reduction splits the observations into fixed-size chunks, accumulates
//! a partial result per chunk on the rayon pool, then combines the partials
//! sequentially in chunk order. Chunk boundaries do not depend on the number
//! of threads, so results are bit-for-bit reproducible across pool sizes.
//!
//! Short inputs (a single chunk) skip the pool entirely.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

/// Number of observations handled by one partial accumulator.
pub const CHUNK_LEN: usize = 8_192;

#[inline]
fn n_chunks(n: usize) -> usize {
    n.div_ceil(CHUNK_LEN)
}

#[inline]
fn chunk_range(c: usize, n: usize) -> std::ops::Range<usize> {
    let lo = c * CHUNK_LEN;
    lo..(lo + CHUNK_LEN).min(n)
}

/// Sum of a slice.
pub fn sum(values: &[f64]) -> f64 {
    if values.len() <= CHUNK_LEN {
        return values.iter().sum();
    }
    let partials: Vec<f64> = values
        .par_chunks(CHUNK_LEN)
        .map(|chunk| chunk.iter().sum::<f64>())
        .collect();
    partials.iter().sum()
}

/// Weighted inner product `Σ w_i a_i b_i` (`w = 1` when `None`).
pub fn weighted_dot(a: &[f64], b: &[f64], weights: Option<&[f64]>) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let partial = |range: std::ops::Range<usize>| -> f64 {
        match weights {
            None => range.map(|i| a[i] * b[i]).sum(),
            Some(w) => range.map(|i| w[i] * a[i] * b[i]).sum(),
        }
    };
    if n <= CHUNK_LEN {
        return partial(0..n);
    }
    let partials: Vec<f64> = (0..n_chunks(n))
        .into_par_iter()
        .map(|c| partial(chunk_range(c, n)))
        .collect();
    partials.iter().sum()
}

/// Scatter-add `values` into per-group totals: `out[g] = Σ_{i: g_i = g} s_i v_i`.
///
/// `scale` holds the per-observation multiplier (observation weight, possibly
/// times a slope covariate); `None` means 1. `out` is overwritten.
pub fn group_sums(values: &[f64], scale: Option<&[f64]>, group_ids: &[usize], out: &mut [f64]) {
    let n = values.len();
    let n_groups = out.len();
    debug_assert_eq!(group_ids.len(), n);

    let accumulate = |range: std::ops::Range<usize>, acc: &mut [f64]| match scale {
        None => {
            for i in range {
                acc[group_ids[i]] += values[i];
            }
        }
        Some(s) => {
            for i in range {
                acc[group_ids[i]] += s[i] * values[i];
            }
        }
    };

    out.fill(0.0);
    let chunks = n_chunks(n);
    // One partial vector per chunk: only worth it when the partials stay small.
    if chunks <= 1 || n_groups.saturating_mul(chunks) > 4 * n {
        accumulate(0..n, out);
        return;
    }

    let partials: Vec<Vec<f64>> = (0..chunks)
        .into_par_iter()
        .map(|c| {
            let mut acc = vec![0.0; n_groups];
            accumulate(chunk_range(c, n), &mut acc);
            acc
        })
        .collect();

    for partial in &partials {
        for (o, &p) in out.iter_mut().zip(partial) {
            *o += p;
        }
    }
}

/// Weighted cross product `XᵗWX`.
pub fn cross_product(x: ArrayView2<f64>, weights: Option<&[f64]>) -> Array2<f64> {
    let (n, k) = x.dim();
    let partial = |range: std::ops::Range<usize>| -> Array2<f64> {
        let mut acc = Array2::<f64>::zeros((k, k));
        for i in range {
            let row = x.row(i);
            let wi = weights.map_or(1.0, |w| w[i]);
            for a in 0..k {
                let wa = wi * row[a];
                if wa == 0.0 {
                    continue;
                }
                for b in a..k {
                    acc[[a, b]] += wa * row[b];
                }
            }
        }
        acc
    };

    let mut out = if n <= CHUNK_LEN {
        partial(0..n)
    } else {
        let partials: Vec<Array2<f64>> = (0..n_chunks(n))
            .into_par_iter()
            .map(|c| partial(chunk_range(c, n)))
            .collect();
        partials
            .into_iter()
            .fold(Array2::zeros((k, k)), |mut acc, p| {
                acc += &p;
                acc
            })
    };

    for a in 0..k {
        for b in 0..a {
            out[[a, b]] = out[[b, a]];
        }
    }
    out
}

/// Weighted cross vector `XᵗWy`.
pub fn cross_vector(x: ArrayView2<f64>, y: ArrayView1<f64>, weights: Option<&[f64]>) -> Array1<f64> {
    let (n, k) = x.dim();
    let partial = |range: std::ops::Range<usize>| -> Array1<f64> {
        let mut acc = Array1::<f64>::zeros(k);
        for i in range {
            let wy = weights.map_or(1.0, |w| w[i]) * y[i];
            if wy == 0.0 {
                continue;
            }
            for (a, &xa) in x.row(i).iter().enumerate() {
                acc[a] += wy * xa;
            }
        }
        acc
    };

    if n <= CHUNK_LEN {
        return partial(0..n);
    }
    let partials: Vec<Array1<f64>> = (0..n_chunks(n))
        .into_par_iter()
        .map(|c| partial(chunk_range(c, n)))
        .collect();
    partials
        .into_iter()
        .fold(Array1::zeros(k), |mut acc, p| {
            acc += &p;
            acc
        })
}

/// Per-group column sums of a row matrix: `out[g, :] = Σ_{i: g_i = g} rows[i, :]`.
pub fn group_row_sums(rows: ArrayView2<f64>, group_ids: &[usize], n_groups: usize) -> Array2<f64> {
    let (n, k) = rows.dim();
    debug_assert_eq!(group_ids.len(), n);

    let accumulate = |range: std::ops::Range<usize>, acc: &mut Array2<f64>| {
        for i in range {
            let g = group_ids[i];
            for (a, &v) in rows.row(i).iter().enumerate() {
                acc[[g, a]] += v;
            }
        }
    };

    let chunks = n_chunks(n);
    let mut out = Array2::<f64>::zeros((n_groups, k));
    if chunks <= 1 || n_groups.saturating_mul(chunks) > 4 * n {
        accumulate(0..n, &mut out);
        return out;
    }

    let partials: Vec<Array2<f64>> = (0..chunks)
        .into_par_iter()
        .map(|c| {
            let mut acc = Array2::<f64>::zeros((n_groups, k));
            accumulate(chunk_range(c, n), &mut acc);
            acc
        })
        .collect();
    for p in &partials {
        out += p;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn test_sum_matches_sequential_across_chunks() {
        let n = 3 * CHUNK_LEN + 17;
        let values: Vec<f64> = (0..n).map(|i| ((i % 13) as f64) * 0.25).collect();
        let expected: f64 = values.iter().sum();
        assert_relative_eq!(sum(&values), expected, max_relative = 1e-12);
    }

    #[test]
    fn test_group_sums_weighted() {
        let n = 2 * CHUNK_LEN + 5;
        let values: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let weights: Vec<f64> = (0..n).map(|i| 1.0 + (i % 3) as f64).collect();
        let ids: Vec<usize> = (0..n).map(|i| i % 7).collect();

        let mut out = vec![0.0; 7];
        group_sums(&values, Some(&weights), &ids, &mut out);

        let mut expected = vec![0.0; 7];
        for i in 0..n {
            expected[ids[i]] += weights[i] * values[i];
        }
        for (a, b) in out.iter().zip(&expected) {
            assert_relative_eq!(a, b, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_cross_product_is_symmetric_and_correct() {
        let n = CHUNK_LEN + 100;
        let x = Array2::from_shape_fn((n, 3), |(i, j)| ((i * (j + 1)) % 11) as f64 - 5.0);
        let w: Vec<f64> = (0..n).map(|i| 0.5 + (i % 4) as f64).collect();

        let xtwx = cross_product(x.view(), Some(&w));
        for a in 0..3 {
            for b in 0..3 {
                let direct: f64 = (0..n).map(|i| w[i] * x[[i, a]] * x[[i, b]]).sum();
                assert_relative_eq!(xtwx[[a, b]], direct, max_relative = 1e-10);
                assert_eq!(xtwx[[a, b]], xtwx[[b, a]]);
            }
        }
    }

    #[test]
    fn test_group_row_sums() {
        let rows = Array2::from_shape_fn((6, 2), |(i, j)| (i + j) as f64);
        let ids = [0, 1, 0, 1, 2, 2];
        let out = group_row_sums(rows.view(), &ids, 3);
        assert_eq!(out[[0, 0]], 0.0 + 2.0);
        assert_eq!(out[[1, 1]], 2.0 + 4.0);
        assert_eq!(out[[2, 0]], 4.0 + 5.0);
    }
}
