//! Cluster score sums and the CRV1 meat matrix.

use ndarray::{Array2, ArrayView2, Axis};

use crate::reduce;

/// Meat over all `n_clusters` levels of a dense cluster index.
pub fn cluster_meat(scores: ArrayView2<f64>, cluster_col: &[usize], n_clusters: usize) -> Array2<f64> {
    let sums = reduce::group_row_sums(scores, cluster_col, n_clusters);
    reduce::cross_product(sums.view(), None)
}

/// `Σ_g s_g s_gᵗ` over the clusters listed in `cluster_ids` only.
///
/// Observations whose code is not listed do not contribute; listed ids never
/// observed contribute zero. The Python binding passes its ids this way; the
/// engine always uses [`cluster_meat`].
pub fn listed_cluster_meat(scores: ArrayView2<f64>, cluster_ids: &[usize], cluster_col: &[usize]) -> Array2<f64> {
    let n_levels = cluster_col
        .iter()
        .chain(cluster_ids)
        .max()
        .map_or(0, |&m| m + 1);
    let mut slot = vec![None; n_levels];
    for (position, &g) in cluster_ids.iter().enumerate() {
        slot[g] = Some(position);
    }

    let (rows, codes): (Vec<usize>, Vec<usize>) = cluster_col
        .iter()
        .enumerate()
        .filter_map(|(i, &g)| slot[g].map(|position| (i, position)))
        .unzip();
    cluster_meat(scores.select(Axis(0), &rows).view(), &codes, cluster_ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_cluster_meat_sums_scores_within_clusters() {
        let scores = array![[1.0, 2.0], [0.5, -1.0], [2.0, 0.0], [-1.0, 1.0]];
        let cluster = [0, 1, 0, 1];
        let meat = cluster_meat(scores.view(), &cluster, 2);

        // s_0 = (3, 2), s_1 = (-0.5, 0)
        assert_relative_eq!(meat[(0, 0)], 9.25, epsilon = 1e-12);
        assert_relative_eq!(meat[(0, 1)], 6.0, epsilon = 1e-12);
        assert_relative_eq!(meat[(1, 0)], 6.0, epsilon = 1e-12);
        assert_relative_eq!(meat[(1, 1)], 4.0, epsilon = 1e-12);

        let listed = listed_cluster_meat(scores.view(), &[1, 0], &cluster);
        for (a, b) in listed.iter().zip(meat.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_unlisted_clusters_are_skipped() {
        let scores = array![[1.0], [2.0], [3.0]];
        let meat = listed_cluster_meat(scores.view(), &[1, 7], &[0, 1, 1]);
        assert_relative_eq!(meat[(0, 0)], 25.0, epsilon = 1e-12);
    }
}
