// Utility functions for ml-service

use ndarray::{Array2, ArrayView1, Axis};
use std::cmp::Ordering;
use std::collections::HashSet;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Half-life decay factor in (0, 1]. Negative ages (clock skew) count as fresh.
pub fn exponential_decay(elapsed_secs: f64, half_life_days: f64) -> f64 {
    let days = (elapsed_secs / SECONDS_PER_DAY).max(0.0);
    0.5_f64.powf(days / half_life_days)
}

pub fn dot(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.dot(&b)
}

pub fn l2_norm(v: ArrayView1<f32>) -> f32 {
    v.dot(&v).sqrt()
}

pub fn cosine_similarity(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let denom = l2_norm(a) * l2_norm(b);
    if denom < f32::EPSILON {
        0.0
    } else {
        a.dot(&b) / denom
    }
}

/// Row-wise L2 norms, used as the popularity proxy.
pub fn row_norms(matrix: &Array2<f32>) -> Vec<f32> {
    matrix.axis_iter(Axis(0)).map(l2_norm).collect()
}

/// Top-k selection over dense scores.
///
/// Excluded indices (and anything rejected by `filter`) are treated as
/// negative infinity and never returned, so the result may be shorter than
/// `k`. Ties are broken by ascending index.
pub fn top_k<F>(scores: &[f32], k: usize, exclude: &HashSet<usize>, filter: F) -> Vec<(usize, f32)>
where
    F: Fn(usize) -> bool,
{
    let mut candidates: Vec<(usize, f32)> = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(idx, score)| !exclude.contains(idx) && filter(*idx) && score.is_finite())
        .collect();

    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    candidates.truncate(k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_exponential_decay() {
        // One half-life in
        let score = exponential_decay(7.0 * SECONDS_PER_DAY, 7.0);
        assert!((score - 0.5).abs() < 1e-9);

        let fresh = exponential_decay(0.0, 7.0);
        assert!((fresh - 1.0).abs() < 1e-9);

        let future = exponential_decay(-3600.0, 7.0);
        assert!((future - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_decay_stays_in_unit_interval() {
        for days in [0.5, 1.0, 30.0, 365.0, 3650.0] {
            let d = exponential_decay(days * SECONDS_PER_DAY, 90.0);
            assert!(d > 0.0 && d <= 1.0);
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = array![1.0_f32, 0.0];
        let b = array![0.0_f32, 2.0];
        assert!(cosine_similarity(a.view(), b.view()).abs() < 0.001);
        assert!((cosine_similarity(a.view(), a.view()) - 1.0).abs() < 0.001);

        let zero = array![0.0_f32, 0.0];
        assert_eq!(cosine_similarity(a.view(), zero.view()), 0.0);
    }

    #[test]
    fn test_top_k_sorted_and_truncated() {
        let scores = [0.1, 0.9, 0.5, 0.7];
        let top = top_k(&scores, 2, &HashSet::new(), |_| true);
        assert_eq!(top, vec![(1, 0.9), (3, 0.7)]);
    }

    #[test]
    fn test_top_k_exclusion_covers_positive_scores() {
        let scores = [0.8, 0.6, -0.2, -0.5, 0.3];
        let exclude: HashSet<usize> = [0, 1, 4].into_iter().collect();
        let top = top_k(&scores, 10, &exclude, |_| true);

        assert_eq!(top.len(), 2);
        assert!(top.iter().all(|(idx, _)| !exclude.contains(idx)));
        assert!(top.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_top_k_filter_and_ties() {
        let scores = [0.5, 0.5, 0.5, 0.9];
        let top = top_k(&scores, 3, &HashSet::new(), |idx| idx != 3);
        assert_eq!(top, vec![(0, 0.5), (1, 0.5), (2, 0.5)]);
    }

    #[test]
    fn test_row_norms() {
        let m = array![[3.0_f32, 4.0], [0.0, 0.0]];
        let norms = row_norms(&m);
        assert!((norms[0] - 5.0).abs() < 0.001);
        assert_eq!(norms[1], 0.0);
    }
}
