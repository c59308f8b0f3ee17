//! Per-microphone delay estimation
//!
//! Each pairwise delay constrains the difference of two microphone delays
//! (`d_second - d_first = tau`). Microphone 0 is pinned to zero and the
//! rest follow from a least-squares solve over all pairs.

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;

use crate::error::{MesslError, MesslResult};
use crate::mixture::TauGrid;
use crate::pairs::ChannelPair;

/// Singular values below this (relative to the largest) are treated as zero
const SVD_EPS: f64 = 1e-10;

/// Delay estimates for every source
#[derive(Debug, Clone)]
pub struct TdoaEstimate {
    /// Delay of each microphone relative to microphone 0, shape (I, C), samples
    pub per_mic: Array2<f64>,
    /// Posterior-mode delay of each pair, shape (Np, I), samples
    pub pair_deltas: Array2<f64>,
}

impl TdoaEstimate {
    /// Pair deltas implied by the per-mic solution, shape (Np, I)
    pub fn consistent_pair_deltas(&self, pairs: &[ChannelPair]) -> Array2<f64> {
        let sources = self.per_mic.nrows();
        Array2::from_shape_fn((pairs.len(), sources), |(p, i)| {
            let pair = pairs[p];
            self.per_mic[[i, pair.second]] - self.per_mic[[i, pair.first]]
        })
    }
}

/// Least-squares microphone delays from pairwise deltas
pub fn solve_mic_delays(channels: usize, pairs: &[ChannelPair], deltas: &[f64]) -> MesslResult<Vec<f64>> {
    if pairs.len() != deltas.len() {
        return Err(MesslError::ShapeMismatch {
            what: "pair deltas",
            expected: format!("{} values", pairs.len()),
            got: format!("{} values", deltas.len()),
        });
    }
    if channels < 2 {
        return Ok(vec![0.0; channels]);
    }

    // Unknowns d_1..d_{C-1}; column c-1 holds mic c
    let mut a = DMatrix::<f64>::zeros(pairs.len(), channels - 1);
    let b = DVector::from_column_slice(deltas);
    for (row, pair) in pairs.iter().enumerate() {
        if pair.first >= channels || pair.second >= channels {
            return Err(MesslError::InvalidConfig(format!(
                "pair ({}, {}) outside {channels} channels",
                pair.first, pair.second
            )));
        }
        if pair.second > 0 {
            a[(row, pair.second - 1)] += 1.0;
        }
        if pair.first > 0 {
            a[(row, pair.first - 1)] -= 1.0;
        }
    }

    let svd = a.svd(true, true);
    let eps = SVD_EPS * svd.singular_values.max().max(1.0);
    let solution = svd
        .solve(&b, eps)
        .map_err(|e| MesslError::SolveFailed(e.to_string()))?;

    let mut delays = Vec::with_capacity(channels);
    delays.push(0.0);
    delays.extend(solution.iter().copied());
    Ok(delays)
}

/// Mode of each genuine source's delay posterior, garbage row ignored
pub fn posterior_mode(delay_posterior: &Array2<f64>, sources: usize, tau: &TauGrid) -> Vec<f64> {
    (0..sources.min(delay_posterior.nrows()))
        .map(|i| {
            let best = delay_posterior
                .row(i)
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(bk, bv), (k, &v)| if v > bv { (k, v) } else { (bk, bv) })
                .0;
            tau.get(best)
        })
        .collect()
}

/// Estimate per-microphone delays of every genuine source
///
/// `delay_posteriors` holds one P(tau | source) table per pair; rows past
/// `sources` (the garbage row) never enter the solve.
pub fn estimate(
    channels: usize,
    pairs: &[ChannelPair],
    delay_posteriors: &[Array2<f64>],
    sources: usize,
    tau: &TauGrid,
) -> MesslResult<TdoaEstimate> {
    let mut pair_deltas = Array2::zeros((pairs.len(), sources));
    for (p, posterior) in delay_posteriors.iter().enumerate() {
        for (i, delta) in posterior_mode(posterior, sources, tau).into_iter().enumerate() {
            pair_deltas[[p, i]] = delta;
        }
    }

    let mut per_mic = Array2::zeros((sources, channels));
    for i in 0..sources {
        let deltas: Vec<f64> = pair_deltas.column(i).to_vec();
        let delays = solve_mic_delays(channels, pairs, &deltas)?;
        for (c, d) in delays.into_iter().enumerate() {
            per_mic[[i, c]] = d;
        }
    }

    Ok(TdoaEstimate { per_mic, pair_deltas })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairs::select_pairs;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_recovers_consistent_delays() {
        let pairs = select_pairs(3, None).unwrap().pairs;
        // (0,1), (0,2), (1,2) at true delays [0, 5, 10]
        let delays = solve_mic_delays(3, &pairs, &[5.0, 10.0, 5.0]).unwrap();
        assert_abs_diff_eq!(delays[0], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(delays[1], 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(delays[2], 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_least_squares_spreads_error() {
        let pairs = select_pairs(3, None).unwrap().pairs;
        // Inconsistent loop: 1 + 1 != 3
        let delays = solve_mic_delays(3, &pairs, &[1.0, 3.0, 1.0]).unwrap();
        let residual = |d: &[f64]| {
            (d[1] - d[0] - 1.0).powi(2) + (d[2] - d[0] - 3.0).powi(2) + (d[2] - d[1] - 1.0).powi(2)
        };
        assert!(residual(&delays) < residual(&[0.0, 1.0, 2.0]));
        assert!(residual(&delays) < residual(&[0.0, 1.0, 3.0]));
    }

    #[test]
    fn test_reference_mic_pairs() {
        let pairs = select_pairs(3, Some(2)).unwrap().pairs;
        // (2,0): d0 - d2 = -10, (2,1): d1 - d2 = -5
        let delays = solve_mic_delays(3, &pairs, &[-10.0, -5.0]).unwrap();
        assert_abs_diff_eq!(delays[1], 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(delays[2], 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_estimate_ignores_garbage_row() {
        let tau = TauGrid::symmetric(10.0, 1.0).unwrap();
        let pairs = select_pairs(3, None).unwrap().pairs;
        let peaked = |deltas: [f64; 2]| {
            let mut table = Array2::zeros((3, tau.len()));
            for (i, d) in deltas.iter().enumerate() {
                table[[i, tau.nearest_index(*d)]] = 1.0;
            }
            // Garbage row peaks somewhere misleading
            table[[2, 0]] = 5.0;
            table
        };
        let posteriors = vec![peaked([5.0, -2.0]), peaked([10.0, -4.0]), peaked([5.0, -2.0])];
        let est = estimate(3, &pairs, &posteriors, 2, &tau).unwrap();
        assert_eq!(est.per_mic.dim(), (2, 3));
        assert_abs_diff_eq!(est.per_mic[[0, 2]], 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(est.per_mic[[1, 2]], -4.0, epsilon = 1e-9);

        let consistent = est.consistent_pair_deltas(&pairs);
        assert_abs_diff_eq!(consistent[[2, 0]], 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let pairs = select_pairs(3, None).unwrap().pairs;
        assert!(solve_mic_delays(3, &pairs, &[1.0]).is_err());
    }
}
