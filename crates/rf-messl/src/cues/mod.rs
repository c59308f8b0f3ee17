//! Cue models
//!
//! Each cue scores every (frequency, time, source) bin of one channel pair
//! and re-fits its parameters from posterior weights:
//! - Interaural phase difference, marginalised over the tau grid
//! - Interaural level difference
//! - Pretrained source-prior GMMs over log spectra
//!
//! Source axes always carry the genuine sources first and, when enabled,
//! the garbage source last. Garbage parameters are never re-fitted.

mod basis;
mod ild;
mod ipd;
mod source_prior;

pub use basis::DctBasis;
pub use ild::IldModel;
pub use ipd::IpdModel;
pub use source_prior::{SourcePriorCue, SourcePriorModel};

use std::f64::consts::PI;

use ndarray::{Array3, ArrayView3};

use crate::config::RepetitionModes;
use crate::error::CueKind;
use crate::mixture::{PairObservation, TauGrid};

/// Smallest variance any Gaussian cue may shrink to
pub(crate) const IPD_VAR_FLOOR: f64 = 1e-4;
pub(crate) const ILD_VAR_FLOOR: f64 = 1e-2;

/// Log density of N(x; mean, var)
#[inline]
pub(crate) fn log_normal(x: f64, mean: f64, var: f64) -> f64 {
    let d = x - mean;
    -0.5 * ((2.0 * PI * var).ln() + d * d / var)
}

/// log(sum(exp(values))) without overflow
pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Shared interface of the per-pair cue models
pub trait CueModel: Send + Sync {
    /// Which cue this is
    fn kind(&self) -> CueKind;

    /// Log-likelihood per (frequency, time, source), garbage included
    fn log_likelihood(&self, obs: &PairObservation, tau: &TauGrid) -> Array3<f64>;

    /// Re-fit parameters from posterior weights shaped like the log-likelihood
    fn update(
        &mut self,
        obs: &PairObservation,
        tau: &TauGrid,
        weights: ArrayView3<'_, f64>,
        modes: &RepetitionModes,
        basis: Option<&DctBasis>,
    );

    /// Reorder genuine sources: new source `i` takes old source `perm[i]`
    fn permute_sources(&mut self, perm: &[usize]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_sum_exp_stable() {
        let lse = log_sum_exp(&[1000.0, 1000.0]);
        assert!((lse - (1000.0 + 2.0f64.ln())).abs() < 1e-9);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
        assert!((log_sum_exp(&[f64::NEG_INFINITY, 0.0])).abs() < 1e-12);
    }

    #[test]
    fn test_log_normal_peak() {
        let at_mean = log_normal(0.0, 0.0, 1.0);
        assert!((at_mean + 0.5 * (2.0 * PI).ln()).abs() < 1e-12);
        assert!(log_normal(2.0, 0.0, 1.0) < at_mean);
    }
}
