//! Interaural level difference cue

use ndarray::{Array2, Array3, ArrayView3};

use super::{log_normal, CueModel, DctBasis, ILD_VAR_FLOOR};
use crate::config::{CueMode, RepetitionModes};
use crate::error::CueKind;
use crate::mixture::{PairObservation, TauGrid};

/// Gaussian level-difference model per (source, frequency)
#[derive(Debug, Clone)]
pub struct IldModel {
    /// Mean ILD in dB, garbage row last
    mean: Array2<f64>,
    /// ILD variance in dB^2, garbage row last
    var: Array2<f64>,
    /// Initial means the MAP update is pulled towards
    prior_mean: Array2<f64>,
    /// Prior precision (0 = plain maximum likelihood)
    prior_precision: f64,
    /// Number of genuine sources
    sources: usize,
}

impl IldModel {
    /// Create model from per-frequency initial mean and std
    pub fn new(
        mean_init: &[f64],
        std_init: &[f64],
        sources: usize,
        garbage: bool,
        prior_precision: f64,
    ) -> Self {
        let bins = mean_init.len();
        let rows = sources + usize::from(garbage);
        let mut mean = Array2::from_shape_fn((rows, bins), |(_, f)| mean_init[f]);
        let var = Array2::from_shape_fn((rows, bins), |(_, f)| (std_init[f] * std_init[f]).max(ILD_VAR_FLOOR));
        if garbage {
            mean.row_mut(sources).fill(0.0);
        }
        let prior_mean = Array2::from_shape_fn((sources, bins), |(_, f)| mean_init[f]);
        Self {
            mean,
            var,
            prior_mean,
            prior_precision,
            sources,
        }
    }

    /// Mean ILD per source
    pub fn mean(&self) -> &Array2<f64> {
        &self.mean
    }

    /// ILD variance per source
    pub fn var(&self) -> &Array2<f64> {
        &self.var
    }
}

impl CueModel for IldModel {
    fn kind(&self) -> CueKind {
        CueKind::Ild
    }

    fn log_likelihood(&self, obs: &PairObservation, _tau: &TauGrid) -> Array3<f64> {
        let (bins, frames) = (obs.bins(), obs.frames());
        let rows = self.mean.nrows();
        Array3::from_shape_fn((bins, frames, rows), |(f, t, i)| {
            log_normal(obs.ild[[f, t]], self.mean[[i, f]], self.var[[i, f]])
        })
    }

    fn update(
        &mut self,
        obs: &PairObservation,
        _tau: &TauGrid,
        weights: ArrayView3<'_, f64>,
        modes: &RepetitionModes,
        basis: Option<&DctBasis>,
    ) {
        let (bins, frames) = (obs.bins(), obs.frames());
        let precision = self.prior_precision;

        for i in 0..self.sources {
            let mut s0 = vec![0.0; bins];
            let mut s1 = vec![0.0; bins];
            let mut s2 = vec![0.0; bins];
            for f in 0..bins {
                for t in 0..frames {
                    let w = weights[[f, t, i]];
                    if w > 0.0 {
                        let x = obs.ild[[f, t]];
                        s0[f] += w;
                        s1[f] += w * x;
                        s2[f] += w * x * x;
                    }
                }
            }

            let pooled0: f64 = s0.iter().sum();
            if pooled0 <= 0.0 {
                continue;
            }

            match modes.ild {
                CueMode::Disabled => {}
                CueMode::FrequencyIndependent => {
                    let prior = self.prior_mean.row(i).mean().unwrap_or(0.0);
                    let pooled1: f64 = s1.iter().sum();
                    let pooled2: f64 = s2.iter().sum();
                    let mean = (pooled1 + precision * prior) / (pooled0 + precision);
                    let var = (pooled2 - 2.0 * mean * pooled1 + mean * mean * pooled0) / pooled0;
                    self.mean.row_mut(i).fill(mean);
                    self.var.row_mut(i).fill(var.max(ILD_VAR_FLOOR));
                }
                CueMode::FrequencyDependent => {
                    for f in 0..bins {
                        if s0[f] <= 0.0 {
                            continue;
                        }
                        let mean = (s1[f] + precision * self.prior_mean[[i, f]]) / (s0[f] + precision);
                        self.mean[[i, f]] = mean;
                        self.var[[i, f]] = (s2[f] - 2.0 * mean * s1[f] + mean * mean * s0[f]) / s0[f];
                    }
                    if let Some(basis) = basis {
                        basis.project(self.mean.row_mut(i));
                        basis.project(self.var.row_mut(i));
                    }
                    self.var.row_mut(i).mapv_inplace(|v| v.max(ILD_VAR_FLOOR));
                }
            }
        }
    }

    fn permute_sources(&mut self, perm: &[usize]) {
        let mean = self.mean.clone();
        let var = self.var.clone();
        let prior = self.prior_mean.clone();
        for (new, &old) in perm.iter().enumerate().take(self.sources) {
            self.mean.row_mut(new).assign(&mean.row(old));
            self.var.row_mut(new).assign(&var.row(old));
            self.prior_mean.row_mut(new).assign(&prior.row(old));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixture::{bin_frequencies, Mixture};
    use crate::pairs::ChannelPair;
    use approx::assert_abs_diff_eq;
    use num_complex::Complex64;

    fn level_obs() -> PairObservation {
        let bins = 8;
        let frames = 10;
        let mut spectra = Array3::zeros((bins, frames, 2));
        for f in 0..bins {
            for t in 0..frames {
                // Source 0 is 6 dB louder on channel 0, source 1 6 dB louder on channel 1
                let (a, b) = if t % 2 == 0 { (2.0, 1.0) } else { (1.0, 2.0) };
                spectra[[f, t, 0]] = Complex64::new(a, 0.0);
                spectra[[f, t, 1]] = Complex64::new(b, 0.0);
            }
        }
        let mixture = Mixture::new(spectra).unwrap();
        PairObservation::new(&mixture, ChannelPair::new(0, 1), &bin_frequencies(bins, None))
    }

    fn oracle(obs: &PairObservation, rows: usize) -> Array3<f64> {
        Array3::from_shape_fn((obs.bins(), obs.frames(), rows), |(_, t, i)| {
            if i == t % 2 { 1.0 } else { 0.0 }
        })
    }

    fn modes(ild: CueMode) -> RepetitionModes {
        RepetitionModes {
            ipd: false,
            ipd_mean: CueMode::Disabled,
            ipd_var: CueMode::Disabled,
            ild,
            sp: CueMode::Disabled,
        }
    }

    #[test]
    fn test_update_recovers_levels() {
        let obs = level_obs();
        let tau = TauGrid::new(vec![0.0]).unwrap();
        let mut model = IldModel::new(&[0.0; 8], &[10.0; 8], 2, true, 0.0);
        let weights = oracle(&obs, 3);
        model.update(&obs, &tau, weights.view(), &modes(CueMode::FrequencyDependent), None);

        let expected = 20.0 * 2.0f64.log10();
        assert_abs_diff_eq!(model.mean()[[0, 3]], expected, epsilon = 1e-9);
        assert_abs_diff_eq!(model.mean()[[1, 3]], -expected, epsilon = 1e-9);
        assert_abs_diff_eq!(model.var()[[0, 3]], ILD_VAR_FLOOR, epsilon = 1e-12);
        // Garbage row untouched
        assert_abs_diff_eq!(model.mean()[[2, 3]], 0.0);
        assert_abs_diff_eq!(model.var()[[2, 3]], 100.0);
    }

    #[test]
    fn test_prior_precision_shrinks_mean() {
        let obs = level_obs();
        let tau = TauGrid::new(vec![0.0]).unwrap();
        let mut free = IldModel::new(&[0.0; 8], &[10.0; 8], 2, false, 0.0);
        let mut shrunk = IldModel::new(&[0.0; 8], &[10.0; 8], 2, false, 5.0);
        let weights = oracle(&obs, 2);
        let m = modes(CueMode::FrequencyIndependent);
        free.update(&obs, &tau, weights.view(), &m, None);
        shrunk.update(&obs, &tau, weights.view(), &m, None);
        assert!(shrunk.mean()[[0, 0]].abs() < free.mean()[[0, 0]].abs());
        assert!(shrunk.mean()[[0, 0]] > 0.0);
    }

    #[test]
    fn test_log_likelihood_shape() {
        let obs = level_obs();
        let tau = TauGrid::new(vec![0.0]).unwrap();
        let model = IldModel::new(&[0.0; 8], &[10.0; 8], 2, true, 0.0);
        let ll = model.log_likelihood(&obs, &tau);
        assert_eq!(ll.dim(), (8, 10, 3));
        assert!(ll.iter().all(|v| v.is_finite()));
    }
}
