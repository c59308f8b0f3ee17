//! Interaural phase difference cue
//!
//! Each source owns a distribution over the tau grid. A bin's phase
//! residual against every candidate delay is scored with a Gaussian and
//! the delays are marginalised out.

use std::f64::consts::PI;

use ndarray::{Array2, Array3, ArrayView3, Axis};

use super::{log_normal, log_sum_exp, CueModel, DctBasis, IPD_VAR_FLOOR};
use crate::config::{CueMode, RepetitionModes};
use crate::error::CueKind;
use crate::mixture::{PairObservation, TauGrid};

/// Keeps every delay reachable after re-estimation
const PSI_FLOOR: f64 = 1e-12;

/// Phase-difference model for one pair
#[derive(Debug, Clone)]
pub struct IpdModel {
    /// Joint weight of (source, delay), garbage row last; sums to 1
    psi: Array2<f64>,
    /// Phase mean per (genuine source, frequency)
    xi: Array2<f64>,
    /// Phase variance per (genuine source, frequency)
    var: Array2<f64>,
    /// Number of genuine sources
    sources: usize,
    /// Garbage row present
    garbage: bool,
}

impl IpdModel {
    /// Build from per-source delay distributions, shape (I, Ntau)
    pub fn new(delay_rows: &Array2<f64>, bins: usize, var_init: f64, garbage: bool) -> Self {
        let (sources, taus) = delay_rows.dim();
        let rows = sources + usize::from(garbage);
        let garbage_mass = Self::garbage_mass(sources, garbage);
        let source_mass = (1.0 - garbage_mass) / sources as f64;

        let mut psi = Array2::zeros((rows, taus));
        for (i, row) in delay_rows.axis_iter(Axis(0)).enumerate() {
            let total: f64 = row.iter().map(|v| v.max(0.0)).sum();
            for (k, &v) in row.iter().enumerate() {
                psi[[i, k]] = if total > 0.0 {
                    source_mass * v.max(0.0) / total
                } else {
                    source_mass / taus as f64
                };
            }
        }
        if garbage {
            psi.row_mut(sources).fill(garbage_mass / taus as f64);
        }

        let mut model = Self {
            psi,
            xi: Array2::zeros((sources, bins)),
            var: Array2::from_elem((sources, bins), var_init.max(IPD_VAR_FLOOR)),
            sources,
            garbage,
        };
        model.floor_psi();
        model
    }

    fn garbage_mass(sources: usize, garbage: bool) -> f64 {
        if garbage {
            1.0 / (sources + 1) as f64
        } else {
            0.0
        }
    }

    /// P(tau | source) per row, garbage row last
    pub fn delay_posterior(&self) -> Array2<f64> {
        let mut out = self.psi.clone();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let total = row.sum();
            if total > 0.0 {
                row.mapv_inplace(|v| v / total);
            }
        }
        out
    }

    /// Joint (source, delay) weights
    pub fn joint_weights(&self) -> &Array2<f64> {
        &self.psi
    }

    /// Phase means
    pub fn phase_mean(&self) -> &Array2<f64> {
        &self.xi
    }

    /// Phase variances
    pub fn phase_var(&self) -> &Array2<f64> {
        &self.var
    }

    fn floor_psi(&mut self) {
        let garbage_mass = Self::garbage_mass(self.sources, self.garbage);
        let mut real = self.psi.slice_mut(ndarray::s![..self.sources, ..]);
        real.mapv_inplace(|v| v.max(PSI_FLOOR));
        let total = real.sum();
        real.mapv_inplace(|v| v * (1.0 - garbage_mass) / total);
    }

    /// Log terms ln psi + ln N for one bin and source into `out`
    #[inline]
    fn delay_terms(&self, residuals: &[f64], log_psi: &Array2<f64>, i: usize, f: usize, out: &mut [f64]) {
        let mean = self.xi[[i, f]];
        let var = self.var[[i, f]];
        for (k, (r, o)) in residuals.iter().zip(out.iter_mut()).enumerate() {
            *o = log_psi[[i, k]] + log_normal(*r, mean, var);
        }
    }

    fn fill_residuals(obs: &PairObservation, tau: &TauGrid, f: usize, t: usize, out: &mut [f64]) {
        for (o, &delay) in out.iter_mut().zip(tau.values()) {
            *o = obs.phase_residual(f, t, delay);
        }
    }
}

impl CueModel for IpdModel {
    fn kind(&self) -> CueKind {
        CueKind::Ipd
    }

    fn log_likelihood(&self, obs: &PairObservation, tau: &TauGrid) -> Array3<f64> {
        let (bins, frames) = (obs.bins(), obs.frames());
        let rows = self.psi.nrows();
        let log_psi = self.psi.mapv(f64::ln);
        let garbage_ll = if self.garbage {
            self.psi.row(self.sources).sum().ln() - (2.0 * PI).ln()
        } else {
            0.0
        };

        let mut out = Array3::zeros((bins, frames, rows));
        let mut residuals = vec![0.0; tau.len()];
        let mut terms = vec![0.0; tau.len()];

        for f in 0..bins {
            for t in 0..frames {
                Self::fill_residuals(obs, tau, f, t, &mut residuals);
                for i in 0..self.sources {
                    self.delay_terms(&residuals, &log_psi, i, f, &mut terms);
                    out[[f, t, i]] = log_sum_exp(&terms);
                }
                if self.garbage {
                    out[[f, t, self.sources]] = garbage_ll;
                }
            }
        }
        out
    }

    fn update(
        &mut self,
        obs: &PairObservation,
        tau: &TauGrid,
        weights: ArrayView3<'_, f64>,
        modes: &RepetitionModes,
        basis: Option<&DctBasis>,
    ) {
        let (bins, frames) = (obs.bins(), obs.frames());
        let taus = tau.len();
        let log_psi = self.psi.mapv(f64::ln);

        // Weighted sufficient statistics per (source, delay) and (source, frequency)
        let mut delay_mass = Array2::<f64>::zeros((self.sources, taus));
        let mut s0 = Array2::<f64>::zeros((self.sources, bins));
        let mut s1 = Array2::<f64>::zeros((self.sources, bins));
        let mut s2 = Array2::<f64>::zeros((self.sources, bins));

        let mut residuals = vec![0.0; taus];
        let mut terms = vec![0.0; taus];

        for f in 0..bins {
            for t in 0..frames {
                Self::fill_residuals(obs, tau, f, t, &mut residuals);
                for i in 0..self.sources {
                    let w = weights[[f, t, i]];
                    if !(w > 0.0) {
                        continue;
                    }
                    self.delay_terms(&residuals, &log_psi, i, f, &mut terms);
                    let norm = log_sum_exp(&terms);
                    if !norm.is_finite() {
                        continue;
                    }
                    for k in 0..taus {
                        let r = w * (terms[k] - norm).exp();
                        let x = residuals[k];
                        delay_mass[[i, k]] += r;
                        s0[[i, f]] += r;
                        s1[[i, f]] += r * x;
                        s2[[i, f]] += r * x * x;
                    }
                }
            }
        }

        let total = delay_mass.sum();
        if total > 0.0 {
            let scale = 1.0 - Self::garbage_mass(self.sources, self.garbage);
            self.psi
                .slice_mut(ndarray::s![..self.sources, ..])
                .assign(&delay_mass.mapv(|v| scale * v / total));
            self.floor_psi();
        }

        for i in 0..self.sources {
            let pooled0: f64 = s0.row(i).sum();
            if pooled0 <= 0.0 {
                continue;
            }

            match modes.ipd_mean {
                CueMode::Disabled => self.xi.row_mut(i).fill(0.0),
                CueMode::FrequencyIndependent => {
                    let mean = s1.row(i).sum() / pooled0;
                    self.xi.row_mut(i).fill(mean);
                }
                CueMode::FrequencyDependent => {
                    for f in 0..bins {
                        if s0[[i, f]] > 0.0 {
                            self.xi[[i, f]] = s1[[i, f]] / s0[[i, f]];
                        }
                    }
                    if let Some(basis) = basis {
                        basis.project(self.xi.row_mut(i));
                    }
                }
            }

            // Spread around the (new) mean: S2 - 2 xi S1 + xi^2 S0
            let spread = |f: usize, xi: f64| s2[[i, f]] - 2.0 * xi * s1[[i, f]] + xi * xi * s0[[i, f]];
            match modes.ipd_var {
                CueMode::Disabled => {}
                CueMode::FrequencyIndependent => {
                    let total_spread: f64 = (0..bins).map(|f| spread(f, self.xi[[i, f]])).sum();
                    let var = (total_spread / pooled0).max(IPD_VAR_FLOOR);
                    self.var.row_mut(i).fill(var);
                }
                CueMode::FrequencyDependent => {
                    for f in 0..bins {
                        if s0[[i, f]] > 0.0 {
                            self.var[[i, f]] = spread(f, self.xi[[i, f]]) / s0[[i, f]];
                        }
                    }
                    if let Some(basis) = basis {
                        basis.project(self.var.row_mut(i));
                    }
                    self.var.row_mut(i).mapv_inplace(|v| v.max(IPD_VAR_FLOOR));
                }
            }
        }
    }

    fn permute_sources(&mut self, perm: &[usize]) {
        let psi = self.psi.clone();
        let xi = self.xi.clone();
        let var = self.var.clone();
        for (new, &old) in perm.iter().enumerate().take(self.sources) {
            self.psi.row_mut(new).assign(&psi.row(old));
            self.xi.row_mut(new).assign(&xi.row(old));
            self.var.row_mut(new).assign(&var.row(old));
        }
    }
}
