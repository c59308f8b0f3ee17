//! Mixture spectra, tau grid and per-pair observation features

use std::f64::consts::PI;

use ndarray::{Array2, Array3, ArrayView2, Axis};
use num_complex::Complex64;

use crate::error::{MesslError, MesslResult};
use crate::pairs::ChannelPair;

/// Magnitude floor for level ratios and log powers
const MAG_FLOOR: f64 = 1e-12;

/// Wrap a phase into [-pi, pi)
#[inline]
pub fn wrap_phase(phase: f64) -> f64 {
    (phase + PI).rem_euclid(2.0 * PI) - PI
}

/// Multichannel STFT mixture, shape (frequency, time, channel)
#[derive(Debug, Clone)]
pub struct Mixture {
    spectra: Array3<Complex64>,
}

impl Mixture {
    /// Wrap spectra after checking shape and finiteness
    pub fn new(spectra: Array3<Complex64>) -> MesslResult<Self> {
        let (bins, frames, channels) = spectra.dim();
        if bins < 2 || frames == 0 {
            return Err(MesslError::InvalidMixture(format!(
                "expected at least 2 bins and 1 frame, got {bins}x{frames}"
            )));
        }
        if channels < 2 {
            return Err(MesslError::InvalidMixture(format!(
                "expected at least 2 channels, got {channels}"
            )));
        }
        if spectra.iter().any(|x| !x.re.is_finite() || !x.im.is_finite()) {
            return Err(MesslError::InvalidMixture("spectra contain non-finite values".into()));
        }
        Ok(Self { spectra })
    }

    /// Number of frequency bins
    pub fn bins(&self) -> usize {
        self.spectra.dim().0
    }

    /// Number of time frames
    pub fn frames(&self) -> usize {
        self.spectra.dim().1
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.spectra.dim().2
    }

    /// One channel's spectrogram
    pub fn channel(&self, channel: usize) -> ArrayView2<'_, Complex64> {
        self.spectra.index_axis(Axis(2), channel)
    }
}

/// Candidate delays in samples, shared by every pair
#[derive(Debug, Clone, PartialEq)]
pub struct TauGrid {
    values: Vec<f64>,
}

impl TauGrid {
    /// Create grid; values must be finite and strictly ascending
    pub fn new(values: Vec<f64>) -> MesslResult<Self> {
        if values.is_empty() {
            return Err(MesslError::EmptyTauGrid);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(MesslError::UnsortedTauGrid { index });
        }
        if let Some(index) = values.windows(2).position(|w| w[1] <= w[0]) {
            return Err(MesslError::UnsortedTauGrid { index: index + 1 });
        }
        Ok(Self { values })
    }

    /// Evenly spaced grid from `-max_delay` to `max_delay`
    pub fn symmetric(max_delay: f64, step: f64) -> MesslResult<Self> {
        if !(step > 0.0 && max_delay >= 0.0) {
            return Err(MesslError::InvalidConfig(format!(
                "invalid tau grid: max {max_delay}, step {step}"
            )));
        }
        let count = (max_delay / step).round() as i64;
        Self::new((-count..=count).map(|k| k as f64 * step).collect())
    }

    /// Number of candidate delays
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if empty (never true for a constructed grid)
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Delay values
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Delay at index
    pub fn get(&self, index: usize) -> f64 {
        self.values[index]
    }

    /// Index of the grid point closest to `delay`
    pub fn nearest_index(&self, delay: f64) -> usize {
        self.values
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - delay).abs().total_cmp(&(b.1 - delay).abs()))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Typical spacing between neighbours
    pub fn step(&self) -> f64 {
        if self.values.len() < 2 {
            1.0
        } else {
            (self.values[self.values.len() - 1] - self.values[0]) / (self.values.len() - 1) as f64
        }
    }
}

/// Angular frequency (radians per sample) of each bin
pub fn bin_frequencies(bins: usize, window_size: Option<usize>) -> Vec<f64> {
    match window_size {
        Some(window) => (0..bins)
            .map(|f| 2.0 * PI * f as f64 / window as f64)
            .collect(),
        None => (0..bins)
            .map(|f| PI * f as f64 / (bins - 1).max(1) as f64)
            .collect(),
    }
}

/// Interaural features of one channel pair
#[derive(Debug, Clone)]
pub struct PairObservation {
    /// Channels the features were taken from
    pub pair: ChannelPair,
    /// Phase of X_first * conj(X_second), shape (F, T)
    pub ipd: Array2<f64>,
    /// Level ratio in dB, shape (F, T)
    pub ild: Array2<f64>,
    /// Mean power of the two channels in dB, shape (F, T)
    pub log_power: Array2<f64>,
    /// Angular frequency per bin
    pub omega: Vec<f64>,
}

impl PairObservation {
    /// Extract features for `pair`
    pub fn new(mixture: &Mixture, pair: ChannelPair, omega: &[f64]) -> Self {
        let left = mixture.channel(pair.first);
        let right = mixture.channel(pair.second);
        let shape = left.dim();

        let mut ipd = Array2::zeros(shape);
        let mut ild = Array2::zeros(shape);
        let mut log_power = Array2::zeros(shape);

        for ((f, t), l) in left.indexed_iter() {
            let r = right[[f, t]];
            ipd[[f, t]] = (l * r.conj()).arg();
            let l_mag = l.norm().max(MAG_FLOOR);
            let r_mag = r.norm().max(MAG_FLOOR);
            ild[[f, t]] = 20.0 * (l_mag / r_mag).log10();
            let power = 0.5 * (l.norm_sqr() + r.norm_sqr());
            log_power[[f, t]] = 10.0 * power.max(MAG_FLOOR * MAG_FLOOR).log10();
        }

        Self {
            pair,
            ipd,
            ild,
            log_power,
            omega: omega.to_vec(),
        }
    }

    /// Number of frequency bins
    pub fn bins(&self) -> usize {
        self.ipd.dim().0
    }

    /// Number of time frames
    pub fn frames(&self) -> usize {
        self.ipd.dim().1
    }

    /// Phase residual of bin (f, t) against delay `tau`
    #[inline]
    pub fn phase_residual(&self, f: usize, t: usize, tau: f64) -> f64 {
        wrap_phase(self.ipd[[f, t]] - self.omega[f] * tau)
    }

    /// PHAT-style cross-correlation score for every delay in the grid
    pub fn cross_correlation(&self, tau: &TauGrid) -> Vec<f64> {
        tau.values()
            .iter()
            .map(|&delay| {
                self.ipd
                    .indexed_iter()
                    .map(|((f, _), &phase)| (phase - self.omega[f] * delay).cos())
                    .sum()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delayed_mixture(delay: f64) -> Mixture {
        let bins = 9;
        let frames = 4;
        let omega = bin_frequencies(bins, None);
        let mut spectra = Array3::zeros((bins, frames, 2));
        for f in 0..bins {
            for t in 0..frames {
                let base = Complex64::from_polar(1.0, 0.3 * (f + t) as f64);
                spectra[[f, t, 0]] = base;
                spectra[[f, t, 1]] = base * Complex64::from_polar(0.5, -omega[f] * delay);
            }
        }
        Mixture::new(spectra).unwrap()
    }

    #[test]
    fn test_wrap_phase() {
        assert!((wrap_phase(2.5 * PI) - 0.5 * PI).abs() < 1e-12);
        assert!((wrap_phase(0.5) - 0.5).abs() < 1e-12);
        assert!((wrap_phase(-0.5 - 2.0 * PI) + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_tau_grid_validation() {
        assert!(matches!(TauGrid::new(vec![]), Err(MesslError::EmptyTauGrid)));
        assert!(matches!(
            TauGrid::new(vec![0.0, 1.0, 1.0]),
            Err(MesslError::UnsortedTauGrid { index: 2 })
        ));
        let grid = TauGrid::symmetric(3.0, 1.0).unwrap();
        assert_eq!(grid.len(), 7);
        assert_eq!(grid.nearest_index(1.2), 4);
        assert!((grid.step() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mixture_validation() {
        assert!(Mixture::new(Array3::zeros((4, 3, 1))).is_err());
        assert!(Mixture::new(Array3::zeros((1, 3, 2))).is_err());
        let mut spectra = Array3::zeros((4, 3, 2));
        spectra[[0, 0, 0]] = Complex64::new(f64::NAN, 0.0);
        assert!(Mixture::new(spectra).is_err());
    }

    #[test]
    fn test_pair_features_match_delay() {
        let mixture = delayed_mixture(2.0);
        let omega = bin_frequencies(mixture.bins(), None);
        let obs = PairObservation::new(&mixture, ChannelPair::new(0, 1), &omega);

        for f in 0..obs.bins() {
            for t in 0..obs.frames() {
                assert!(obs.phase_residual(f, t, 2.0).abs() < 1e-9);
                assert!((obs.ild[[f, t]] - 20.0 * 2.0f64.log10()).abs() < 1e-9);
            }
        }

        let grid = TauGrid::symmetric(4.0, 1.0).unwrap();
        let score = obs.cross_correlation(&grid);
        let best = score
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| grid.get(i))
            .unwrap();
        assert_eq!(best, 2.0);
    }
}
