//! Per-pair initialization
//!
//! Seeds come from (in order of preference) caller-supplied delay tables,
//! caller-supplied per-microphone source delays, a held mask prior (flat
//! delays), or a short single-pair bootstrap run of the engine itself.

use ndarray::{s, Array2, Array3};

use crate::config::{MesslConfig, ResolvedModes};
use crate::cues::{IldModel, IpdModel, SourcePriorCue, SourcePriorModel};
use crate::engine::{PairEmEngine, PairState};
use crate::error::MesslResult;
use crate::mixture::{PairObservation, TauGrid};
use crate::params::PairParams;

/// Smallest width of a seeded delay peak (samples)
const MIN_PEAK_WIDTH: f64 = 1e-3;

/// Initial labelling of one pair
#[derive(Debug, Clone)]
pub struct PairSeed {
    /// Soft mask, shape (F, T, I'); only bootstrap seeds carry one
    pub mask: Option<Array3<f64>>,
    /// P(tau | source) per genuine source, shape (I, Ntau)
    pub delay_rows: Array2<f64>,
}

/// Builds seeds and initial parameters for each pair
#[derive(Debug, Clone)]
pub struct PairInitializer<'a> {
    config: &'a MesslConfig,
    tau: &'a TauGrid,
    sources: usize,
}

impl<'a> PairInitializer<'a> {
    /// Create initializer
    pub fn new(config: &'a MesslConfig, tau: &'a TauGrid, sources: usize) -> Self {
        Self { config, tau, sources }
    }

    /// Flat delay distribution for every source
    pub fn uniform(&self) -> PairSeed {
        PairSeed {
            mask: None,
            delay_rows: Array2::from_elem((self.sources, self.tau.len()), 1.0 / self.tau.len() as f64),
        }
    }

    /// Caller-supplied P(tau | source) table, rows normalised
    pub fn from_table(&self, table: &Array2<f64>) -> PairSeed {
        let mut delay_rows = table.slice(s![..self.sources, ..]).to_owned();
        for mut row in delay_rows.rows_mut() {
            let total: f64 = row.iter().map(|v| v.max(0.0)).sum();
            if total > 0.0 {
                row.mapv_inplace(|v| v.max(0.0) / total);
            } else {
                row.fill(1.0 / self.tau.len() as f64);
            }
        }
        PairSeed { mask: None, delay_rows }
    }

    /// Rows peaked at each source's pair delay (samples)
    pub fn from_delays(&self, deltas: &[f64]) -> PairSeed {
        PairSeed {
            mask: None,
            delay_rows: self.peaked_rows(deltas),
        }
    }

    /// Rows peaked at the strongest cross-correlation maxima
    ///
    /// The `I` largest local maxima become peaks; if the grid has fewer,
    /// the largest remaining points fill in.
    pub fn from_cross_correlation(&self, obs: &PairObservation) -> PairSeed {
        let score = obs.cross_correlation(self.tau);
        let n = score.len();

        let is_peak = |k: usize| {
            let left = k == 0 || score[k] > score[k - 1];
            let right = k + 1 == n || score[k] >= score[k + 1];
            left && right
        };
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| score[b].total_cmp(&score[a]).then(a.cmp(&b)));

        let mut chosen: Vec<usize> = order.iter().copied().filter(|&k| is_peak(k)).take(self.sources).collect();
        for &k in &order {
            if chosen.len() >= self.sources {
                break;
            }
            if !chosen.contains(&k) {
                chosen.push(k);
            }
        }
        // Fewer grid points than sources: repeat the best one
        while chosen.len() < self.sources {
            chosen.push(order[0]);
        }

        let deltas: Vec<f64> = chosen.iter().map(|&k| self.tau.get(k)).collect();
        log::debug!(
            "Pair ({}, {}): cross-correlation peaks at {deltas:?}",
            obs.pair.first,
            obs.pair.second
        );
        self.from_delays(&deltas)
    }

    /// Short phase/level-only run of the engine on one pair
    pub fn bootstrap(&self, obs: &PairObservation) -> MesslResult<PairSeed> {
        let reduced = self.config.bootstrap();
        let seed = self.from_cross_correlation(obs);
        let params = self.params(obs, &seed.delay_rows, None)?;

        let engine = PairEmEngine::new(
            self.tau.clone(),
            ResolvedModes::resolve(&reduced, false),
            1.0,
            obs.bins(),
        );
        let mut states = vec![PairState::new(0, obs.clone(), params)];
        engine.run(&mut states, None);

        let state = &states[0];
        let delay_rows = state
            .params
            .delay_posterior()
            .slice(s![..self.sources, ..])
            .to_owned();
        Ok(PairSeed {
            mask: state.posterior.as_ref().map(|p| p.post.clone()),
            delay_rows,
        })
    }

    /// Initial cue parameters from a delay seed
    pub fn params(
        &self,
        obs: &PairObservation,
        delay_rows: &Array2<f64>,
        source_models: Option<&[SourcePriorModel]>,
    ) -> MesslResult<PairParams> {
        let bins = obs.bins();
        let garbage = self.config.garbage_source;
        let ild_mean = self.config.ild_mean_init.resolve(bins, "ild_mean_init")?;
        let ild_std = self.config.ild_std_init.resolve(bins, "ild_std_init")?;

        let ipd = IpdModel::new(delay_rows, bins, self.config.ipd_var_init, garbage);
        let ild = IldModel::new(&ild_mean, &ild_std, self.sources, garbage, self.config.ild_prior_precision);
        let sp = source_models.map(|models| SourcePriorCue::new(models, obs, garbage));
        Ok(PairParams::new(obs, ipd, ild, sp))
    }

    fn peaked_rows(&self, deltas: &[f64]) -> Array2<f64> {
        let width = self.tau.step().abs().max(MIN_PEAK_WIDTH);
        let mut rows = Array2::zeros((self.sources, self.tau.len()));
        for (i, &delta) in deltas.iter().enumerate().take(self.sources) {
            let mut row = rows.row_mut(i);
            for (k, &value) in self.tau.values().iter().enumerate() {
                let z = (value - delta) / width;
                row[k] = (-0.5 * z * z).exp();
            }
            let total = row.sum();
            if total > 0.0 {
                row.mapv_inplace(|v| v / total);
            } else {
                row.fill(0.0);
                row[self.tau.nearest_index(delta)] = 1.0;
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixture::{bin_frequencies, Mixture};
    use crate::pairs::ChannelPair;
    use num_complex::Complex64;

    fn two_delay_obs() -> PairObservation {
        let bins = 65;
        let frames = 16;
        let omega = bin_frequencies(bins, None);
        let mut spectra = Array3::zeros((bins, frames, 2));
        for f in 0..bins {
            for t in 0..frames {
                let delay = if (f + 2 * t) % 3 == 0 { -4.0 } else { 3.0 };
                let base = Complex64::from_polar(1.0, 0.9 * (f * 5 + t * 11) as f64);
                spectra[[f, t, 0]] = base;
                spectra[[f, t, 1]] = base * Complex64::from_polar(1.0, -omega[f] * delay);
            }
        }
        let mixture = Mixture::new(spectra).unwrap();
        PairObservation::new(&mixture, ChannelPair::new(0, 1), &omega)
    }

    fn argmax(row: ndarray::ArrayView1<'_, f64>) -> usize {
        row.iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k)
            .unwrap()
    }

    #[test]
    fn test_cross_correlation_finds_both_delays() {
        let config = MesslConfig::default();
        let tau = TauGrid::symmetric(8.0, 1.0).unwrap();
        let init = PairInitializer::new(&config, &tau, 2);
        let seed = init.from_cross_correlation(&two_delay_obs());

        let mut found: Vec<f64> = (0..2).map(|i| tau.get(argmax(seed.delay_rows.row(i)))).collect();
        found.sort_by(f64::total_cmp);
        assert_eq!(found, vec![-4.0, 3.0]);
    }

    #[test]
    fn test_bootstrap_returns_mask_and_rows() {
        let config = MesslConfig::default().with_garbage_source();
        let tau = TauGrid::symmetric(8.0, 1.0).unwrap();
        let init = PairInitializer::new(&config, &tau, 2);
        let seed = init.bootstrap(&two_delay_obs()).unwrap();

        assert_eq!(seed.delay_rows.dim(), (2, tau.len()));
        let mask = seed.mask.unwrap();
        assert_eq!(mask.dim(), (65, 16, 3));
        for row in seed.delay_rows.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_table_rows_normalised() {
        let config = MesslConfig::default();
        let tau = TauGrid::symmetric(1.0, 1.0).unwrap();
        let init = PairInitializer::new(&config, &tau, 2);
        let table = ndarray::array![[2.0, 2.0, 0.0], [0.0, 0.0, 0.0], [9.0, 9.0, 9.0]];
        let seed = init.from_table(&table);
        assert_eq!(seed.delay_rows.dim(), (2, 3));
        assert!((seed.delay_rows[[0, 0]] - 0.5).abs() < 1e-12);
        assert!((seed.delay_rows[[1, 2]] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_peaked_rows_centre_on_delay() {
        let config = MesslConfig::default();
        let tau = TauGrid::symmetric(5.0, 1.0).unwrap();
        let init = PairInitializer::new(&config, &tau, 2);
        let seed = init.from_delays(&[2.0, -1.0]);
        assert_eq!(tau.get(argmax(seed.delay_rows.row(0))), 2.0);
        assert_eq!(tau.get(argmax(seed.delay_rows.row(1))), -1.0);
    }
}
