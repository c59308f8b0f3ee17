//! Source-prior cue
//!
//! Pretrained diagonal GMMs over log-power spectra (dB), one per source.
//! The models themselves stay frozen; each pair adapts a per-source
//! channel response offset and per-frame component posteriors.

use std::path::Path;

use ndarray::{Array2, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use super::{log_normal, log_sum_exp, CueModel, DctBasis};
use crate::assignment::best_assignment;
use crate::config::{CueMode, RepetitionModes};
use crate::error::{CueKind, MesslError, MesslResult};
use crate::mixture::{PairObservation, TauGrid};

/// Variance floor for GMM components and the garbage model (dB^2)
const SP_VAR_FLOOR: f64 = 1e-3;

/// Pretrained source model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePriorModel {
    /// Component weights
    pub weights: Vec<f64>,
    /// Component means, one spectrum (dB) per component
    pub means: Vec<Vec<f64>>,
    /// Component variances, one spectrum per component
    pub variances: Vec<Vec<f64>>,
}

impl SourcePriorModel {
    /// Number of mixture components
    pub fn components(&self) -> usize {
        self.weights.len()
    }

    /// Check component tables against `bins`
    pub fn validate(&self, bins: usize) -> MesslResult<()> {
        let k = self.weights.len();
        if k == 0 {
            return Err(MesslError::InvalidConfig("source model has no components".into()));
        }
        if self.means.len() != k || self.variances.len() != k {
            return Err(MesslError::ShapeMismatch {
                what: "source model components",
                expected: format!("{k} means and variances"),
                got: format!("{} means, {} variances", self.means.len(), self.variances.len()),
            });
        }
        for (mean, var) in self.means.iter().zip(&self.variances) {
            if mean.len() != bins || var.len() != bins {
                return Err(MesslError::ShapeMismatch {
                    what: "source model spectrum",
                    expected: format!("{bins} bins"),
                    got: format!("{} / {}", mean.len(), var.len()),
                });
            }
        }
        if self.weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) || self.weights.iter().sum::<f64>() <= 0.0 {
            return Err(MesslError::InvalidConfig("source model weights must be non-negative".into()));
        }
        Ok(())
    }

    /// Parse a list of models from JSON
    pub fn list_from_json_str(text: &str) -> MesslResult<Vec<Self>> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a list of models from a JSON file
    pub fn list_from_json_file<P: AsRef<Path>>(path: P) -> MesslResult<Vec<Self>> {
        let text = std::fs::read_to_string(path)?;
        Self::list_from_json_str(&text)
    }
}

/// Frozen component tables of one model
#[derive(Debug, Clone)]
struct ComponentTables {
    log_weights: Vec<f64>,
    means: Array2<f64>,
    vars: Array2<f64>,
}

impl ComponentTables {
    fn from_model(model: &SourcePriorModel) -> Self {
        let total: f64 = model.weights.iter().sum();
        let k = model.components();
        let bins = model.means.first().map_or(0, Vec::len);
        Self {
            log_weights: model.weights.iter().map(|w| (w / total).ln()).collect(),
            means: Array2::from_shape_fn((k, bins), |(c, f)| model.means[c][f]),
            vars: Array2::from_shape_fn((k, bins), |(c, f)| model.variances[c][f].max(SP_VAR_FLOOR)),
        }
    }

    fn components(&self) -> usize {
        self.log_weights.len()
    }

    /// Marginal GMM log density of one bin
    fn marginal(&self, x: f64, f: usize) -> f64 {
        let terms: Vec<f64> = (0..self.components())
            .map(|k| self.log_weights[k] + log_normal(x, self.means[[k, f]], self.vars[[k, f]]))
            .collect();
        log_sum_exp(&terms)
    }
}

/// Per-pair source-prior state
#[derive(Debug, Clone)]
pub struct SourcePriorCue {
    /// Component tables in current source order
    tables: Vec<ComponentTables>,
    /// Channel response offset per (source, frequency) in dB
    offset: Array2<f64>,
    /// Component posterior per source, shape (T, K)
    gamma: Vec<Array2<f64>>,
    /// Broad Gaussian scoring the garbage source
    garbage: Option<(f64, f64)>,
    /// Model order already matched to the binaural sources
    aligned: bool,
}

impl SourcePriorCue {
    /// Create state for one pair; `models` must already be validated
    pub fn new(models: &[SourcePriorModel], obs: &PairObservation, garbage: bool) -> Self {
        let tables: Vec<ComponentTables> = models.iter().map(ComponentTables::from_model).collect();
        let frames = obs.frames();
        let gamma = tables
            .iter()
            .map(|table| {
                let weights: Vec<f64> = table.log_weights.iter().map(|w| w.exp()).collect();
                Array2::from_shape_fn((frames, table.components()), |(_, k)| weights[k])
            })
            .collect();
        let garbage = garbage.then(|| {
            let mean = obs.log_power.mean().unwrap_or(0.0);
            let var = obs.log_power.mapv(|x| (x - mean) * (x - mean)).mean().unwrap_or(1.0);
            (mean, var.max(SP_VAR_FLOOR))
        });
        Self {
            offset: Array2::zeros((tables.len(), obs.bins())),
            tables,
            gamma,
            garbage,
            aligned: false,
        }
    }

    /// Whether the model order was matched to the binaural sources
    pub fn is_aligned(&self) -> bool {
        self.aligned
    }

    /// Channel response offsets
    pub fn offset(&self) -> &Array2<f64> {
        &self.offset
    }

    /// Match models to sources once, using a binaural (IPD x ILD) mask
    ///
    /// Returns the chosen permutation: source `i` takes model `perm[i]`.
    pub fn align_to_mask(&mut self, obs: &PairObservation, mask: ArrayView3<'_, f64>) -> Vec<usize> {
        let sources = self.tables.len();
        let (bins, frames) = (obs.bins(), obs.frames());

        // cost[i][j]: negative expected log-likelihood of model j under source i's mask
        let mut cost = Array2::<f64>::zeros((sources, sources));
        for (j, table) in self.tables.iter().enumerate() {
            for f in 0..bins {
                for t in 0..frames {
                    let ll = table.marginal(obs.log_power[[f, t]], f);
                    for i in 0..sources {
                        cost[[i, j]] -= mask[[f, t, i]] * ll;
                    }
                }
            }
        }

        let perm = best_assignment(&cost);
        self.permute_sources(&perm);
        self.aligned = true;
        perm
    }
}

impl CueModel for SourcePriorCue {
    fn kind(&self) -> CueKind {
        CueKind::SourcePrior
    }

    fn log_likelihood(&self, obs: &PairObservation, _tau: &TauGrid) -> Array3<f64> {
        let (bins, frames) = (obs.bins(), obs.frames());
        let sources = self.tables.len();
        let rows = sources + usize::from(self.garbage.is_some());
        let mut out = Array3::zeros((bins, frames, rows));

        for (i, table) in self.tables.iter().enumerate() {
            let gamma = &self.gamma[i];
            for f in 0..bins {
                for t in 0..frames {
                    let x = obs.log_power[[f, t]] - self.offset[[i, f]];
                    out[[f, t, i]] = (0..table.components())
                        .map(|k| gamma[[t, k]] * log_normal(x, table.means[[k, f]], table.vars[[k, f]]))
                        .sum();
                }
            }
        }
        if let Some((mean, var)) = self.garbage {
            for f in 0..bins {
                for t in 0..frames {
                    out[[f, t, sources]] = log_normal(obs.log_power[[f, t]], mean, var);
                }
            }
        }
        out
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

        for (i, table) in self.tables.iter().enumerate() {
            let k_count = table.components();

            // Component posteriors from mask-weighted frame likelihoods
            let mut scores = vec![0.0; k_count];
            for t in 0..frames {
                for (k, score) in scores.iter_mut().enumerate() {
                    *score = table.log_weights[k]
                        + (0..bins)
                            .map(|f| {
                                let x = obs.log_power[[f, t]] - self.offset[[i, f]];
                                weights[[f, t, i]] * log_normal(x, table.means[[k, f]], table.vars[[k, f]])
                            })
                            .sum::<f64>();
                }
                let norm = log_sum_exp(&scores);
                if norm.is_finite() {
                    for k in 0..k_count {
                        self.gamma[i][[t, k]] = (scores[k] - norm).exp();
                    }
                }
            }

            // Channel response by weighted least squares
            let mut num = vec![0.0; bins];
            let mut den = vec![0.0; bins];
            for f in 0..bins {
                for t in 0..frames {
                    let w = weights[[f, t, i]];
                    if w <= 0.0 {
                        continue;
                    }
                    for k in 0..k_count {
                        let g = w * self.gamma[i][[t, k]] / table.vars[[k, f]];
                        num[f] += g * (obs.log_power[[f, t]] - table.means[[k, f]]);
                        den[f] += g;
                    }
                }
            }
            match modes.sp {
                CueMode::Disabled => {}
                CueMode::FrequencyIndependent => {
                    let total_den: f64 = den.iter().sum();
                    if total_den > 0.0 {
                        let h = num.iter().sum::<f64>() / total_den;
                        self.offset.row_mut(i).fill(h);
                    }
                }
                CueMode::FrequencyDependent => {
                    for f in 0..bins {
                        if den[f] > 0.0 {
                            self.offset[[i, f]] = num[f] / den[f];
                        }
                    }
                    if let Some(basis) = basis {
                        basis.project(self.offset.row_mut(i));
                    }
                }
            }
        }
    }

    fn permute_sources(&mut self, perm: &[usize]) {
        let tables = self.tables.clone();
        let gamma = self.gamma.clone();
        let offset = self.offset.clone();
        for (new, &old) in perm.iter().enumerate() {
            self.tables[new] = tables[old].clone();
            self.gamma[new] = gamma[old].clone();
            self.offset.row_mut(new).assign(&offset.row(old));
        }
    }
}
