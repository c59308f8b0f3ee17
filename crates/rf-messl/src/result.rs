//! Separation output

use ndarray::{Array2, Array3, Array4, Axis};

use crate::cues::{IldModel, IpdModel};
use crate::error::SeparationWarning;
use crate::mixture::TauGrid;
use crate::pairs::ChannelPair;

/// Binary time-frequency masks
#[derive(Debug, Clone)]
pub struct HardMasks {
    /// One-hot indicators, shape (F, T, C, I); identical for every channel
    pub masks: Array4<f64>,
    /// Decoded label per bin; the garbage label is `I` when enabled
    pub labels: Array2<usize>,
}

impl HardMasks {
    /// Expand a label map over `channels` channels and `sources` genuine sources
    ///
    /// Bins labelled as garbage are zero in every source plane.
    pub fn from_labels(labels: Array2<usize>, channels: usize, sources: usize) -> Self {
        let (bins, frames) = labels.dim();
        let mut masks = Array4::zeros((bins, frames, channels, sources));
        for ((f, t), &label) in labels.indexed_iter() {
            if label < sources {
                for c in 0..channels {
                    masks[[f, t, c, label]] = 1.0;
                }
            }
        }
        Self { masks, labels }
    }

    /// Number of genuine source planes
    pub fn sources(&self) -> usize {
        self.masks.len_of(Axis(3))
    }

    /// Mask of one source on one channel, shape (F, T)
    pub fn source(&self, channel: usize, source: usize) -> Array2<f64> {
        self.masks
            .index_axis(Axis(3), source)
            .index_axis(Axis(2), channel)
            .to_owned()
    }

    /// Fraction of bins assigned to each genuine source
    pub fn coverage(&self) -> Vec<f64> {
        let total = self.labels.len().max(1) as f64;
        (0..self.sources())
            .map(|i| self.labels.iter().filter(|&&l| l == i).count() as f64 / total)
            .collect()
    }
}

/// Final state of one channel pair
#[derive(Debug, Clone)]
pub struct PairReport {
    /// Channel pair
    pub pair: ChannelPair,
    /// Whether the pair contributed evidence
    pub enabled: bool,
    /// Log-likelihood per repetition
    pub log_likelihood: Vec<f64>,
    /// Phase-difference parameters
    pub ipd: IpdModel,
    /// Level-difference parameters
    pub ild: IldModel,
    /// Source-prior channel response offsets, shape (I, F)
    pub sp_offset: Option<Array2<f64>>,
    /// P(tau | source), garbage row last
    pub delay_posterior: Array2<f64>,
    /// Combined posterior of the final repetition, shape (F, T, I')
    pub posterior: Array3<f64>,
}

/// Result of a multichannel separation
#[derive(Debug, Clone)]
pub struct SeparationResult {
    /// Consensus soft posterior, shape (F, T, I')
    pub posterior: Array3<f64>,
    /// Binary masks from MRF decoding
    pub hard_masks: HardMasks,
    /// Per-pair parameters and histories
    pub pairs: Vec<PairReport>,
    /// Source delay at each microphone relative to mic 0, shape (I, C), samples
    pub tdoa: Array2<f64>,
    /// Shared tau grid
    pub tau: TauGrid,
    /// Number of genuine sources
    pub sources: usize,
    /// Whether a garbage source was modelled
    pub garbage_source: bool,
    /// Sample rate used for the delay conversion
    pub sample_rate: u32,
    /// Repetitions executed
    pub repetitions_run: usize,
    /// Non-fatal problems met during the run
    pub warnings: Vec<SeparationWarning>,
}

impl SeparationResult {
    /// Posterior replicated for the two channels of a stereo pair, shape (2, F, T, I')
    pub fn stereo_soft_mask(&self) -> Array4<f64> {
        let (bins, frames, sources) = self.posterior.dim();
        let mut out = Array4::zeros((2, bins, frames, sources));
        for mut channel in out.outer_iter_mut() {
            channel.assign(&self.posterior);
        }
        out
    }

    /// Per-microphone delays in seconds
    pub fn tdoa_seconds(&self) -> Array2<f64> {
        let rate = f64::from(self.sample_rate);
        self.tdoa.mapv(|d| d / rate)
    }

    /// Channel pairs in processing order
    pub fn channel_pairs(&self) -> Vec<ChannelPair> {
        self.pairs.iter().map(|p| p.pair).collect()
    }

    /// Summed pair log-likelihood per repetition
    pub fn total_log_likelihood(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.repetitions_run];
        for report in &self.pairs {
            for (total, ll) in totals.iter_mut().zip(&report.log_likelihood) {
                *total += ll;
            }
        }
        totals
    }
}
