//! Posterior normalisation
//!
//! Sums the enabled cues' log-likelihoods with an optional log prior and
//! normalises over the source axis. The source axis of every posterior
//! produced here sums to one per bin.

use ndarray::{Array3, Axis, Zip};

/// Log-likelihoods of the cues enabled for one repetition
#[derive(Debug, Clone, Default)]
pub struct CueLogLikelihoods {
    /// Phase-difference cue
    pub ipd: Option<Array3<f64>>,
    /// Level-difference cue
    pub ild: Option<Array3<f64>>,
    /// Source-prior cue
    pub sp: Option<Array3<f64>>,
}

impl CueLogLikelihoods {
    /// Enabled cues
    pub fn iter(&self) -> impl Iterator<Item = &Array3<f64>> {
        [&self.ipd, &self.ild, &self.sp].into_iter().flatten()
    }
}

/// Normalised posterior with per-cue responsibilities
#[derive(Debug, Clone)]
pub struct Posterior {
    /// P(source | observation), shape (F, T, I')
    pub post: Array3<f64>,
    /// Log of `post`
    pub log_post: Array3<f64>,
    /// Sum over bins of the log normaliser
    pub log_likelihood: f64,
    /// Responsibilities from the phase cue alone
    pub ipd: Option<Array3<f64>>,
    /// Responsibilities from the level cue alone
    pub ild: Option<Array3<f64>>,
    /// Responsibilities from the source-prior cue alone
    pub sp: Option<Array3<f64>>,
}

/// Combines cue log-likelihoods and priors into posteriors
#[derive(Debug, Clone, Copy, Default)]
pub struct PosteriorCombiner;

impl PosteriorCombiner {
    /// Combine cues and an optional log prior
    ///
    /// `shape` is used when no cue is enabled, giving a flat posterior.
    pub fn combine(
        &self,
        cues: &CueLogLikelihoods,
        prior: Option<&Array3<f64>>,
        shape: (usize, usize, usize),
    ) -> Posterior {
        let mut total = Array3::<f64>::zeros(shape);
        for ll in cues.iter() {
            total += ll;
        }
        if let Some(prior) = prior {
            total += prior;
        }

        let (post, log_post, log_likelihood) = Self::normalize(&total);
        let responsibilities = |ll: &Option<Array3<f64>>| ll.as_ref().map(|l| Self::normalize(l).0);

        Posterior {
            post,
            log_post,
            log_likelihood,
            ipd: responsibilities(&cues.ipd),
            ild: responsibilities(&cues.ild),
            sp: responsibilities(&cues.sp),
        }
    }

    /// Normalise log scores over the last axis
    ///
    /// Returns (posterior, log posterior, summed log normaliser). NaN scores
    /// count as impossible; bins with no finite score become uniform and add
    /// nothing to the log-likelihood.
    pub fn normalize(scores: &Array3<f64>) -> (Array3<f64>, Array3<f64>, f64) {
        let sources = scores.dim().2;
        let uniform = -(sources as f64).ln();
        let mut log_post = scores.mapv(|v| if v.is_nan() { f64::NEG_INFINITY } else { v });
        let mut log_likelihood = 0.0;

        for mut lane in log_post.lanes_mut(Axis(2)) {
            let max = lane.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if !max.is_finite() {
                lane.fill(uniform);
                continue;
            }
            let lse = max + lane.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
            lane.mapv_inplace(|v| v - lse);
            log_likelihood += lse;
        }

        let post = log_post.mapv(f64::exp);
        (post, log_post, log_likelihood)
    }

    /// Log of a probability tensor with a floor against log(0)
    pub fn log_floor(probabilities: &Array3<f64>) -> Array3<f64> {
        probabilities.mapv(|p| p.max(1e-300).ln())
    }

    /// Posterior with every plane weighted by per-bin reliability
    pub fn weighted(post: &Array3<f64>, reliability: Option<&ndarray::Array2<f64>>) -> Array3<f64> {
        let mut weights = post.clone();
        if let Some(rel) = reliability {
            for mut plane in weights.axis_iter_mut(Axis(2)) {
                Zip::from(&mut plane).and(rel).for_each(|w, &r| *w *= r);
            }
        }
        weights
    }
}

/// Largest deviation from one of the per-bin source sums
pub fn max_normalization_error(post: &Array3<f64>) -> f64 {
    post.sum_axis(Axis(2))
        .iter()
        .map(|s| (s - 1.0).abs())
        .fold(0.0, f64::max)
}
