//! Two-phase EM over channel pairs
//!
//! Every repetition runs in two phases separated by a barrier:
//!
//! 1. **Local**: each pair scores its cues and normalises them (plus any
//!    held mask prior) into a local posterior, published to its slot of the
//!    [`GlobalLogPosterior`]. Parameters are not touched.
//! 2. **Consistency**: each pair adds the other pairs' local log-posteriors
//!    (scaled by the overcount rescale) to its prior, recomputes its
//!    posterior, records the log-likelihood and runs the M-step.
//!
//! Pairs are independent within a phase and run on the rayon pool.

use ndarray::{Array2, Array3};
use rayon::prelude::*;

use crate::config::{BasisCompression, RepetitionModes, ResolvedModes};
use crate::cues::{CueModel, DctBasis};
use crate::error::{CueKind, SeparationWarning};
use crate::mixture::{PairObservation, TauGrid};
use crate::observer::{RepetitionObserver, RepetitionSnapshot};
use crate::params::PairParams;
use crate::posterior::{CueLogLikelihoods, Posterior, PosteriorCombiner};

/// State the engine threads through the loop for one pair
#[derive(Debug, Clone)]
pub struct PairState {
    /// Pair index (position in the selection)
    pub index: usize,
    /// Interaural features
    pub obs: PairObservation,
    /// Cue parameters
    pub params: PairParams,
    /// Log-likelihood recorded in each repetition's consistency phase
    pub log_likelihood: Vec<f64>,
    /// Cue log-likelihoods of the current repetition
    pub cues: CueLogLikelihoods,
    /// Local posterior (no consistency prior)
    pub local: Option<Posterior>,
    /// Posterior with the consistency prior
    pub posterior: Option<Posterior>,
}

impl PairState {
    /// Fresh state before the first repetition
    pub fn new(index: usize, obs: PairObservation, params: PairParams) -> Self {
        Self {
            index,
            obs,
            params,
            log_likelihood: Vec::new(),
            cues: CueLogLikelihoods::default(),
            local: None,
            posterior: None,
        }
    }

    /// Posterior shape (F, T, I')
    pub fn shape(&self) -> (usize, usize, usize) {
        (
            self.obs.bins(),
            self.obs.frames(),
            self.params.ipd.joint_weights().nrows(),
        )
    }
}

/// Latest local log-posterior of every pair
///
/// Each slot has a single writer (its pair) and is only read after the
/// local phase has finished for all pairs.
#[derive(Debug, Clone)]
pub struct GlobalLogPosterior {
    slots: Vec<Option<Array3<f64>>>,
}

impl GlobalLogPosterior {
    /// Empty accumulator for `pairs` pairs
    pub fn new(pairs: usize) -> Self {
        Self {
            slots: vec![None; pairs],
        }
    }

    /// Publish a pair's log-posterior (`None` for disabled pairs)
    pub fn set(&mut self, pair: usize, log_post: Option<Array3<f64>>) {
        self.slots[pair] = log_post;
    }

    /// Sum of every other pair's log-posterior, in slot order
    pub fn sum_excluding(&self, pair: usize) -> Option<Array3<f64>> {
        let mut total: Option<Array3<f64>> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if index == pair {
                continue;
            }
            if let Some(log_post) = slot {
                match total.as_mut() {
                    Some(sum) => *sum += log_post,
                    None => total = Some(log_post.clone()),
                }
            }
        }
        total
    }
}

/// Outcome of an engine run
#[derive(Debug, Clone, Default)]
pub struct EngineOutcome {
    /// Repetitions actually executed
    pub repetitions_run: usize,
    /// Warnings raised while running
    pub warnings: Vec<SeparationWarning>,
}

/// Repeated local/consistency EM over a set of pairs
#[derive(Debug, Clone)]
pub struct PairEmEngine {
    tau: TauGrid,
    modes: ResolvedModes,
    overcount_rescale: f64,
    /// Log mask prior, shape (F, T, I')
    mask_prior: Option<Array3<f64>>,
    mask_hold: usize,
    /// Per-bin weights applied to the M-step, shape (F, T)
    reliability: Option<Array2<f64>>,
    basis: Option<DctBasis>,
    early_stop: Option<f64>,
    combiner: PosteriorCombiner,
}

impl PairEmEngine {
    /// Create engine for `bins` frequency bins
    pub fn new(tau: TauGrid, modes: ResolvedModes, overcount_rescale: f64, bins: usize) -> Self {
        let basis = match modes.basis() {
            BasisCompression::Off => None,
            BasisCompression::Dct { coefficients } => Some(DctBasis::new(bins, coefficients)),
        };
        Self {
            tau,
            modes,
            overcount_rescale,
            mask_prior: None,
            mask_hold: 0,
            reliability: None,
            basis,
            early_stop: None,
            combiner: PosteriorCombiner,
        }
    }

    /// Hold a mask prior (probabilities) for the first `hold` repetitions
    pub fn with_mask_prior(mut self, mask_prior: Option<&Array3<f64>>, hold: usize) -> Self {
        self.mask_prior = mask_prior.map(PosteriorCombiner::log_floor);
        self.mask_hold = hold;
        self
    }

    /// Weight every bin's M-step contribution
    pub fn with_reliability(mut self, reliability: Option<Array2<f64>>) -> Self {
        self.reliability = reliability;
        self
    }

    /// Stop once the relative log-likelihood change drops below `tolerance`
    pub fn with_early_stop(mut self, tolerance: Option<f64>) -> Self {
        self.early_stop = tolerance;
        self
    }

    /// Run every scheduled repetition over `states`
    pub fn run(
        &self,
        states: &mut [PairState],
        mut observer: Option<&mut dyn RepetitionObserver>,
    ) -> EngineOutcome {
        let repetitions = self.modes.len();
        let mut global = GlobalLogPosterior::new(states.len());
        let mut outcome = EngineOutcome::default();
        let mut previous: Option<f64> = None;

        for rep in 0..repetitions {
            // Local phase; collecting is the barrier
            let warnings: Vec<Vec<SeparationWarning>> =
                states.par_iter_mut().map(|state| self.local_step(state, rep)).collect();
            for warning in warnings.into_iter().flatten() {
                log::warn!("{warning}");
                outcome.warnings.push(warning);
            }
            for (slot, state) in states.iter().enumerate() {
                let log_post = state
                    .local
                    .as_ref()
                    .filter(|_| state.params.enabled)
                    .map(|p| p.log_post.clone());
                global.set(slot, log_post);
            }

            // Consistency phase
            let priors: Vec<Option<Array3<f64>>> = (0..states.len()).map(|slot| global.sum_excluding(slot)).collect();
            states
                .par_iter_mut()
                .zip(priors)
                .for_each(|(state, others)| self.consistency_step(state, others, rep));

            outcome.repetitions_run = rep + 1;
            let total: f64 = states.iter().filter_map(|s| s.log_likelihood.last()).sum();
            log::debug!("Repetition {}/{repetitions}: log-likelihood {total:.4}", rep + 1);

            if let Some(observer) = observer.as_mut() {
                observer.on_repetition(&RepetitionSnapshot {
                    repetition: rep,
                    repetitions,
                    pairs: &*states,
                    total_log_likelihood: total,
                });
            }

            if let (Some(tolerance), Some(prev)) = (self.early_stop, previous) {
                if (total - prev).abs() <= tolerance * prev.abs().max(f64::MIN_POSITIVE) {
                    log::info!("Log-likelihood plateaued after {} repetitions", rep + 1);
                    break;
                }
            }
            previous = Some(total);
        }

        outcome
    }

    fn mask_prior_at(&self, rep: usize) -> Option<&Array3<f64>> {
        self.mask_prior.as_ref().filter(|_| rep < self.mask_hold)
    }

    fn local_step(&self, state: &mut PairState, rep: usize) -> Vec<SeparationWarning> {
        let modes = self.modes.at(rep);
        if !state.params.enabled {
            state.cues = CueLogLikelihoods::default();
            state.local = None;
            return Vec::new();
        }

        self.activate_source_prior(state, &modes);
        state.cues = state.params.log_likelihoods(&state.obs, &self.tau, &modes);
        let warnings = non_finite_warnings(state.index, rep, &state.cues);
        state.local = Some(
            self.combiner
                .combine(&state.cues, self.mask_prior_at(rep), state.shape()),
        );
        warnings
    }

    fn consistency_step(&self, state: &mut PairState, others: Option<Array3<f64>>, rep: usize) {
        let modes = self.modes.at(rep);
        let mut prior = others.map(|sum| sum * self.overcount_rescale);
        if let Some(mask) = self.mask_prior_at(rep) {
            prior = Some(match prior {
                Some(p) => p + mask,
                None => mask.clone(),
            });
        }

        let posterior = self.combiner.combine(&state.cues, prior.as_ref(), state.shape());
        state.log_likelihood.push(posterior.log_likelihood);

        let weights = PosteriorCombiner::weighted(&posterior.post, self.reliability.as_ref());
        state
            .params
            .update(&state.obs, &self.tau, &weights, &modes, self.basis.as_ref());
        state.posterior = Some(posterior);
    }

    /// Match source-prior models to the binaural labels the first time the cue is on
    fn activate_source_prior(&self, state: &mut PairState, modes: &RepetitionModes) {
        let needs_alignment = matches!(&state.params.sp, Some(sp) if !sp.is_aligned());
        if !modes.sp.is_enabled() || !needs_alignment {
            return;
        }

        let binaural = CueLogLikelihoods {
            ipd: Some(state.params.ipd.log_likelihood(&state.obs, &self.tau)),
            ild: Some(state.params.ild.log_likelihood(&state.obs, &self.tau)),
            sp: None,
        };
        let mask = self.combiner.combine(&binaural, None, state.shape()).post;
        if let Some(sp) = state.params.sp.as_mut() {
            let perm = sp.align_to_mask(&state.obs, mask.view());
            log::info!("Pair {}: source-prior models matched as {perm:?}", state.index);
        }
    }
}

/// Normalised sum of the pairs' latest local log-posteriors
///
/// Disabled pairs are skipped; with no enabled pair the result is flat.
pub fn consensus_posterior(states: &[PairState]) -> Option<Posterior> {
    let shape = states.first()?.shape();
    let mut total = Array3::<f64>::zeros(shape);
    for state in states.iter().filter(|s| s.params.enabled) {
        if let Some(local) = &state.local {
            total += &local.log_post;
        }
    }
    let (post, log_post, log_likelihood) = PosteriorCombiner::normalize(&total);
    Some(Posterior {
        post,
        log_post,
        log_likelihood,
        ipd: None,
        ild: None,
        sp: None,
    })
}

fn non_finite_warnings(pair: usize, repetition: usize, cues: &CueLogLikelihoods) -> Vec<SeparationWarning> {
    [
        (CueKind::Ipd, &cues.ipd),
        (CueKind::Ild, &cues.ild),
        (CueKind::SourcePrior, &cues.sp),
    ]
    .into_iter()
    .filter_map(|(cue, ll)| {
        let count = ll.as_ref()?.iter().filter(|v| !v.is_finite()).count();
        (count > 0).then_some(SeparationWarning::NonFiniteLikelihood {
            pair,
            repetition,
            cue,
            count,
        })
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CueMode, MesslConfig, ModeSchedule};
    use crate::cues::{IldModel, IpdModel};
    use crate::mixture::{bin_frequencies, Mixture};
    use crate::pairs::ChannelPair;
    use crate::posterior::max_normalization_error;
    use num_complex::Complex64;

    /// Two sources at delays +2 and -3 samples, alternating bins
    fn two_source_state() -> (PairState, TauGrid) {
        let bins = 33;
        let frames = 20;
        let omega = bin_frequencies(bins, None);
        let mut spectra = Array3::zeros((bins, frames, 2));
        for f in 0..bins {
            for t in 0..frames {
                let (delay, gain) = if (f / 3 + t) % 2 == 0 { (2.0, 1.0) } else { (-3.0, 0.5) };
                let base = Complex64::from_polar(1.0, 1.3 * (f * 7 + t * 3) as f64);
                spectra[[f, t, 0]] = base;
                spectra[[f, t, 1]] = base * Complex64::from_polar(gain, -omega[f] * delay);
            }
        }
        let mixture = Mixture::new(spectra).unwrap();
        let obs = PairObservation::new(&mixture, ChannelPair::new(0, 1), &omega);
        let tau = TauGrid::symmetric(5.0, 1.0).unwrap();

        let mut rows = Array2::from_elem((2, tau.len()), 0.05);
        rows[[0, tau.nearest_index(1.0)]] = 1.0;
        rows[[1, tau.nearest_index(-2.0)]] = 1.0;
        let params = PairParams::new(
            &obs,
            IpdModel::new(&rows, bins, 1.0, false),
            IldModel::new(&vec![0.0; bins], &vec![10.0; bins], 2, false, 0.0),
            None,
        );
        (PairState::new(0, obs, params), tau)
    }

    fn engine(tau: TauGrid, repetitions: usize, bins: usize) -> PairEmEngine {
        let config = MesslConfig {
            ild_mode: ModeSchedule::constant(CueMode::FrequencyIndependent),
            ..MesslConfig::default().with_repetitions(repetitions)
        };
        PairEmEngine::new(tau, ResolvedModes::resolve(&config, false), 1.0, bins)
    }

    #[test]
    fn test_single_pair_log_likelihood_non_decreasing() {
        let (state, tau) = two_source_state();
        let bins = state.obs.bins();
        let mut states = vec![state];
        let outcome = engine(tau, 10, bins).run(&mut states, None);
        assert_eq!(outcome.repetitions_run, 10);

        let ll = &states[0].log_likelihood;
        assert_eq!(ll.len(), 10);
        for w in ll.windows(2) {
            assert!(w[1] >= w[0] - 1e-6 * w[0].abs(), "log-likelihood dropped: {w:?}");
        }
    }

    #[test]
    fn test_posteriors_sum_to_one() {
        let (state, tau) = two_source_state();
        let bins = state.obs.bins();
        let mut states = vec![state.clone(), PairState { index: 1, ..state }];
        engine(tau, 3, bins).run(&mut states, None);
        for s in &states {
            assert!(max_normalization_error(&s.posterior.as_ref().unwrap().post) < 1e-6);
            assert!(max_normalization_error(&s.local.as_ref().unwrap().post) < 1e-6);
        }
        let consensus = consensus_posterior(&states).unwrap();
        assert!(max_normalization_error(&consensus.post) < 1e-6);
    }

    #[test]
    fn test_sum_excluding_skips_own_slot() {
        let mut global = GlobalLogPosterior::new(3);
        global.set(0, Some(Array3::from_elem((1, 1, 2), 1.0)));
        global.set(1, Some(Array3::from_elem((1, 1, 2), 2.0)));
        global.set(2, None);
        assert_eq!(global.sum_excluding(0).unwrap()[[0, 0, 0]], 2.0);
        assert_eq!(global.sum_excluding(2).unwrap()[[0, 0, 1]], 3.0);
        assert!(GlobalLogPosterior::new(1).sum_excluding(0).is_none());
    }

    #[test]
    fn test_early_stop_cuts_repetitions() {
        let (state, tau) = two_source_state();
        let bins = state.obs.bins();
        let mut states = vec![state];
        let outcome = engine(tau, 50, bins).with_early_stop(Some(1e-3)).run(&mut states, None);
        assert!(outcome.repetitions_run < 50);
        assert_eq!(states[0].log_likelihood.len(), outcome.repetitions_run);
    }

    #[test]
    fn test_mask_prior_dropped_after_hold() {
        let (state, tau) = two_source_state();
        let (bins, frames, labels) = state.shape();
        let prior = Array3::from_shape_fn((bins, frames, labels), |(_, _, i)| if i == 1 { 0.99 } else { 0.01 });
        let log_prior = PosteriorCombiner::log_floor(&prior);
        let source_one = |post: &Array3<f64>| post.index_axis(ndarray::Axis(2), 1).mean().unwrap();

        // Held through the last repetition
        let mut held = vec![state.clone()];
        engine(tau.clone(), 2, bins).with_mask_prior(Some(&prior), 2).run(&mut held, None);
        let expected = PosteriorCombiner.combine(&held[0].cues, Some(&log_prior), held[0].shape());
        let local = held[0].local.as_ref().unwrap();
        assert!((&local.post - &expected.post).iter().all(|d| d.abs() < 1e-12));

        // Released after the first repetition
        let mut released = vec![state];
        engine(tau, 2, bins).with_mask_prior(Some(&prior), 1).run(&mut released, None);
        let expected = PosteriorCombiner.combine(&released[0].cues, None, released[0].shape());
        let free = released[0].local.as_ref().unwrap();
        assert!((&free.post - &expected.post).iter().all(|d| d.abs() < 1e-12));

        assert!(source_one(&local.post) > source_one(&free.post));
    }

    #[test]
    fn test_non_finite_cue_reported() {
        let mut cues = CueLogLikelihoods::default();
        let mut ll = Array3::zeros((2, 2, 2));
        ll[[0, 1, 0]] = f64::NAN;
        cues.ild = Some(ll);
        let warnings = non_finite_warnings(3, 4, &cues);
        assert_eq!(
            warnings,
            vec![SeparationWarning::NonFiniteLikelihood {
                pair: 3,
                repetition: 4,
                cue: CueKind::Ild,
                count: 1,
            }]
        );
    }
}
