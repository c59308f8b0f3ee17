//! ReelForge Multichannel Spatial Separation
//!
//! MESSL-style expectation-maximization over every microphone pair of a
//! multichannel STFT mixture:
//!
//! ## Spatial Cues
//! - Interaural phase difference over a shared tau grid
//! - Interaural level difference
//! - Optional pretrained source-prior GMMs
//!
//! ## Multichannel Consistency
//! - Reference-mic or all-pairs selection
//! - Cross-pair label alignment
//! - Two-phase EM with a consensus prior from the other pairs
//! - Least-squares TDOA per microphone
//!
//! ## Decoding
//! - Soft posterior per source
//! - Hard masks through loopy belief propagation on the TF grid
//!
//! ## Example
//!
//! ```rust,ignore
//! use rf_messl::{Messl, MesslConfig, Mixture, TauGrid};
//!
//! let mixture = Mixture::new(spectra)?;
//! let tau = TauGrid::symmetric(16.0, 0.5)?;
//! let result = Messl::new(MesslConfig::default()).run(&mixture, &tau, 2)?;
//! let vocals = result.hard_masks.source(0, 0);
//! ```

#![warn(missing_docs)]

pub mod align;
pub mod assignment;
pub mod cues;
pub mod engine;
pub mod init;
pub mod mrf;
pub mod observer;
pub mod posterior;
pub mod tdoa;

mod config;
mod error;
mod mixture;
mod pairs;
mod params;
mod priors;
mod result;

pub use config::{
    BasisCompression, CueMode, IldInit, MesslConfig, ModeSchedule, RepetitionModes, ResolvedModes,
};
pub use error::{CueKind, MesslError, MesslResult, SeparationWarning};
pub use mixture::{bin_frequencies, wrap_phase, Mixture, PairObservation, TauGrid};
pub use pairs::{select_pairs, ChannelPair, PairSelection};
pub use params::PairParams;
pub use priors::Priors;
pub use result::{HardMasks, PairReport, SeparationResult};

use ndarray::{Array2, Array3};
use rayon::prelude::*;

use crate::align::SourcePermutationAligner;
use crate::cues::SourcePriorModel;
use crate::engine::{consensus_posterior, PairEmEngine, PairState};
use crate::init::{PairInitializer, PairSeed};
use crate::mrf::{CompatibilityLoader, JsonCompatibilityFile, MrfAssigner, NeutralCompatibility};
use crate::observer::{LogObserver, RepetitionObserver};
use crate::posterior::PosteriorCombiner;
use crate::priors::PriorShape;

/// Multichannel separator
pub struct Messl {
    config: MesslConfig,
    priors: Priors,
    compatibility: Option<Array2<f64>>,
    observer: Option<Box<dyn RepetitionObserver>>,
}

impl Messl {
    /// Create separator
    pub fn new(config: MesslConfig) -> Self {
        Self {
            config,
            priors: Priors::default(),
            compatibility: None,
            observer: None,
        }
    }

    /// Attach priors and seeds
    pub fn with_priors(mut self, priors: Priors) -> Self {
        self.priors = priors;
        self
    }

    /// Use an MRF compatibility table (defaults to neutral)
    pub fn with_compatibility(mut self, table: Array2<f64>) -> Self {
        self.compatibility = Some(table);
        self
    }

    /// Load the MRF compatibility table through `loader`
    pub fn with_compatibility_loader(self, loader: &dyn CompatibilityLoader) -> MesslResult<Self> {
        Ok(self.with_compatibility(loader.load()?))
    }

    /// Observer invoked after each repetition when `visualize` is set
    pub fn with_observer(mut self, observer: Box<dyn RepetitionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Separate `sources` sources from `mixture`
    pub fn run(&mut self, mixture: &Mixture, tau: &TauGrid, sources: usize) -> MesslResult<SeparationResult> {
        let config = &self.config;
        let priors = &self.priors;

        // Validation: nothing below runs on bad input
        config.validate()?;
        if sources == 0 {
            return Err(MesslError::InvalidSourceCount(sources));
        }
        let selection = select_pairs(mixture.channels(), config.reference_mic)?;
        let labels = sources + usize::from(config.garbage_source);
        let (bins, frames, channels) = (mixture.bins(), mixture.frames(), mixture.channels());
        priors.validate(&PriorShape {
            bins,
            frames,
            channels,
            pairs: selection.len(),
            sources,
            labels,
            taus: tau.len(),
            mask_hold: config.mask_hold,
        })?;
        let table = match &self.compatibility {
            Some(table) => table.clone(),
            None => NeutralCompatibility { labels }.load()?,
        };
        let mrf = MrfAssigner::new(&table, labels, config.final_compat_exponent(), config.mrf_iterations)?;

        let mut warnings = Vec::new();
        let sp_requested = config.sp_mode.first_enabled(config.repetitions).is_some();
        let source_models: Option<&[SourcePriorModel]> = priors.source_models.as_deref();
        if sp_requested && source_models.is_none() {
            let warning = SeparationWarning::SourcePriorUnavailable;
            log::warn!("{warning}");
            warnings.push(warning);
        }

        log::info!(
            "MESSL: {channels} channels, {} pairs, {sources} sources{}, {} repetitions, rescale {:.3}",
            selection.len(),
            if config.garbage_source { " + garbage" } else { "" },
            config.repetitions,
            selection.overcount_rescale
        );

        let omega = bin_frequencies(bins, config.window_size);
        let observations: Vec<PairObservation> = selection
            .pairs
            .par_iter()
            .map(|&pair| PairObservation::new(mixture, pair, &omega))
            .collect();

        // Seeds
        let init = PairInitializer::new(config, tau, sources);
        let mut delay_rows = seed_delays(&init, priors, &selection, &observations, sources, labels)?;

        if config.consistent_tdoa && selection.len() > channels {
            let estimate = tdoa::estimate(channels, &selection.pairs, &delay_rows, sources, tau)?;
            let deltas = estimate.consistent_pair_deltas(&selection.pairs);
            log::debug!("Consistent TDOA seed: {:?}", estimate.per_mic);
            delay_rows = deltas
                .rows()
                .into_iter()
                .map(|row| init.from_delays(&row.to_vec()).delay_rows)
                .collect();
        }

        let mut states = observations
            .into_iter()
            .zip(&delay_rows)
            .enumerate()
            .map(|(index, (obs, rows))| {
                let params = init.params(&obs, rows, source_models)?;
                Ok(PairState::new(index, obs, params))
            })
            .collect::<MesslResult<Vec<_>>>()?;
        for state in states.iter().filter(|s| !s.params.enabled) {
            let warning = SeparationWarning::SilentPair {
                pair: state.index,
                first: state.params.pair.first,
                second: state.params.pair.second,
            };
            log::warn!("{warning}");
            warnings.push(warning);
        }

        // EM
        let engine = PairEmEngine::new(
            tau.clone(),
            ResolvedModes::resolve(config, source_models.is_some()),
            selection.overcount_rescale,
            bins,
        )
        .with_mask_prior(priors.mask_prior.as_ref(), config.mask_hold)
        .with_reliability(priors.reliability.clone())
        .with_early_stop(config.early_stop_tolerance);

        let mut fallback = LogObserver;
        let observer: Option<&mut dyn RepetitionObserver> = if config.visualize {
            match self.observer.as_mut() {
                Some(observer) => Some(observer.as_mut() as &mut dyn RepetitionObserver),
                None => Some(&mut fallback as &mut dyn RepetitionObserver),
            }
        } else {
            None
        };
        let outcome = engine.run(&mut states, observer);
        warnings.extend(outcome.warnings);

        // Delays
        let delay_posteriors: Vec<Array2<f64>> = states.iter().map(|s| s.params.delay_posterior()).collect();
        let tdoa = tdoa::estimate(channels, &selection.pairs, &delay_posteriors, sources, tau)?;

        // Decoding
        let consensus = consensus_posterior(&states)
            .ok_or_else(|| MesslError::InvalidMixture("no channel pairs to decode".into()))?;
        let unary = mrf_unary(&consensus.log_post, &states);
        let hard_masks = HardMasks::from_labels(mrf.decode(&unary), channels, sources);
        log::info!(
            "MESSL finished after {} repetitions; coverage {:?}",
            outcome.repetitions_run,
            hard_masks.coverage()
        );

        let pairs = states
            .into_iter()
            .zip(delay_posteriors)
            .map(|(state, delay_posterior)| PairReport {
                pair: state.params.pair,
                enabled: state.params.enabled,
                posterior: state
                    .posterior
                    .map(|p| p.post)
                    .unwrap_or_else(|| Array3::from_elem(consensus.post.dim(), 1.0 / labels as f64)),
                log_likelihood: state.log_likelihood,
                sp_offset: state.params.sp.as_ref().map(|sp| sp.offset().clone()),
                ipd: state.params.ipd,
                ild: state.params.ild,
                delay_posterior,
            })
            .collect();

        Ok(SeparationResult {
            posterior: consensus.post,
            hard_masks,
            pairs,
            tdoa: tdoa.per_mic,
            tau: tau.clone(),
            sources,
            garbage_source: config.garbage_source,
            sample_rate: config.sample_rate,
            repetitions_run: outcome.repetitions_run,
            warnings,
        })
    }
}

/// Separate with the compatibility table named in `config`, if any
pub fn separate(
    mixture: &Mixture,
    tau: &TauGrid,
    sources: usize,
    config: MesslConfig,
    priors: Priors,
) -> MesslResult<SeparationResult> {
    let path = config.mrf_compat_path.clone();
    let mut messl = Messl::new(config).with_priors(priors);
    if let Some(path) = path {
        messl = messl.with_compatibility_loader(&JsonCompatibilityFile::new(path))?;
    }
    messl.run(mixture, tau, sources)
}

/// Initial P(tau | source) rows for every pair
///
/// Bootstrapped pairs label their sources independently and are aligned
/// afterwards; the other seeds share labels by construction.
fn seed_delays(
    init: &PairInitializer<'_>,
    priors: &Priors,
    selection: &PairSelection,
    observations: &[PairObservation],
    sources: usize,
    labels: usize,
) -> MesslResult<Vec<Array2<f64>>> {
    if let Some(tables) = &priors.delay_tables {
        return Ok(tables.iter().map(|t| init.from_table(t).delay_rows).collect());
    }
    if let Some(delays) = &priors.source_delays {
        return Ok(selection
            .pairs
            .iter()
            .map(|pair| {
                let deltas: Vec<f64> = (0..sources)
                    .map(|i| delays[[i, pair.second]] - delays[[i, pair.first]])
                    .collect();
                init.from_delays(&deltas).delay_rows
            })
            .collect());
    }
    if priors.mask_prior.is_some() {
        return Ok(vec![init.uniform().delay_rows; selection.len()]);
    }

    let seeds: Vec<PairSeed> = observations
        .par_iter()
        .map(|obs| init.bootstrap(obs))
        .collect::<MesslResult<_>>()?;
    let (masks, rows): (Vec<Array3<f64>>, Vec<Array2<f64>>) = seeds
        .into_iter()
        .zip(observations)
        .map(|(seed, obs)| {
            let mask = seed
                .mask
                .unwrap_or_else(|| Array3::from_elem((obs.bins(), obs.frames(), labels), 1.0 / labels as f64));
            (mask, seed.delay_rows)
        })
        .unzip();

    let aligned = SourcePermutationAligner::new(sources).align(masks, rows);
    Ok(aligned.delay_posteriors)
}

/// Log unary scores for decoding: consensus plus pair-averaged cue responsibilities
fn mrf_unary(consensus_log: &Array3<f64>, states: &[PairState]) -> Array3<f64> {
    let mut unary = consensus_log.clone();
    let enabled: Vec<&PairState> = states.iter().filter(|s| s.params.enabled).collect();
    if enabled.is_empty() {
        return unary;
    }
    let weight = 1.0 / enabled.len() as f64;
    for state in enabled {
        let Some(local) = &state.local else { continue };
        for responsibilities in [&local.ipd, &local.ild].into_iter().flatten() {
            unary.scaled_add(weight, &PosteriorCombiner::log_floor(responsibilities));
        }
    }
    unary
}
