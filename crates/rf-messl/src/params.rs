//! Per-pair mutable parameters

use ndarray::{Array2, Array3};

use crate::config::RepetitionModes;
use crate::cues::{CueModel, DctBasis, IldModel, IpdModel, SourcePriorCue};
use crate::mixture::{PairObservation, TauGrid};
use crate::pairs::ChannelPair;
use crate::posterior::CueLogLikelihoods;

/// Pairs whose quieter channel never rises above this power (dB) carry no cue
const SILENT_CHANNEL_DB: f64 = -200.0;

/// Cue parameters of one channel pair, mutated in place by the M-step
#[derive(Debug, Clone)]
pub struct PairParams {
    /// Channel pair these parameters describe
    pub pair: ChannelPair,
    /// Whether the pair contributes evidence
    pub enabled: bool,
    /// Phase-difference model
    pub ipd: IpdModel,
    /// Level-difference model
    pub ild: IldModel,
    /// Source-prior state (present only when models were supplied)
    pub sp: Option<SourcePriorCue>,
}

impl PairParams {
    /// Assemble parameters; the pair is disabled when it observes silence
    pub fn new(obs: &PairObservation, ipd: IpdModel, ild: IldModel, sp: Option<SourcePriorCue>) -> Self {
        Self {
            pair: obs.pair,
            enabled: !is_silent(obs),
            ipd,
            ild,
            sp,
        }
    }

    /// Log-likelihoods of the cues enabled in `modes`
    ///
    /// The source prior only scores once its models were aligned.
    pub fn log_likelihoods(&self, obs: &PairObservation, tau: &TauGrid, modes: &RepetitionModes) -> CueLogLikelihoods {
        CueLogLikelihoods {
            ipd: modes.ipd.then(|| self.ipd.log_likelihood(obs, tau)),
            ild: modes.ild.is_enabled().then(|| self.ild.log_likelihood(obs, tau)),
            sp: match &self.sp {
                Some(sp) if modes.sp.is_enabled() && sp.is_aligned() => Some(sp.log_likelihood(obs, tau)),
                _ => None,
            },
        }
    }

    /// M-step for every enabled cue
    pub fn update(
        &mut self,
        obs: &PairObservation,
        tau: &TauGrid,
        weights: &Array3<f64>,
        modes: &RepetitionModes,
        basis: Option<&DctBasis>,
    ) {
        if !self.enabled {
            return;
        }
        for cue in self.enabled_cues_mut(modes) {
            cue.update(obs, tau, weights.view(), modes, basis);
        }
    }

    /// P(tau | source), garbage row last
    pub fn delay_posterior(&self) -> Array2<f64> {
        self.ipd.delay_posterior()
    }

    fn enabled_cues_mut(&mut self, modes: &RepetitionModes) -> Vec<&mut dyn CueModel> {
        let mut cues: Vec<&mut dyn CueModel> = Vec::with_capacity(3);
        if modes.ipd {
            cues.push(&mut self.ipd);
        }
        if modes.ild.is_enabled() {
            cues.push(&mut self.ild);
        }
        if let Some(sp) = self.sp.as_mut() {
            if modes.sp.is_enabled() && sp.is_aligned() {
                cues.push(sp);
            }
        }
        cues
    }
}

/// Whether either channel stays below the silence threshold in every bin
fn is_silent(obs: &PairObservation) -> bool {
    // Mean power and level ratio give each channel's power back:
    // P_a = 2 P_mean / (1 + 10^(-ild/10)), P_b likewise with ild negated
    let loudest = |sign: f64| {
        obs.log_power
            .iter()
            .zip(obs.ild.iter())
            .map(|(p, l)| p + 10.0 * 2.0f64.log10() - 10.0 * (1.0 + 10f64.powf(-sign * l / 10.0)).log10())
            .fold(f64::NEG_INFINITY, f64::max)
    };
    loudest(1.0).min(loudest(-1.0)) < SILENT_CHANNEL_DB
}
