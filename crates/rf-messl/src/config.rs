//! Separation configuration
//!
//! Scalar options and cue-mode schedules. Array-valued inputs (mask priors,
//! reliability weights, source models) travel separately in [`crate::Priors`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MesslError, MesslResult};

/// How a cue model is parameterised for one repetition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CueMode {
    /// Cue ignored (or parameter held fixed)
    Disabled,
    /// One parameter shared by all frequency bins
    #[default]
    FrequencyIndependent,
    /// Separate parameter per frequency bin
    FrequencyDependent,
}

impl CueMode {
    /// Whether the cue participates at all
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CueMode::Disabled)
    }
}

/// Per-repetition cue mode; the last entry holds for all later repetitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeSchedule(Vec<CueMode>);

impl ModeSchedule {
    /// Same mode for every repetition
    pub fn constant(mode: CueMode) -> Self {
        Self(vec![mode])
    }

    /// Disabled until `repetition`, then `mode`
    pub fn starting_at(repetition: usize, mode: CueMode) -> Self {
        let mut modes = vec![CueMode::Disabled; repetition];
        modes.push(mode);
        Self(modes)
    }

    /// Explicit per-repetition list
    pub fn from_modes(modes: Vec<CueMode>) -> Self {
        Self(modes)
    }

    /// Mode in effect at `repetition`
    pub fn at(&self, repetition: usize) -> CueMode {
        match self.0.get(repetition) {
            Some(mode) => *mode,
            None => self.0.last().copied().unwrap_or(CueMode::Disabled),
        }
    }

    /// First repetition (below `limit`) where the cue is enabled
    pub fn first_enabled(&self, limit: usize) -> Option<usize> {
        (0..limit).find(|&rep| self.at(rep).is_enabled())
    }
}

impl Default for ModeSchedule {
    fn default() -> Self {
        Self::constant(CueMode::FrequencyIndependent)
    }
}

impl From<CueMode> for ModeSchedule {
    fn from(mode: CueMode) -> Self {
        Self::constant(mode)
    }
}

/// Compression of frequency-dependent parameter vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BasisCompression {
    /// Parameters kept at full resolution
    #[default]
    Off,
    /// Projected onto the first `coefficients` DCT-II basis vectors
    Dct { coefficients: usize },
}

/// Initial value for a level-difference parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IldInit {
    /// Same value at every frequency
    Scalar(f64),
    /// One value per frequency bin
    PerFrequency(Vec<f64>),
}

impl IldInit {
    /// Expand to one value per frequency bin
    pub fn resolve(&self, bins: usize, what: &'static str) -> MesslResult<Vec<f64>> {
        match self {
            IldInit::Scalar(value) => Ok(vec![*value; bins]),
            IldInit::PerFrequency(values) if values.len() == bins => Ok(values.clone()),
            IldInit::PerFrequency(values) => Err(MesslError::ShapeMismatch {
                what,
                expected: format!("{bins} frequency bins"),
                got: format!("{} values", values.len()),
            }),
        }
    }
}

/// Multichannel separation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MesslConfig {
    /// Reference microphone (0-based); `None` pairs every channel combination
    pub reference_mic: Option<usize>,

    /// Number of EM repetitions
    pub repetitions: usize,

    /// Phase-difference cue schedule
    pub ipd_mode: ModeSchedule,

    /// Phase-mean (xi) schedule
    pub ipd_mean_mode: ModeSchedule,

    /// Phase-variance schedule
    pub ipd_var_mode: ModeSchedule,

    /// Level-difference cue schedule
    pub ild_mode: ModeSchedule,

    /// Source-prior cue schedule (channel response granularity)
    pub sp_mode: ModeSchedule,

    /// Basis compression of frequency-dependent parameters
    pub basis: BasisCompression,

    /// Add a catch-all garbage source
    pub garbage_source: bool,

    /// Initial ILD mean (dB)
    pub ild_mean_init: IldInit,

    /// Initial ILD standard deviation (dB)
    pub ild_std_init: IldInit,

    /// Initial IPD variance (rad^2)
    pub ipd_var_init: f64,

    /// Precision of the prior pulling ILD means towards their initial value
    pub ild_prior_precision: f64,

    /// Sample rate (Hz), used to report delays in seconds
    pub sample_rate: u32,

    /// Analysis window size; `None` assumes bins span 0..Nyquist
    pub window_size: Option<usize>,

    /// Repetitions during which the supplied mask prior stays active (positive when one is supplied)
    pub mask_hold: usize,

    /// Reseed pair delays from a least-squares TDOA fit before EM
    pub consistent_tdoa: bool,

    /// Repetitions of the reduced single-pair bootstrap
    pub bootstrap_iterations: usize,

    /// Loopy belief propagation iterations
    pub mrf_iterations: usize,

    /// Compatibility exponent per repetition (last entry repeats)
    pub mrf_compat_exponent: Vec<f64>,

    /// JSON file with the MRF compatibility table
    pub mrf_compat_path: Option<PathBuf>,

    /// Invoke the repetition observer
    pub visualize: bool,

    /// Stop when relative log-likelihood change drops below this
    pub early_stop_tolerance: Option<f64>,
}

impl Default for MesslConfig {
    fn default() -> Self {
        Self {
            reference_mic: None,
            repetitions: 16,
            ipd_mode: ModeSchedule::constant(CueMode::FrequencyIndependent),
            ipd_mean_mode: ModeSchedule::constant(CueMode::Disabled),
            ipd_var_mode: ModeSchedule::constant(CueMode::FrequencyIndependent),
            ild_mode: ModeSchedule::constant(CueMode::FrequencyDependent),
            sp_mode: ModeSchedule::constant(CueMode::Disabled),
            basis: BasisCompression::Off,
            garbage_source: false,
            ild_mean_init: IldInit::Scalar(0.0),
            ild_std_init: IldInit::Scalar(10.0),
            ipd_var_init: 1.0,
            ild_prior_precision: 0.0,
            sample_rate: 16000,
            window_size: None,
            mask_hold: 0,
            consistent_tdoa: false,
            bootstrap_iterations: 4,
            mrf_iterations: 8,
            mrf_compat_exponent: vec![1.0],
            mrf_compat_path: None,
            visualize: false,
            early_stop_tolerance: None,
        }
    }
}

impl MesslConfig {
    /// Create fast configuration (tied parameters, few repetitions)
    pub fn fast() -> Self {
        Self {
            repetitions: 8,
            ild_mode: ModeSchedule::constant(CueMode::FrequencyIndependent),
            mrf_iterations: 4,
            ..Default::default()
        }
    }

    /// Create high quality configuration
    ///
    /// Starts tied and switches to per-frequency parameters halfway.
    pub fn high_quality() -> Self {
        let repetitions = 24;
        let half = repetitions / 2;
        let mut var_modes = vec![CueMode::FrequencyIndependent; half];
        var_modes.push(CueMode::FrequencyDependent);
        Self {
            repetitions,
            ipd_mean_mode: ModeSchedule::starting_at(half, CueMode::FrequencyDependent),
            ipd_var_mode: ModeSchedule::from_modes(var_modes),
            ild_mode: ModeSchedule::constant(CueMode::FrequencyDependent),
            garbage_source: true,
            mrf_iterations: 12,
            ..Default::default()
        }
    }

    /// Use a reference microphone
    pub fn with_reference_mic(mut self, mic: usize) -> Self {
        self.reference_mic = Some(mic);
        self
    }

    /// Set repetition count
    pub fn with_repetitions(mut self, repetitions: usize) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Enable the garbage source
    pub fn with_garbage_source(mut self) -> Self {
        self.garbage_source = true;
        self
    }

    /// Enable the source-prior cue from `repetition` on
    pub fn with_source_prior_from(mut self, repetition: usize, mode: CueMode) -> Self {
        self.sp_mode = ModeSchedule::starting_at(repetition, mode);
        self
    }

    /// Parse from JSON text
    pub fn from_json_str(text: &str) -> MesslResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> MesslResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check scalar option ranges
    pub fn validate(&self) -> MesslResult<()> {
        if self.repetitions == 0 {
            return Err(MesslError::InvalidConfig("repetitions must be positive".into()));
        }
        if !(self.ipd_var_init.is_finite() && self.ipd_var_init > 0.0) {
            return Err(MesslError::InvalidConfig(format!(
                "ipd_var_init must be positive, got {}",
                self.ipd_var_init
            )));
        }
        if !(self.ild_prior_precision.is_finite() && self.ild_prior_precision >= 0.0) {
            return Err(MesslError::InvalidConfig(format!(
                "ild_prior_precision must be non-negative, got {}",
                self.ild_prior_precision
            )));
        }
        if let Some(window) = self.window_size {
            if window < 2 {
                return Err(MesslError::InvalidConfig(format!("window_size {window} too small")));
            }
        }
        if let BasisCompression::Dct { coefficients: 0 } = self.basis {
            return Err(MesslError::InvalidConfig("DCT basis needs at least one coefficient".into()));
        }
        if self.sample_rate == 0 {
            return Err(MesslError::InvalidConfig("sample_rate must be positive".into()));
        }
        if self.mrf_compat_exponent.iter().any(|e| !e.is_finite() || *e < 0.0) {
            return Err(MesslError::InvalidConfig(
                "MRF compatibility exponents must be finite and non-negative".into(),
            ));
        }
        if let Some(tol) = self.early_stop_tolerance {
            if !(tol.is_finite() && tol > 0.0) {
                return Err(MesslError::InvalidConfig(format!("early_stop_tolerance {tol} must be positive")));
            }
        }
        Ok(())
    }

    /// Compatibility exponent used for the final decode
    pub fn final_compat_exponent(&self) -> f64 {
        let last = self.repetitions.saturating_sub(1);
        self.mrf_compat_exponent
            .get(last)
            .or(self.mrf_compat_exponent.last())
            .copied()
            .unwrap_or(1.0)
    }

    /// Reduced configuration for the single-pair bootstrap
    ///
    /// Phase and level cues only, all tied across frequency.
    pub fn bootstrap(&self) -> Self {
        Self {
            reference_mic: None,
            repetitions: self.bootstrap_iterations.max(1),
            ipd_mode: ModeSchedule::constant(CueMode::FrequencyIndependent),
            ipd_mean_mode: ModeSchedule::constant(CueMode::Disabled),
            ipd_var_mode: ModeSchedule::constant(CueMode::FrequencyIndependent),
            ild_mode: ModeSchedule::constant(CueMode::FrequencyIndependent),
            sp_mode: ModeSchedule::constant(CueMode::Disabled),
            basis: BasisCompression::Off,
            mask_hold: 0,
            consistent_tdoa: false,
            visualize: false,
            early_stop_tolerance: None,
            ..self.clone()
        }
    }
}

/// Modes in effect for one repetition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepetitionModes {
    /// Phase-difference cue on
    pub ipd: bool,
    /// Phase-mean update
    pub ipd_mean: CueMode,
    /// Phase-variance update
    pub ipd_var: CueMode,
    /// Level-difference cue
    pub ild: CueMode,
    /// Source-prior cue
    pub sp: CueMode,
}

/// Cue modes for every repetition, resolved once before the loop
#[derive(Debug, Clone)]
pub struct ResolvedModes {
    per_repetition: Vec<RepetitionModes>,
    basis: BasisCompression,
}

impl ResolvedModes {
    /// Resolve schedules; `sp_available` false forces the source prior off
    pub fn resolve(config: &MesslConfig, sp_available: bool) -> Self {
        let per_repetition = (0..config.repetitions)
            .map(|rep| RepetitionModes {
                ipd: config.ipd_mode.at(rep).is_enabled(),
                ipd_mean: config.ipd_mean_mode.at(rep),
                ipd_var: config.ipd_var_mode.at(rep),
                ild: config.ild_mode.at(rep),
                sp: if sp_available {
                    config.sp_mode.at(rep)
                } else {
                    CueMode::Disabled
                },
            })
            .collect();
        Self {
            per_repetition,
            basis: config.basis,
        }
    }

    /// Modes at `repetition`
    pub fn at(&self, repetition: usize) -> RepetitionModes {
        let idx = repetition.min(self.per_repetition.len().saturating_sub(1));
        self.per_repetition[idx]
    }

    /// Number of repetitions
    pub fn len(&self) -> usize {
        self.per_repetition.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.per_repetition.is_empty()
    }

    /// Basis compression
    pub fn basis(&self) -> BasisCompression {
        self.basis
    }
}
