//! Error and warning types for multichannel separation

use std::fmt;

use thiserror::Error;

/// Separation error types
///
/// Everything except the collaborator failures at the bottom is a
/// validation error, raised before any EM work starts.
#[derive(Error, Debug)]
pub enum MesslError {
    /// Mixture tensor is malformed
    #[error("Invalid mixture: {0}")]
    InvalidMixture(String),

    /// Tau grid has no entries
    #[error("Tau grid is empty")]
    EmptyTauGrid,

    /// Tau grid is not strictly ascending or holds non-finite values
    #[error("Tau grid must be strictly ascending and finite (violated at index {index})")]
    UnsortedTauGrid { index: usize },

    /// Source count must be positive
    #[error("Invalid source count: {0}")]
    InvalidSourceCount(usize),

    /// Reference microphone outside the mixture's channels
    #[error("Invalid reference mic {index}: mixture has {channels} channels")]
    InvalidReferenceMic { index: usize, channels: usize },

    /// Array input with the wrong shape
    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// MRF compatibility table rejected
    #[error("Invalid compatibility table: {0}")]
    InvalidCompatibility(String),

    /// Least-squares solve failed
    #[error("Least-squares solve failed: {0}")]
    SolveFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type for separation operations
pub type MesslResult<T> = Result<T, MesslError>;

/// Cue model identifiers used in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CueKind {
    /// Interaural phase difference
    Ipd,
    /// Interaural level difference
    Ild,
    /// Pretrained source prior
    SourcePrior,
}

impl CueKind {
    /// Short display name
    pub fn name(&self) -> &'static str {
        match self {
            CueKind::Ipd => "ipd",
            CueKind::Ild => "ild",
            CueKind::SourcePrior => "source-prior",
        }
    }
}

impl fmt::Display for CueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Non-fatal conditions reported during a run
#[derive(Debug, Clone, PartialEq)]
pub enum SeparationWarning {
    /// Source-prior cue was scheduled but no models were supplied
    SourcePriorUnavailable,

    /// A cue produced NaN or infinite log-likelihoods
    NonFiniteLikelihood {
        pair: usize,
        repetition: usize,
        cue: CueKind,
        count: usize,
    },

    /// A pair observes a silent channel and is left out of the consensus
    SilentPair {
        pair: usize,
        first: usize,
        second: usize,
    },
}

impl fmt::Display for SeparationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeparationWarning::SourcePriorUnavailable => {
                write!(f, "source-prior cue requested without models; cue disabled")
            }
            SeparationWarning::NonFiniteLikelihood {
                pair,
                repetition,
                cue,
                count,
            } => write!(
                f,
                "pair {pair}, repetition {repetition}: {count} non-finite {cue} log-likelihood values"
            ),
            SeparationWarning::SilentPair { pair, first, second } => write!(
                f,
                "pair {pair} (mics {first}, {second}) observes a silent channel; excluded from consensus"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_display_has_context() {
        let warning = SeparationWarning::NonFiniteLikelihood {
            pair: 2,
            repetition: 5,
            cue: CueKind::Ild,
            count: 3,
        };
        let text = warning.to_string();
        assert!(text.contains("pair 2"));
        assert!(text.contains("repetition 5"));
        assert!(text.contains("ild"));
    }

    #[test]
    fn test_silent_pair_display() {
        let warning = SeparationWarning::SilentPair {
            pair: 1,
            first: 0,
            second: 2,
        };
        assert_eq!(
            warning.to_string(),
            "pair 1 (mics 0, 2) observes a silent channel; excluded from consensus"
        );
    }

    #[test]
    fn test_error_messages() {
        let err = MesslError::InvalidReferenceMic {
            index: 4,
            channels: 3,
        };
        assert_eq!(err.to_string(), "Invalid reference mic 4: mixture has 3 channels");
    }
}
