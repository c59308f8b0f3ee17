//! Array-valued side inputs

use ndarray::{Array2, Array3};

use crate::cues::SourcePriorModel;
use crate::error::{MesslError, MesslResult};

/// Optional priors and seeds supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct Priors {
    /// Persistent mask prior (probabilities), shape (F, T, I')
    pub mask_prior: Option<Array3<f64>>,
    /// Per-bin M-step weights, shape (F, T)
    pub reliability: Option<Array2<f64>>,
    /// Initial P(tau | source) per pair, shape (I or I', Ntau) each
    pub delay_tables: Option<Vec<Array2<f64>>>,
    /// Initial source delay at each microphone, shape (I, C), samples
    pub source_delays: Option<Array2<f64>>,
    /// Pretrained source models, one per source
    pub source_models: Option<Vec<SourcePriorModel>>,
}

/// Dimensions the priors are checked against
#[derive(Debug, Clone, Copy)]
pub(crate) struct PriorShape {
    pub bins: usize,
    pub frames: usize,
    pub channels: usize,
    pub pairs: usize,
    pub sources: usize,
    pub labels: usize,
    pub taus: usize,
    /// Repetitions the mask prior is held for
    pub mask_hold: usize,
}

impl Priors {
    /// Set mask prior
    pub fn with_mask_prior(mut self, mask_prior: Array3<f64>) -> Self {
        self.mask_prior = Some(mask_prior);
        self
    }

    /// Set reliability weights
    pub fn with_reliability(mut self, reliability: Array2<f64>) -> Self {
        self.reliability = Some(reliability);
        self
    }

    /// Set per-pair delay tables
    pub fn with_delay_tables(mut self, tables: Vec<Array2<f64>>) -> Self {
        self.delay_tables = Some(tables);
        self
    }

    /// Set per-microphone source delays
    pub fn with_source_delays(mut self, delays: Array2<f64>) -> Self {
        self.source_delays = Some(delays);
        self
    }

    /// Set source-prior models
    pub fn with_source_models(mut self, models: Vec<SourcePriorModel>) -> Self {
        self.source_models = Some(models);
        self
    }

    pub(crate) fn validate(&self, shape: &PriorShape) -> MesslResult<()> {
        if let Some(mask) = &self.mask_prior {
            let expected = (shape.bins, shape.frames, shape.labels);
            if mask.dim() != expected {
                return Err(mismatch("mask prior", expected, mask.dim()));
            }
            if mask.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                return Err(MesslError::InvalidConfig("mask prior must be finite and non-negative".into()));
            }
            // Mask-prior runs start from flat delays, so the prior is the only label source
            if shape.mask_hold == 0 {
                return Err(MesslError::InvalidConfig(
                    "mask prior supplied with mask_hold = 0; it would never be applied".into(),
                ));
            }
        }

        if let Some(reliability) = &self.reliability {
            let expected = (shape.bins, shape.frames);
            if reliability.dim() != expected {
                return Err(mismatch("reliability weights", expected, reliability.dim()));
            }
            if reliability.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                return Err(MesslError::InvalidConfig("reliability weights must be finite and non-negative".into()));
            }
        }

        if let Some(tables) = &self.delay_tables {
            if tables.len() != shape.pairs {
                return Err(mismatch("delay tables", shape.pairs, tables.len()));
            }
            for table in tables {
                if table.nrows() < shape.sources || table.ncols() != shape.taus {
                    return Err(mismatch("delay table", (shape.sources, shape.taus), table.dim()));
                }
            }
        }

        if let Some(delays) = &self.source_delays {
            let expected = (shape.sources, shape.channels);
            if delays.dim() != expected {
                return Err(mismatch("source delays", expected, delays.dim()));
            }
        }

        if let Some(models) = &self.source_models {
            if models.len() != shape.sources {
                return Err(mismatch("source models", shape.sources, models.len()));
            }
            for model in models {
                model.validate(shape.bins)?;
            }
        }

        Ok(())
    }
}

fn mismatch<E: std::fmt::Debug, G: std::fmt::Debug>(what: &'static str, expected: E, got: G) -> MesslError {
    MesslError::ShapeMismatch {
        what,
        expected: format!("{expected:?}"),
        got: format!("{got:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> PriorShape {
        PriorShape {
            bins: 4,
            frames: 3,
            channels: 3,
            pairs: 3,
            sources: 2,
            labels: 3,
            taus: 5,
            mask_hold: 1,
        }
    }

    #[test]
    fn test_empty_priors_valid() {
        assert!(Priors::default().validate(&shape()).is_ok());
    }

    #[test]
    fn test_mask_prior_shape_checked() {
        let good = Priors::default().with_mask_prior(Array3::from_elem((4, 3, 3), 1.0 / 3.0));
        assert!(good.validate(&shape()).is_ok());
        let bad = Priors::default().with_mask_prior(Array3::from_elem((4, 3, 2), 0.5));
        assert!(matches!(bad.validate(&shape()), Err(MesslError::ShapeMismatch { what: "mask prior", .. })));
    }

    #[test]
    fn test_mask_prior_needs_hold() {
        let priors = Priors::default().with_mask_prior(Array3::from_elem((4, 3, 3), 1.0 / 3.0));
        let unheld = PriorShape {
            mask_hold: 0,
            ..shape()
        };
        assert!(matches!(priors.validate(&unheld), Err(MesslError::InvalidConfig(_))));
        // Without a mask prior the hold is irrelevant
        assert!(Priors::default().validate(&unheld).is_ok());
    }

    #[test]
    fn test_delay_tables_and_models_checked() {
        let tables = Priors::default().with_delay_tables(vec![Array2::ones((2, 5)); 2]);
        assert!(tables.validate(&shape()).is_err());
        let delays = Priors::default().with_source_delays(Array2::zeros((2, 3)));
        assert!(delays.validate(&shape()).is_ok());
        let models = Priors::default().with_source_models(Vec::new());
        assert!(models.validate(&shape()).is_err());
    }
}
