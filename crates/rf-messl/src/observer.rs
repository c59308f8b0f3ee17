//! Per-repetition observation hook
//!
//! Plotting and progress reporting sit behind [`RepetitionObserver`]; the
//! engine hands out read-only snapshots and never waits on the result.

use crate::engine::PairState;

/// Read-only view of the engine after a repetition's M-step
#[derive(Debug, Clone, Copy)]
pub struct RepetitionSnapshot<'a> {
    /// Zero-based repetition index
    pub repetition: usize,
    /// Total repetitions scheduled
    pub repetitions: usize,
    /// Per-pair state (observations, parameters, posteriors)
    pub pairs: &'a [PairState],
    /// Sum of the pairs' log-likelihoods this repetition
    pub total_log_likelihood: f64,
}

impl RepetitionSnapshot<'_> {
    /// Log-likelihood of each pair this repetition
    pub fn pair_log_likelihoods(&self) -> Vec<f64> {
        self.pairs
            .iter()
            .map(|p| p.log_likelihood.last().copied().unwrap_or(f64::NAN))
            .collect()
    }
}

/// Receives a snapshot after every repetition
pub trait RepetitionObserver: Send {
    /// Called once per repetition, after all pairs were updated
    fn on_repetition(&mut self, snapshot: &RepetitionSnapshot<'_>);
}

/// Observer that reports progress through `log`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RepetitionObserver for LogObserver {
    fn on_repetition(&mut self, snapshot: &RepetitionSnapshot<'_>) {
        log::debug!(
            "Repetition {}/{}: total log-likelihood {:.3}, pairs {:?}",
            snapshot.repetition + 1,
            snapshot.repetitions,
            snapshot.total_log_likelihood,
            snapshot.pair_log_likelihoods()
        );
    }
}
