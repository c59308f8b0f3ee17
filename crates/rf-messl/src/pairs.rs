//! Microphone pair selection

use serde::{Deserialize, Serialize};

use crate::error::{MesslError, MesslResult};

/// Ordered pair of channel indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelPair {
    /// First channel (delays are measured relative to it)
    pub first: usize,
    /// Second channel
    pub second: usize,
}

impl ChannelPair {
    /// Create new pair
    pub fn new(first: usize, second: usize) -> Self {
        Self { first, second }
    }

    /// Check if the pair uses `channel`
    pub fn contains(&self, channel: usize) -> bool {
        self.first == channel || self.second == channel
    }
}

/// Pairs taking part in a run plus the evidence rescale factor
#[derive(Debug, Clone, PartialEq)]
pub struct PairSelection {
    /// Selected pairs in processing order
    pub pairs: Vec<ChannelPair>,
    /// Scale applied to the summed log-posteriors of the other pairs
    pub overcount_rescale: f64,
}

impl PairSelection {
    /// Number of pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Choose microphone pairs for `channels` microphones
///
/// With a reference mic `r` every pair is `(r, j)`, giving `C - 1`
/// independent pairs. Otherwise all `C (C - 1) / 2` combinations are used
/// and each pair's evidence is rescaled by `C / (Np - 1)` to offset each
/// channel appearing in several pairs.
pub fn select_pairs(channels: usize, reference_mic: Option<usize>) -> MesslResult<PairSelection> {
    if channels < 2 {
        return Err(MesslError::InvalidMixture(format!(
            "need at least 2 channels, got {channels}"
        )));
    }

    match reference_mic {
        Some(reference) => {
            if reference >= channels {
                return Err(MesslError::InvalidReferenceMic {
                    index: reference,
                    channels,
                });
            }
            let pairs = (0..channels)
                .filter(|&ch| ch != reference)
                .map(|ch| ChannelPair::new(reference, ch))
                .collect();
            Ok(PairSelection {
                pairs,
                overcount_rescale: 1.0,
            })
        }
        None => {
            let mut pairs = Vec::with_capacity(channels * (channels - 1) / 2);
            for first in 0..channels {
                for second in (first + 1)..channels {
                    pairs.push(ChannelPair::new(first, second));
                }
            }
            // FIXME: numerator possibly should be (C - 1); kept until checked against recordings
            let overcount_rescale = if pairs.len() > 1 {
                channels as f64 / (pairs.len() - 1) as f64
            } else {
                1.0
            };
            Ok(PairSelection {
                pairs,
                overcount_rescale,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_pairs_four_channels() {
        let selection = select_pairs(4, None).unwrap();
        assert_eq!(selection.len(), 6);
        assert_eq!(selection.pairs[0], ChannelPair::new(0, 1));
        assert_eq!(selection.pairs[5], ChannelPair::new(2, 3));
        assert!((selection.overcount_rescale - 4.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_reference_mic_pairs() {
        let selection = select_pairs(4, Some(2)).unwrap();
        assert_eq!(selection.len(), 3);
        assert!(selection.pairs.iter().all(|p| p.contains(2)));
        assert!(selection.pairs.iter().all(|p| p.first == 2));
        assert_eq!(selection.overcount_rescale, 1.0);
    }

    #[test]
    fn test_two_channels_single_pair() {
        let selection = select_pairs(2, None).unwrap();
        assert_eq!(selection.pairs, vec![ChannelPair::new(0, 1)]);
        assert_eq!(selection.overcount_rescale, 1.0);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            select_pairs(3, Some(3)),
            Err(MesslError::InvalidReferenceMic { index: 3, channels: 3 })
        ));
        assert!(select_pairs(1, None).is_err());
    }
}
