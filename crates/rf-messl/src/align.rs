//! Cross-pair source label alignment
//!
//! Every pair's initializer labels sources arbitrarily. Pairs are visited in
//! order and each is permuted to best match a running reference mask (the
//! mean of all masks aligned so far, starting with the first pair's).

use ndarray::{Array2, Array3, Axis, Zip};

use crate::assignment::best_assignment;

/// Probability floor inside the divergence logs
const KL_FLOOR: f64 = 1e-12;

/// Per-pair permutations and the relabelled inputs
#[derive(Debug, Clone)]
pub struct AlignedPairs {
    /// Permutation applied to each pair: new source `i` was source `perm[i]`
    pub permutations: Vec<Vec<usize>>,
    /// Relabelled masks, shape (F, T, I') each
    pub masks: Vec<Array3<f64>>,
    /// Relabelled delay posteriors, shape (I', Ntau) each
    pub delay_posteriors: Vec<Array2<f64>>,
}

/// Resolves label permutations between pairs
#[derive(Debug, Clone, Copy)]
pub struct SourcePermutationAligner {
    sources: usize,
}

impl SourcePermutationAligner {
    /// Aligner for `sources` genuine sources; any garbage plane stays put
    pub fn new(sources: usize) -> Self {
        Self { sources }
    }

    /// Align every pair to the first, in order
    pub fn align(&self, masks: Vec<Array3<f64>>, delay_posteriors: Vec<Array2<f64>>) -> AlignedPairs {
        let mut permutations = Vec::with_capacity(masks.len());
        let mut aligned_masks = Vec::with_capacity(masks.len());
        let mut aligned_delays = Vec::with_capacity(delay_posteriors.len());
        let mut reference: Option<Array3<f64>> = None;

        for (index, (mask, delays)) in masks.into_iter().zip(delay_posteriors).enumerate() {
            let perm = match &reference {
                None => (0..self.sources).collect(),
                Some(reference) => best_assignment(&self.cost_matrix(reference, &mask)),
            };
            log::debug!("Pair {index} aligned with permutation {perm:?}");

            let mask = permute_planes(&mask, &perm);
            let delays = permute_rows(&delays, &perm);

            reference = Some(match reference {
                None => mask.clone(),
                Some(mut running) => {
                    // Running mean over the `index + 1` masks seen so far
                    let n = index as f64;
                    Zip::from(&mut running)
                        .and(&mask)
                        .for_each(|r, &m| *r = (*r * n + m) / (n + 1.0));
                    running
                }
            });

            permutations.push(perm);
            aligned_masks.push(mask);
            aligned_delays.push(delays);
        }

        AlignedPairs {
            permutations,
            masks: aligned_masks,
            delay_posteriors: aligned_delays,
        }
    }

    /// cost[i][j]: symmetrised KL between reference plane i and candidate plane j
    ///
    /// The divergence of flattened masks is the sum of these per-plane terms
    /// (plus a garbage term no permutation changes).
    pub fn cost_matrix(&self, reference: &Array3<f64>, candidate: &Array3<f64>) -> Array2<f64> {
        let n = self.sources;
        Array2::from_shape_fn((n, n), |(i, j)| {
            symmetric_kl(
                reference.index_axis(Axis(2), i).iter(),
                candidate.index_axis(Axis(2), j).iter(),
            )
        })
    }
}

/// Symmetrised KL term sum (p - q)(ln p - ln q)
fn symmetric_kl<'a>(p: impl Iterator<Item = &'a f64>, q: impl Iterator<Item = &'a f64>) -> f64 {
    p.zip(q)
        .map(|(&a, &b)| {
            let a = a.max(KL_FLOOR);
            let b = b.max(KL_FLOOR);
            (a - b) * (a.ln() - b.ln())
        })
        .sum()
}

/// Reorder source planes of a mask; planes past `perm.len()` are unchanged
pub fn permute_planes(mask: &Array3<f64>, perm: &[usize]) -> Array3<f64> {
    let mut out = mask.clone();
    for (new, &old) in perm.iter().enumerate() {
        out.index_axis_mut(Axis(2), new).assign(&mask.index_axis(Axis(2), old));
    }
    out
}

/// Reorder rows of a per-source table; rows past `perm.len()` are unchanged
pub fn permute_rows(table: &Array2<f64>, perm: &[usize]) -> Array2<f64> {
    let mut out = table.clone();
    for (new, &old) in perm.iter().enumerate() {
        out.row_mut(new).assign(&table.row(old));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-source mask with a garbage plane; source 0 owns even frames
    fn mask(swapped: bool) -> Array3<f64> {
        Array3::from_shape_fn((4, 6, 3), |(_, t, i)| {
            let owner = if swapped { 1 - t % 2 } else { t % 2 };
            match i {
                2 => 0.1,
                _ if i == owner => 0.8,
                _ => 0.1,
            }
        })
    }

    fn delays(swapped: bool) -> Array2<f64> {
        let mut table = Array2::zeros((3, 5));
        let (a, b) = if swapped { (3, 1) } else { (1, 3) };
        table[[0, a]] = 1.0;
        table[[1, b]] = 1.0;
        table[[2, 0]] = 1.0;
        table
    }

    #[test]
    fn test_swapped_pair_is_realigned() {
        let aligner = SourcePermutationAligner::new(2);
        let aligned = aligner.align(vec![mask(false), mask(true)], vec![delays(false), delays(true)]);

        assert_eq!(aligned.permutations, vec![vec![0, 1], vec![1, 0]]);
        assert_eq!(aligned.masks[1], mask(false));
        assert_eq!(aligned.delay_posteriors[1], delays(false));
        // Garbage row untouched
        assert_eq!(aligned.delay_posteriors[1][[2, 0]], 1.0);
    }

    #[test]
    fn test_alignment_is_deterministic() {
        let aligner = SourcePermutationAligner::new(2);
        let inputs = || (vec![mask(false), mask(true), mask(true)], vec![delays(false), delays(true), delays(true)]);
        let (m1, d1) = inputs();
        let (m2, d2) = inputs();
        let first = aligner.align(m1, d1);
        let second = aligner.align(m2, d2);
        assert_eq!(first.permutations, second.permutations);
        assert_eq!(first.masks, second.masks);
    }

    #[test]
    fn test_five_sources_realigned() {
        let sources = 5;
        let owner = |f: usize, t: usize| (f + 2 * t) % sources;
        let reference = Array3::from_shape_fn((6, 10, sources + 1), |(f, t, i)| match i {
            _ if i == sources => 0.05,
            _ if i == owner(f, t) => 0.75,
            _ => 0.05,
        });
        // Candidate plane perm[i] holds reference plane i
        let perm = vec![3, 0, 4, 1, 2];
        let table = Array2::from_shape_fn((sources + 1, 7), |(i, k)| if k == i { 1.0 } else { 0.0 });
        let mut candidate = reference.clone();
        let mut candidate_table = table.clone();
        for (i, &p) in perm.iter().enumerate() {
            candidate.index_axis_mut(Axis(2), p).assign(&reference.index_axis(Axis(2), i));
            candidate_table.row_mut(p).assign(&table.row(i));
        }

        let aligner = SourcePermutationAligner::new(sources);
        let aligned = aligner.align(vec![reference.clone(), candidate], vec![table.clone(), candidate_table]);

        assert_eq!(aligned.permutations[1], perm);
        assert_eq!(aligned.masks[1], reference);
        assert_eq!(aligned.delay_posteriors[1], table);
    }

    #[test]
    fn test_cost_matrix_prefers_matching_planes() {
        let aligner = SourcePermutationAligner::new(2);
        let cost = aligner.cost_matrix(&mask(false), &mask(false));
        assert!(cost[[0, 0]].abs() < 1e-12);
        assert!(cost[[0, 1]] > 0.0);
    }
}
