//! Hard-label decoding with a Markov random field
//!
//! Max-sum loopy belief propagation over the 4-connected (frequency, time)
//! grid. Messages are exchanged synchronously: every new message is built
//! from the previous iteration's messages only.

use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, Array4};

use crate::error::{MesslError, MesslResult};

/// Neighbour directions as seen from the receiving bin
const FROM_LOWER_FREQ: usize = 0;
const FROM_UPPER_FREQ: usize = 1;
const FROM_PREV_FRAME: usize = 2;
const FROM_NEXT_FRAME: usize = 3;
const DIRECTIONS: usize = 4;

/// Source of the label compatibility table
pub trait CompatibilityLoader {
    /// Load a square table of positive compatibilities
    fn load(&self) -> MesslResult<Array2<f64>>;
}

/// Compatibility table stored as a JSON array of rows
#[derive(Debug, Clone)]
pub struct JsonCompatibilityFile {
    path: PathBuf,
}

impl JsonCompatibilityFile {
    /// Loader for `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Parse a table from JSON text
    pub fn parse(text: &str) -> MesslResult<Array2<f64>> {
        let rows: Vec<Vec<f64>> = serde_json::from_str(text)?;
        let n = rows.len();
        if rows.iter().any(|r| r.len() != n) {
            return Err(MesslError::InvalidCompatibility(format!(
                "table must be square, got {n} rows of lengths {:?}",
                rows.iter().map(Vec::len).collect::<Vec<_>>()
            )));
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((n, n), flat).map_err(|e| MesslError::InvalidCompatibility(e.to_string()))
    }
}

impl CompatibilityLoader for JsonCompatibilityFile {
    fn load(&self) -> MesslResult<Array2<f64>> {
        let text = std::fs::read_to_string(&self.path)?;
        Self::parse(&text)
    }
}

/// Table with every compatibility equal (no smoothing)
#[derive(Debug, Clone, Copy)]
pub struct NeutralCompatibility {
    /// Number of labels
    pub labels: usize,
}

impl CompatibilityLoader for NeutralCompatibility {
    fn load(&self) -> MesslResult<Array2<f64>> {
        Ok(Array2::ones((self.labels, self.labels)))
    }
}

/// Loopy belief propagation decoder
#[derive(Debug, Clone)]
pub struct MrfAssigner {
    /// exponent * ln(compatibility), indexed [sender label, receiver label]
    pairwise: Array2<f64>,
    iterations: usize,
}

impl MrfAssigner {
    /// Create decoder for `labels` labels
    ///
    /// A table one label short is taken to omit the garbage label, which
    /// is then given neutral compatibility.
    pub fn new(table: &Array2<f64>, labels: usize, exponent: f64, iterations: usize) -> MesslResult<Self> {
        let (rows, cols) = table.dim();
        if rows != cols {
            return Err(MesslError::InvalidCompatibility(format!("table is {rows}x{cols}, not square")));
        }
        if table.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            return Err(MesslError::InvalidCompatibility("entries must be finite and positive".into()));
        }
        if rows != labels && rows + 1 != labels {
            return Err(MesslError::InvalidCompatibility(format!(
                "table has {rows} labels, expected {labels}"
            )));
        }

        let mut full = Array2::ones((labels, labels));
        full.slice_mut(ndarray::s![..rows, ..rows]).assign(table);
        Ok(Self {
            pairwise: full.mapv(|c| exponent * c.ln()),
            iterations,
        })
    }

    /// Number of labels
    pub fn labels(&self) -> usize {
        self.pairwise.nrows()
    }

    /// Most probable label per bin for log unary scores (F, T, L)
    pub fn decode(&self, unary: &Array3<f64>) -> Array2<usize> {
        let beliefs = self.beliefs(unary);
        let (bins, frames, _) = beliefs.dim();
        Array2::from_shape_fn((bins, frames), |(f, t)| {
            beliefs
                .slice(ndarray::s![f, t, ..])
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(bl, bv), (l, &v)| if v > bv { (l, v) } else { (bl, bv) })
                .0
        })
    }

    /// Max-marginal beliefs after message passing
    pub fn beliefs(&self, unary: &Array3<f64>) -> Array3<f64> {
        let (bins, frames, labels) = unary.dim();
        // Non-finite unaries would poison every message they touch
        let unary = unary.mapv(|v| if v.is_finite() { v } else { -1e300 });
        let mut incoming = Array4::<f64>::zeros((bins, frames, DIRECTIONS, labels));

        let mut h = vec![0.0; labels];
        let mut msg = vec![0.0; labels];
        for _ in 0..self.iterations {
            let mut next = Array4::<f64>::zeros((bins, frames, DIRECTIONS, labels));
            for f in 0..bins {
                for t in 0..frames {
                    for (dir, target) in neighbours(f, t, bins, frames) {
                        // Sender belief without what the target told it
                        for l in 0..labels {
                            h[l] = unary[[f, t, l]];
                            for d in 0..DIRECTIONS {
                                if d != dir {
                                    h[l] += incoming[[f, t, d, l]];
                                }
                            }
                        }
                        for (lq, m) in msg.iter_mut().enumerate() {
                            *m = (0..labels)
                                .map(|lp| h[lp] + self.pairwise[[lp, lq]])
                                .fold(f64::NEG_INFINITY, f64::max);
                        }
                        let max = msg.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                        let (tf, tt) = target;
                        for (lq, &m) in msg.iter().enumerate() {
                            next[[tf, tt, opposite(dir), lq]] = m - max;
                        }
                    }
                }
            }
            incoming = next;
        }

        let mut beliefs = unary;
        for ((f, t, l), b) in beliefs.indexed_iter_mut() {
            *b += incoming.slice(ndarray::s![f, t, .., l]).sum();
        }
        beliefs
    }
}

/// Existing neighbours of (f, t), keyed by their direction from (f, t)
fn neighbours(f: usize, t: usize, bins: usize, frames: usize) -> impl Iterator<Item = (usize, (usize, usize))> {
    [
        (f > 0).then(|| (FROM_LOWER_FREQ, (f - 1, t))),
        (f + 1 < bins).then(|| (FROM_UPPER_FREQ, (f + 1, t))),
        (t > 0).then(|| (FROM_PREV_FRAME, (f, t - 1))),
        (t + 1 < frames).then(|| (FROM_NEXT_FRAME, (f, t + 1))),
    ]
    .into_iter()
    .flatten()
}

fn opposite(direction: usize) -> usize {
    match direction {
        FROM_LOWER_FREQ => FROM_UPPER_FREQ,
        FROM_UPPER_FREQ => FROM_LOWER_FREQ,
        FROM_PREV_FRAME => FROM_NEXT_FRAME,
        _ => FROM_PREV_FRAME,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_neutral_table_is_argmax() {
        let unary = Array3::from_shape_fn((3, 4, 2), |(f, t, l)| if (f + t) % 2 == l { -0.1 } else { -2.0 });
        let table = NeutralCompatibility { labels: 2 }.load().unwrap();
        let mrf = MrfAssigner::new(&table, 2, 1.0, 5).unwrap();
        let labels = mrf.decode(&unary);
        for ((f, t), &l) in labels.indexed_iter() {
            assert_eq!(l, (f + t) % 2);
        }
    }

    #[test]
    fn test_smoothing_flips_isolated_bin() {
        // Everything prefers label 0 except one weakly contrary bin
        let mut unary = Array3::from_shape_fn((5, 5, 2), |(_, _, l)| if l == 0 { -0.2 } else { -1.8 });
        unary[[2, 2, 0]] = -0.9;
        unary[[2, 2, 1]] = -0.5;

        let plain = MrfAssigner::new(&array![[1.0, 1.0], [1.0, 1.0]], 2, 1.0, 6).unwrap();
        assert_eq!(plain.decode(&unary)[[2, 2]], 1);

        let smooth = MrfAssigner::new(&array![[2.0, 1.0], [1.0, 2.0]], 2, 1.0, 6).unwrap();
        assert_eq!(smooth.decode(&unary)[[2, 2]], 0);
    }

    #[test]
    fn test_table_without_garbage_is_padded() {
        let mrf = MrfAssigner::new(&array![[2.0, 1.0], [1.0, 2.0]], 3, 1.0, 1).unwrap();
        assert_eq!(mrf.labels(), 3);
        assert!(MrfAssigner::new(&array![[2.0, 1.0], [1.0, 2.0]], 4, 1.0, 1).is_err());
        assert!(MrfAssigner::new(&array![[0.0, 1.0], [1.0, 2.0]], 2, 1.0, 1).is_err());
    }

    #[test]
    fn test_json_table_parsing() {
        let table = JsonCompatibilityFile::parse("[[1.0, 0.5], [0.5, 1.0]]").unwrap();
        assert_eq!(table[[0, 1]], 0.5);
        assert!(JsonCompatibilityFile::parse("[[1.0, 0.5], [0.5]]").is_err());
    }
}
