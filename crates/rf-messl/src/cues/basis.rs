//! DCT basis compression of per-frequency parameters

use std::f64::consts::PI;

use ndarray::{Array1, Array2, ArrayViewMut1};

/// Orthonormal DCT-II basis truncated to the lowest coefficients
#[derive(Debug, Clone)]
pub struct DctBasis {
    /// Basis vectors as rows, shape (K, F)
    rows: Array2<f64>,
}

impl DctBasis {
    /// Basis for `bins` frequencies keeping `coefficients` terms
    pub fn new(bins: usize, coefficients: usize) -> Self {
        let k_max = coefficients.clamp(1, bins.max(1));
        let n = bins as f64;
        let rows = Array2::from_shape_fn((k_max, bins), |(k, f)| {
            let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            scale * (PI * (f as f64 + 0.5) * k as f64 / n).cos()
        });
        Self { rows }
    }

    /// Number of kept coefficients
    pub fn coefficients(&self) -> usize {
        self.rows.nrows()
    }

    /// Replace `values` by its projection onto the basis
    pub fn project(&self, mut values: ArrayViewMut1<'_, f64>) {
        let coeffs: Array1<f64> = self.rows.dot(&values);
        let smooth = self.rows.t().dot(&coeffs);
        values.assign(&smooth);
    }
}
