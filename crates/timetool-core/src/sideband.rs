//! Common-mode background estimate from a sideband region.
//!
//! The camera read-out has a small coherent offset that is shared by pixels
//! of equal parity within each half of the sensor. The corrector keeps a
//! rolling average of the sideband trace and, per pulse, shifts that
//! average by the mean deviation of each (half, parity) group.

use crate::error::LengthMismatch;

/// Rolling sideband average plus per-pulse quadrant correction.
#[derive(Clone, Debug)]
pub struct SidebandCorrector {
    convergence: f64,
    avg: Vec<f64>,
    estimate: Vec<f64>,
    initialized: bool,
}

impl SidebandCorrector {
    /// Corrector for traces of `len` samples averaging with fraction `convergence`.
    pub fn new(len: usize, convergence: f64) -> Self {
        Self {
            convergence,
            avg: vec![0.0; len],
            estimate: vec![0.0; len],
            initialized: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.avg.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.avg.is_empty()
    }

    #[inline]
    pub fn convergence(&self) -> f64 {
        self.convergence
    }

    /// Rolling average of all sideband traces seen so far.
    #[inline]
    pub fn average(&self) -> &[f64] {
        &self.avg
    }

    /// Most recent common-mode estimate.
    #[inline]
    pub fn estimate(&self) -> &[f64] {
        &self.estimate
    }

    /// Forget the rolling average; the next trace seeds it again.
    pub fn clear(&mut self) {
        self.initialized = false;
        self.avg.fill(0.0);
        self.estimate.fill(0.0);
    }

    /// Fold `sideband` into the average and return the common-mode estimate
    /// for this pulse. The average is left untouched on a length mismatch.
    pub fn process(&mut self, sideband: &[i64]) -> Result<&[f64], LengthMismatch> {
        LengthMismatch::check(self.avg.len(), sideband.len())?;

        if !self.initialized {
            self.initialized = true;
            for (a, &s) in self.avg.iter_mut().zip(sideband) {
                *a = s as f64;
            }
        } else {
            rolling_average(&mut self.avg, sideband.iter().map(|&s| s as f64), self.convergence);
        }

        // [left even, left odd, right even, right odd]
        let half = self.avg.len() / 2;
        let mut sum = [0.0f64; 4];
        let mut count = [0usize; 4];
        for (k, (&s, &a)) in sideband.iter().zip(&self.avg).enumerate() {
            let g = quadrant(k, half);
            sum[g] += s as f64 - a;
            count[g] += 1;
        }
        let mut shift = [0.0f64; 4];
        for g in 0..4 {
            if count[g] > 0 {
                shift[g] = sum[g] / count[g] as f64;
            }
        }

        for (k, (e, &a)) in self.estimate.iter_mut().zip(&self.avg).enumerate() {
            *e = a + shift[quadrant(k, half)];
        }
        Ok(&self.estimate)
    }
}

#[inline]
fn quadrant(k: usize, half: usize) -> usize {
    let right = usize::from(k >= half);
    2 * right + (k & 1)
}

/// Exponential rolling average `avg <- (1 - f) * avg + f * new`.
///
/// Written as `avg += f * (new - avg)` so that a converged average stays
/// bit-identical when fed its own value.
pub fn rolling_average(avg: &mut [f64], new: impl IntoIterator<Item = f64>, fraction: f64) {
    for (a, v) in avg.iter_mut().zip(new) {
        *a += fraction * (v - *a);
    }
}
