//! Matched FIR filter applied to normalized traces.

use crate::error::LengthMismatch;

/// Finite-impulse-response filter with a fixed set of taps.
///
/// Taps are given in ascending order and stored reversed, so that
/// `out[i] = sum_t taps[t] * x[i + 1 - len + t]`: the weights slide over the
/// trace with the window ending at `i`. Entries whose window leaves the
/// trace on the left are zero.
#[derive(Clone, Debug)]
pub struct FirFilter {
    kernel: Vec<f64>,
}

impl FirFilter {
    pub fn new(taps: &[f64]) -> Self {
        Self {
            kernel: taps.iter().rev().copied().collect(),
        }
    }

    /// Number of taps.
    #[inline]
    pub fn len(&self) -> usize {
        self.kernel.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kernel.is_empty()
    }

    /// First output index with full kernel overlap.
    #[inline]
    pub fn first_valid(&self) -> usize {
        self.kernel.len().saturating_sub(1)
    }

    /// Filter `input` into `out`, which must have the same length.
    pub fn apply(&self, input: &[f64], out: &mut [f64]) -> Result<(), LengthMismatch> {
        LengthMismatch::check(input.len(), out.len())?;
        out.fill(0.0);
        if self.kernel.is_empty() {
            return Ok(());
        }
        for (i, o) in out.iter_mut().enumerate().skip(self.first_valid()) {
            let mut acc = 0.0;
            for (j, &k) in self.kernel.iter().enumerate() {
                acc += k * input[i - j];
            }
            *o = acc;
        }
        Ok(())
    }
}
