//! Linear gain drift between a trace and its learned reference.
//!
//! Each beam-off pulse is compared with the reference it is about to be
//! folded into, fitting `sample[k] ~ reference[k] * (p0 + p1 * x_k)` with
//! `x_k = k / n - 0.5`. Fits from a beam-free region and from the signal
//! region of the same pulses are correlated, so the drift seen by the
//! region on a signal pulse predicts the drift under the signal.

use serde::{Deserialize, Serialize};

/// Per-sample noise assumed when reporting the ratio fit chi-square.
pub const RATIO_NOISE: f64 = 25.0;

/// Convergence of the rolling line fits in [`GainCorrelation`].
pub const CORRELATION_CONVERGENCE: f64 = 0.05;

/// Gain line `offset + slope * (k / n - 0.5)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GainLine {
    pub offset: f64,
    pub slope: f64,
    pub chi2: f64,
}

impl Default for GainLine {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl GainLine {
    pub const IDENTITY: Self = Self {
        offset: 1.0,
        slope: 0.0,
        chi2: 0.0,
    };

    /// Gain at sample `k` of `n`.
    #[inline]
    pub fn at(&self, k: usize, n: usize) -> f64 {
        self.offset + self.slope * (k as f64 / n as f64 - 0.5)
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.offset.is_finite() && self.slope.is_finite()
    }
}

/// Least-squares ratio of a sample to a reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GainFit {
    /// Fit the slope too; otherwise the ratio of sums is used and the
    /// slope stays zero.
    pub fit_slope: bool,
}

impl GainFit {
    pub fn new(fit_slope: bool) -> Self {
        Self { fit_slope }
    }

    /// Fit `sample` against `reference`; the shorter length is used.
    pub fn fit(&self, reference: &[f64], sample: &[f64]) -> GainLine {
        let n = reference.len().min(sample.len());
        if !self.fit_slope {
            let (sv, sw) = reference
                .iter()
                .zip(sample)
                .fold((0.0, 0.0), |(sv, sw), (&v, &w)| (sv + v, sw + w));
            return GainLine {
                offset: sw / sv,
                slope: 0.0,
                chi2: 0.0,
            };
        }

        let inv_var = 1.0 / (RATIO_NOISE * RATIO_NOISE);
        let mut s = [0.0f64; 6]; // vv, xvv, xxvv, vw, xvw, ww
        for (k, (&v, &w)) in reference.iter().zip(sample).enumerate() {
            let x = k as f64 / n as f64 - 0.5;
            let vv = v * v * inv_var;
            let vw = v * w * inv_var;
            s[0] += vv;
            s[1] += x * vv;
            s[2] += x * x * vv;
            s[3] += vw;
            s[4] += x * vw;
            s[5] += w * w * inv_var;
        }
        let [vv, xvv, xxvv, vw, xvw, ww] = s;
        let det = vv * xxvv - xvv * xvv;
        let offset = (vw * xxvv - xvw * xvv) / det;
        let slope = (xvw * vv - vw * xvv) / det;
        let chi2 = ww + vv * offset * offset + xxvv * slope * slope + 2.0 * xvv * offset * slope
            - 2.0 * (vw * offset + xvw * slope);
        GainLine {
            offset,
            slope,
            chi2,
        }
    }
}

/// Exponentially weighted straight-line fit `y = intercept + slope * x`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineFit {
    convergence: f64,
    weight: f64,
    x: f64,
    y: f64,
    xx: f64,
    xy: f64,
}

impl LineFit {
    pub fn new(convergence: f64) -> Self {
        Self {
            convergence,
            weight: 0.0,
            x: 0.0,
            y: 0.0,
            xx: 0.0,
            xy: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.convergence);
    }

    pub fn accum(&mut self, x: f64, y: f64) {
        let f = self.convergence;
        self.weight += f * (1.0 - self.weight);
        self.x += f * (x - self.x);
        self.y += f * (y - self.y);
        self.xx += f * (x * x - self.xx);
        self.xy += f * (x * y - self.xy);
    }

    /// `[intercept, slope]`, or `None` before the first point.
    ///
    /// Without spread in `x` the slope is zero and the intercept is the
    /// weighted mean of `y`.
    pub fn finalize(&self) -> Option<[f64; 2]> {
        if self.weight <= 0.0 {
            return None;
        }
        let (mx, my) = (self.x / self.weight, self.y / self.weight);
        let var = self.xx / self.weight - mx * mx;
        if var <= f64::EPSILON * (mx * mx).max(f64::MIN_POSITIVE) {
            return Some([my, 0.0]);
        }
        let slope = (self.xy / self.weight - mx * my) / var;
        Some([my - slope * mx, slope])
    }
}

/// Maps the gain seen in a beam-free region to the gain under the signal.
///
/// Predicts unit gain until the first `period` pulse pairs have been
/// accumulated; the mapping is refreshed every `period` pairs after that.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GainCorrelation {
    period: usize,
    pending: usize,
    offsets: LineFit,
    slopes: LineFit,
    offset_map: [f64; 2],
    slope_map: [f64; 2],
}

impl GainCorrelation {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            pending: 0,
            offsets: LineFit::new(CORRELATION_CONVERGENCE),
            slopes: LineFit::new(CORRELATION_CONVERGENCE),
            offset_map: [1.0, 0.0],
            slope_map: [0.0, 0.0],
        }
    }

    #[inline]
    pub fn period(&self) -> usize {
        self.period
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.period);
    }

    /// Add the fits of one beam-off pulse.
    pub fn accum(&mut self, region: GainLine, signal: GainLine) {
        self.offsets.accum(region.offset, signal.offset);
        self.slopes.accum(region.slope, signal.slope);
        self.pending += 1;
        if self.pending < self.period {
            return;
        }
        self.pending = 0;
        if let Some(map) = self.offsets.finalize() {
            self.offset_map = map;
        }
        if let Some(map) = self.slopes.finalize() {
            self.slope_map = map;
        }
        self.offsets.reset();
        self.slopes.reset();
    }

    /// Predicted signal gain for the region gain of the current pulse.
    pub fn predict(&self, region: GainLine) -> GainLine {
        GainLine {
            offset: self.offset_map[0] + self.offset_map[1] * region.offset,
            slope: self.slope_map[0] + self.slope_map[1] * region.slope,
            chi2: region.chi2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tilted(reference: &[f64], offset: f64, slope: f64) -> Vec<f64> {
        let n = reference.len();
        let g = GainLine {
            offset,
            slope,
            chi2: 0.0,
        };
        reference
            .iter()
            .enumerate()
            .map(|(k, &r)| r * g.at(k, n))
            .collect()
    }

    #[test]
    fn recovers_exact_tilt() {
        let reference: Vec<f64> = (0..200).map(|k| 1500.0 + 40.0 * ((k % 9) as f64)).collect();
        let sample = tilted(&reference, 1.08, -0.3);
        let line = GainFit::new(true).fit(&reference, &sample);
        assert_relative_eq!(line.offset, 1.08, epsilon = 1e-10);
        assert_relative_eq!(line.slope, -0.3, epsilon = 1e-10);
        assert!(line.chi2.abs() < 1e-6);
    }

    #[test]
    fn offset_only_fit_is_ratio_of_sums() {
        let reference = [100.0, 200.0, 300.0];
        let sample = [110.0, 220.0, 390.0];
        let line = GainFit::new(false).fit(&reference, &sample);
        assert_relative_eq!(line.offset, 720.0 / 600.0);
        assert_eq!(line.slope, 0.0);
    }

    #[test]
    fn line_fit_recovers_line_and_handles_no_spread() {
        let mut fit = LineFit::new(0.2);
        assert_eq!(fit.finalize(), None);
        for i in 0..30 {
            let x = 0.9 + 0.01 * (i % 7) as f64;
            fit.accum(x, 0.5 + 2.0 * x);
        }
        let [b, m] = fit.finalize().unwrap();
        assert_relative_eq!(m, 2.0, epsilon = 1e-8);
        assert_relative_eq!(b, 0.5, epsilon = 1e-8);

        fit.reset();
        for _ in 0..5 {
            fit.accum(1.0, 3.0);
        }
        let [b, m] = fit.finalize().unwrap();
        assert_eq!(m, 0.0);
        assert_relative_eq!(b, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn correlation_updates_once_per_period() {
        let mut corr = GainCorrelation::new(4);
        let region = GainLine {
            offset: 1.2,
            slope: 0.1,
            chi2: 0.0,
        };
        assert_eq!(corr.predict(region).offset, 1.0);
        assert_eq!(corr.predict(region).slope, 0.0);

        // Signal gain is twice the region gain minus one.
        for i in 0..3 {
            let r = GainLine {
                offset: 0.9 + 0.05 * i as f64,
                slope: 0.02 * i as f64,
                chi2: 0.0,
            };
            let s = GainLine {
                offset: 2.0 * r.offset - 1.0,
                slope: 2.0 * r.slope,
                chi2: 0.0,
            };
            corr.accum(r, s);
        }
        assert_eq!(corr.predict(region).offset, 1.0);

        corr.accum(
            GainLine {
                offset: 1.1,
                slope: 0.06,
                chi2: 0.0,
            },
            GainLine {
                offset: 1.2,
                slope: 0.12,
                chi2: 0.0,
            },
        );
        let p = corr.predict(region);
        assert_relative_eq!(p.offset, 1.4, epsilon = 1e-9);
        assert_relative_eq!(p.slope, 0.2, epsilon = 1e-9);
    }
}
