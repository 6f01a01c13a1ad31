//! Peak search on a filtered response and local sub-sample refinement.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Upper bound on tracked candidate peaks.
pub const MAX_PEAKS: usize = 8;

/// Fraction of the peak value that bounds the parabola fit window.
const FIT_FRACTION: f64 = 0.8;

/// A confirmed peak on the filtered response.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub index: usize,
    pub value: f64,
}

/// Sub-sample refinement of a [`Peak`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeakFit {
    pub amplitude: f64,
    pub position: f64,
    /// Full width at half of the sampled peak value.
    pub fwhm: f64,
}

/// Scan `response[lo..hi)` left to right and collect confirmed peaks.
///
/// A candidate is confirmed once the running maximum has grown to more than
/// `1 / fraction` times the level it rose from, and the response then falls
/// below `fraction` of that maximum. `peaks` ends up ordered by descending
/// value and holds at most [`MAX_PEAKS`] entries; it is cleared first and
/// never grows beyond that capacity.
pub fn find_peaks(response: &[f64], lo: usize, hi: usize, fraction: f64, peaks: &mut Vec<Peak>) {
    peaks.clear();
    let hi = hi.min(response.len());
    if lo >= hi {
        return;
    }

    let mut amax = response[lo].max(0.0);
    let mut aleft = amax;
    let mut aright = 0.0;
    let mut imax = lo;
    let mut rising = false;

    for (i, &v) in response.iter().enumerate().take(hi).skip(lo + 1) {
        if v > amax {
            amax = v;
            if amax * fraction > aleft {
                imax = i;
                rising = true;
                aright = fraction * amax;
            }
        } else if rising && v < aright {
            insert_peak(peaks, Peak { index: imax, value: amax });
            rising = false;
            amax = v.max(0.0);
            aleft = amax;
        } else if !rising && v < aleft {
            amax = v.max(0.0);
            aleft = amax;
        }
    }
}

fn insert_peak(peaks: &mut Vec<Peak>, peak: Peak) {
    if peaks.len() == MAX_PEAKS {
        match peaks.last() {
            Some(last) if last.value > peak.value => return,
            _ => {
                peaks.pop();
            }
        }
    }
    let at = peaks
        .iter()
        .position(|p| p.value < peak.value)
        .unwrap_or(peaks.len());
    peaks.insert(at, peak);
}

/// Least-squares parabola `y = c0 + c1 x + c2 x^2` accumulated point by point.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParabolaFit {
    sx: [f64; 5],
    sxy: [f64; 3],
    origin: f64,
}

impl ParabolaFit {
    /// Fit with abscissae measured relative to `origin`.
    pub fn around(origin: f64) -> Self {
        Self {
            origin,
            ..Self::default()
        }
    }

    pub fn accum(&mut self, x: f64, y: f64) {
        let x = x - self.origin;
        let mut p = 1.0;
        for k in 0..5 {
            self.sx[k] += p;
            if k < 3 {
                self.sxy[k] += p * y;
            }
            p *= x;
        }
    }

    /// Solve for `(c0, c1, c2)`; `None` if the system is singular.
    pub fn coefficients(&self) -> Option<[f64; 3]> {
        let s = &self.sx;
        let a = Matrix3::new(
            s[0], s[1], s[2], //
            s[1], s[2], s[3], //
            s[2], s[3], s[4],
        );
        let b = Vector3::new(self.sxy[0], self.sxy[1], self.sxy[2]);
        let c = a.lu().solve(&b)?;
        Some([c[0], c[1], c[2]])
    }

    /// Vertex `(amplitude, position)` of a downward-opening parabola.
    pub fn vertex(&self) -> Option<(f64, f64)> {
        let [c0, c1, c2] = self.coefficients()?;
        if c2.is_nan() || c2 >= 0.0 {
            return None;
        }
        let dx = -c1 / (2.0 * c2);
        Some((c0 + 0.5 * c1 * dx, self.origin + dx))
    }
}

/// Refine `peak` on `response` with a parabola over its upper 20 % and
/// measure its full width at half maximum.
///
/// The window never extends to indices `<= lo` or `>= response.len() - 1`.
/// Returns `None` if the parabola does not open downwards.
pub fn refine_peak(response: &[f64], peak: Peak, lo: usize) -> Option<PeakFit> {
    let n = response.len();
    let ix = peak.index;
    if n < 3 || ix == 0 || ix + 1 >= n {
        return None;
    }
    let y0 = response[ix];
    let threshold = FIT_FRACTION * y0;

    let mut fit = ParabolaFit::around(ix as f64);
    fit.accum(ix as f64, y0);

    let mut left = ix;
    while left > lo + 1 {
        left -= 1;
        fit.accum(left as f64, response[left]);
        if response[left] < threshold {
            break;
        }
    }
    let mut right = ix;
    while right + 2 < n {
        right += 1;
        fit.accum(right as f64, response[right]);
        if response[right] < threshold {
            break;
        }
    }

    let (amplitude, position) = fit.vertex()?;

    let half = 0.5 * y0;
    while response[left] > half && left > lo {
        left -= 1;
    }
    while response[right] > half && right + 1 < n {
        right += 1;
    }
    let x_left = crossing(response, left, left + 1, half);
    let x_right = crossing(response, right - 1, right, half);

    Some(PeakFit {
        amplitude,
        position,
        fwhm: x_right - x_left,
    })
}

/// Linear interpolation of where the segment `i0 -> i1` crosses `level`.
fn crossing(response: &[f64], i0: usize, i1: usize, level: f64) -> f64 {
    let (y0, y1) = (response[i0], response[i1]);
    let dy = y1 - y0;
    if dy == 0.0 {
        return i0 as f64;
    }
    i0 as f64 + (level - y0) / dy * (i1 - i0) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gaussian(n: usize, peaks: &[(f64, f64)], sigma: f64) -> Vec<f64> {
        (0..n)
            .map(|i| {
                peaks
                    .iter()
                    .map(|&(a, x0)| {
                        let d = i as f64 - x0;
                        a * (-0.5 * d * d / (sigma * sigma)).exp()
                    })
                    .sum()
            })
            .collect()
    }

    #[test]
    fn two_separated_peaks_in_descending_order() {
        let y = gaussian(128, &[(60.0, 80.0), (100.0, 20.0)], 3.0);
        let mut peaks = Vec::with_capacity(MAX_PEAKS);
        find_peaks(&y, 0, y.len(), 0.5, &mut peaks);

        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].index, 20);
        assert_relative_eq!(peaks[0].value, 100.0);
        assert_eq!(peaks[1].index, 80);
        assert_relative_eq!(peaks[1].value, 60.0);
    }

    #[test]
    fn unconfirmed_rise_is_not_a_peak() {
        let y: Vec<f64> = (0..64).map(|i| i as f64).collect();
        let mut peaks = Vec::new();
        find_peaks(&y, 0, y.len(), 0.5, &mut peaks);
        assert!(peaks.is_empty());
    }

    #[test]
    fn peak_list_is_bounded() {
        let centres: Vec<(f64, f64)> = (0..12)
            .map(|k| (10.0 + k as f64, 20.0 + 30.0 * k as f64))
            .collect();
        let y = gaussian(400, &centres, 2.0);
        let mut peaks = Vec::with_capacity(MAX_PEAKS);
        find_peaks(&y, 0, y.len(), 0.5, &mut peaks);

        assert_eq!(peaks.len(), MAX_PEAKS);
        assert!(peaks.windows(2).all(|w| w[0].value >= w[1].value));
        assert_eq!(peaks[0].index, 350);
    }

    #[test]
    fn parabola_recovers_vertex() {
        let (a, x0, k) = (42.0, 40.3, 0.7);
        let y: Vec<f64> = (0..80)
            .map(|i| {
                let d = i as f64 - x0;
                (a - k * d * d).max(0.0)
            })
            .collect();
        let peak = Peak { index: 40, value: y[40] };
        let fit = refine_peak(&y, peak, 0).expect("valid fit");

        assert_relative_eq!(fit.position, x0, epsilon = 1e-9);
        assert_relative_eq!(fit.amplitude, a, epsilon = 1e-9);
        assert!(fit.fwhm > 0.0);
    }

    #[test]
    fn fwhm_of_triangle() {
        // Symmetric triangle, apex 10 at index 20, slope 1.
        let y: Vec<f64> = (0..41)
            .map(|i| (10.0 - (i as f64 - 20.0).abs()).max(0.0))
            .collect();
        let fit = refine_peak(&y, Peak { index: 20, value: 10.0 }, 0).expect("fit");
        assert_relative_eq!(fit.fwhm, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn upward_parabola_is_rejected() {
        let y: Vec<f64> = (0..20).map(|i| (i as f64 - 10.0).powi(2)).collect();
        assert!(refine_peak(&y, Peak { index: 10, value: 0.0 }, 0).is_none());
    }
}
