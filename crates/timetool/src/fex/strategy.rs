//! The two mutually exclusive ways of locating the edge on a normalized trace.

use timetool_core::{
    find_peaks, refine_peak, EdgeFitParams, EdgeFitter, FirFilter, Peak, MAX_PEAKS,
};

use crate::config::{FexConfig, StrategyKind};

/// Edge location before calibration.
#[derive(Clone, Debug, PartialEq)]
pub struct Located {
    pub amplitude: f64,
    pub position: f64,
    pub width: f64,
    pub raw_position: usize,
    pub raw_amplitude: f64,
    pub next_amplitude: Option<f64>,
    /// Fitted baseline; `None` means the reference level at the edge is used.
    pub baseline: Option<f64>,
    pub chi2_per_dof: Option<f64>,
    pub errors: Option<[f64; 4]>,
}

/// Common contract of both analysis paths.
pub trait EdgeLocator {
    /// Value subtracted from `signal / reference` before locating.
    fn offset(&self) -> f64;

    /// Locate the edge on `trace`, or `None` for no fit.
    fn locate(&mut self, trace: &[f64]) -> Option<Located>;
}

/// FIR filter followed by peak search and parabolic refinement.
#[derive(Clone, Debug)]
pub struct PeakLocator {
    filter: FirFilter,
    fraction: f64,
    response: Vec<f64>,
    peaks: Vec<Peak>,
}

impl PeakLocator {
    pub fn new(len: usize, weights: &[f64], fraction: f64) -> Self {
        Self {
            filter: FirFilter::new(weights),
            fraction,
            response: vec![0.0; len],
            peaks: Vec::with_capacity(MAX_PEAKS),
        }
    }

    /// Filtered response of the last located trace.
    #[inline]
    pub fn response(&self) -> &[f64] {
        &self.response
    }

    /// Confirmed peaks of the last located trace, strongest first.
    #[inline]
    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }
}

impl EdgeLocator for PeakLocator {
    fn offset(&self) -> f64 {
        1.0
    }

    fn locate(&mut self, trace: &[f64]) -> Option<Located> {
        if let Err(e) = self.filter.apply(trace, &mut self.response) {
            log::debug!("peak search skipped: {e}");
            return None;
        }
        let lo = self.filter.first_valid();
        find_peaks(
            &self.response,
            lo,
            self.response.len(),
            self.fraction,
            &mut self.peaks,
        );

        let best = *self.peaks.first()?;
        let fit = refine_peak(&self.response, best, lo)?;
        let next_amplitude = self
            .peaks
            .get(1)
            .and_then(|&p| refine_peak(&self.response, p, lo))
            .map(|f| f.amplitude);

        Some(Located {
            amplitude: fit.amplitude,
            position: fit.position,
            width: fit.fwhm,
            raw_position: best.index,
            raw_amplitude: best.value,
            next_amplitude,
            baseline: None,
            chi2_per_dof: None,
            errors: None,
        })
    }
}

/// Whole-trace sigmoid fit.
#[derive(Clone, Debug)]
pub struct SigmoidLocator {
    fitter: EdgeFitter,
    curve: Vec<f64>,
}

impl SigmoidLocator {
    pub fn new(len: usize, params: EdgeFitParams) -> Self {
        Self {
            fitter: EdgeFitter::new(len, params),
            curve: vec![0.0; len],
        }
    }

    /// Model evaluated on every sample of the last fit, zero after a
    /// failed one.
    #[inline]
    pub fn curve(&self) -> &[f64] {
        &self.curve
    }

    fn no_fit(&mut self) -> Option<Located> {
        self.curve.fill(0.0);
        None
    }
}

impl EdgeLocator for SigmoidLocator {
    fn offset(&self) -> f64 {
        0.0
    }

    fn locate(&mut self, trace: &[f64]) -> Option<Located> {
        let fit = match self.fitter.fit(trace) {
            Ok(fit) => fit,
            Err(err) => {
                log::debug!("sigmoid fit failed: {err}");
                return self.no_fit();
            }
        };
        if !fit.position.is_finite() {
            log::debug!("sigmoid fit has no finite position");
            return self.no_fit();
        }
        for (i, c) in self.curve.iter_mut().enumerate() {
            *c = fit.eval(i as f64);
        }

        let last = trace.len().saturating_sub(1);
        let raw_position = (fit.position.round().max(0.0) as usize).min(last);
        Some(Located {
            amplitude: fit.amplitude,
            position: fit.position,
            width: fit.sharpness,
            raw_position,
            raw_amplitude: trace.get(raw_position).copied().unwrap_or(0.0),
            next_amplitude: None,
            baseline: Some(fit.baseline),
            chi2_per_dof: Some(fit.chi2_per_dof),
            errors: Some(fit.errors),
        })
    }
}

/// Analysis path selected at configuration time.
#[derive(Clone, Debug)]
pub enum Strategy {
    Peak(PeakLocator),
    Edge(SigmoidLocator),
}

impl Strategy {
    pub fn from_config(config: &FexConfig) -> Self {
        let p = config.params();
        match config.strategy() {
            StrategyKind::Peak => Strategy::Peak(PeakLocator::new(
                config.trace_len(),
                &p.weights,
                p.peak_fraction,
            )),
            StrategyKind::Edge => {
                Strategy::Edge(SigmoidLocator::new(config.trace_len(), p.fit.clone()))
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Peak(_) => StrategyKind::Peak,
            Strategy::Edge(_) => StrategyKind::Edge,
        }
    }
}

impl EdgeLocator for Strategy {
    fn offset(&self) -> f64 {
        match self {
            Strategy::Peak(s) => s.offset(),
            Strategy::Edge(s) => s.offset(),
        }
    }

    fn locate(&mut self, trace: &[f64]) -> Option<Located> {
        match self {
            Strategy::Peak(s) => s.locate(trace),
            Strategy::Edge(s) => s.locate(trace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use timetool_core::sigmoid;

    #[test]
    fn peak_locator_finds_step_edge() {
        // Normalized trace steps from 0 to 0.5 at sample 60.
        let trace: Vec<f64> = (0..128).map(|i| if i >= 60 { 0.5 } else { 0.0 }).collect();
        let weights = [-1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0];
        let mut loc = PeakLocator::new(trace.len(), &weights, 0.5);
        let found = loc.locate(&trace).expect("edge");

        // Response rises to 2.0 at 63 and falls after; the apex is at 63.
        assert_eq!(found.raw_position, 63);
        assert_relative_eq!(found.raw_amplitude, 2.0);
        assert!((found.position - 63.0).abs() < 1.0);
        assert!(found.width > 0.0);
        assert_eq!(found.next_amplitude, None);
    }

    #[test]
    fn flat_trace_is_no_fit() {
        let mut loc = PeakLocator::new(64, &[-1.0, 1.0], 0.5);
        assert!(loc.locate(&[0.0; 64]).is_none());
        assert_eq!(loc.offset(), 1.0);
    }

    #[test]
    fn sigmoid_locator_reports_zero_based_position() {
        let (a, b, c, d) = (0.0, 6.0, 70.0, 0.4);
        let trace: Vec<f64> = (0..160)
            .map(|i| sigmoid(i as f64 + 1.0, a, b, c + 1.0, d))
            .collect();
        let mut loc = SigmoidLocator::new(
            trace.len(),
            EdgeFitParams {
                initial: [0.05, 5.0, 65.0, 0.35],
                max_iterations: 200,
                weights_scale: 0.0,
            },
        );
        let found = loc.locate(&trace).expect("converged");
        assert_relative_eq!(found.position, c, epsilon = 1e-4);
        assert_eq!(found.raw_position, 70);
        assert_relative_eq!(found.baseline.unwrap(), d, epsilon = 1e-5);
        assert_relative_eq!(loc.curve()[100], trace[100], epsilon = 1e-5);
    }

    #[test]
    fn failed_fit_clears_previous_curve() {
        let trace: Vec<f64> = (0..80)
            .map(|i| sigmoid(i as f64 + 1.0, 0.0, 6.0, 41.0, 0.4))
            .collect();
        let mut loc = SigmoidLocator::new(
            trace.len(),
            EdgeFitParams {
                initial: [0.05, 5.0, 38.0, 0.35],
                max_iterations: 200,
                weights_scale: 0.0,
            },
        );
        assert!(loc.locate(&trace).is_some());
        assert!(loc.curve().iter().any(|&c| c != 0.0));

        let mut broken = trace.clone();
        broken[10] = f64::NAN;
        assert!(loc.locate(&broken).is_none());
        assert!(loc.curve().iter().all(|&c| c == 0.0));
    }

    #[test]
    fn short_trace_is_no_fit_for_peak_path() {
        let mut loc = PeakLocator::new(64, &[-1.0, 1.0], 0.5);
        assert!(loc.locate(&[0.5; 32]).is_none());
    }
}
