//! Engine parameters and their validation.

mod kv;

pub use kv::KeyValues;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use timetool_core::{polynomial, EdgeFitParams, LogicOp, LogicSpec, LogicTerm, ProjectionAxis, Roi};

use crate::result::RoiName;

/// Errors from validating parameters or reading key/value text.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{roi} roi bounds are not ordered: {bounds:?}")]
    UnorderedRoi { roi: RoiName, bounds: Roi },
    #[error("{roi} roi projects to {got} samples, signal roi to {expected}")]
    ExtentMismatch {
        roi: RoiName,
        expected: usize,
        got: usize,
    },
    #[error("{name} must be in (0, 1], got {value}")]
    Fraction { name: &'static str, value: f64 },
    #[error("peak_fraction must be in (0, 1), got {0}")]
    PeakFraction(f64),
    #[error("filter weights are empty")]
    EmptyWeights,
    #[error("{taps} filter weights exceed the trace length {len}")]
    WeightsTooLong { taps: usize, len: usize },
    #[error("fit_max_iterations must be positive")]
    ZeroIterations,
    #[error("ref_update_period must be positive")]
    ZeroPeriod,
    #[error("trace of {0} samples is too short for the sigmoid fit")]
    TraceTooShort(usize),
    #[error("ipm_beam_threshold must be finite, got {0}")]
    Threshold(f64),
    #[error("key {key:?} expects {expected} values, got {got}")]
    Arity {
        key: String,
        expected: usize,
        got: usize,
    },
    #[error("key {key:?}: cannot parse {value:?}")]
    Value { key: String, value: String },
}

fn default_base_name() -> String {
    "TimeTool".to_string()
}

fn default_sig_roi() -> Roi {
    Roi::new(0, 1023, 0, 1023)
}

fn default_sb_convergence() -> f64 {
    0.05
}

fn default_ref_convergence() -> f64 {
    0.25
}

fn default_weights() -> Vec<f64> {
    let mut w = vec![-0.1; 5];
    w.extend([0.1; 5]);
    w
}

fn default_calib_poly() -> Vec<f64> {
    vec![0.0, 1.0]
}

fn default_beam_logic() -> LogicSpec {
    LogicSpec::new(vec![LogicTerm {
        code: 162,
        op: LogicOp::AndNot,
    }])
}

fn default_ref_update_period() -> usize {
    10
}

fn default_peak_fraction() -> f64 {
    0.5
}

/// Which learned reference normalizes signal pulses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    /// Signal region learned on beam-off pulses.
    #[default]
    NoBeam,
    /// Reference region learned on every signal pulse.
    Region,
    /// Beam-off reference times the gain drift predicted from the
    /// reference region.
    GainRatio,
}

impl ReferenceMode {
    /// Whether the reference region is projected at all.
    #[inline]
    pub fn uses_region(self) -> bool {
        self != ReferenceMode::NoBeam
    }
}

/// Raw engine parameters.
///
/// Every field has a default; `FexConfig::new` checks consistency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FexParams {
    /// Name used in log lines. Default `"TimeTool"`.
    #[serde(default = "default_base_name")]
    pub base_name: String,
    /// Physical channel identity; keys the shared reference. Default 0.
    #[serde(default)]
    pub phy: u32,
    /// Axis collapsed by the projection. Default rows are summed.
    #[serde(default)]
    pub axis: ProjectionAxis,
    /// Subtracted from every pixel before summing. Default 0.
    #[serde(default)]
    pub pedestal: i64,
    /// Signal region. Default rows and cols 0..=1023.
    #[serde(default = "default_sig_roi")]
    pub sig_roi: Roi,
    /// Sideband region; defaults to the signal region.
    #[serde(default)]
    pub sb_roi: Option<Roi>,
    /// Reference region, used unless `ref_mode` is `NoBeam`.
    #[serde(default)]
    pub ref_roi: Option<Roi>,
    /// Sideband rolling-average fraction. Default 0.05.
    #[serde(default = "default_sb_convergence")]
    pub sb_convergence: f64,
    /// Reference rolling-average fraction. Default 0.25.
    #[serde(default = "default_ref_convergence")]
    pub ref_convergence: f64,
    /// Corrected samples at or below this value are zeroed. Default 0.
    #[serde(default)]
    pub sig_cut: f64,
    /// A reference-region trace with no sample above this is not learned.
    /// Default 0.
    #[serde(default)]
    pub ref_cut: f64,
    /// FIR taps in ascending order. Default 5 x -0.1 then 5 x 0.1.
    #[serde(default = "default_weights")]
    pub weights: Vec<f64>,
    /// Pixel-to-time polynomial, lowest order first. Default identity.
    #[serde(default = "default_calib_poly")]
    pub calib_poly: Vec<f64>,
    /// Beam-present rule. Default AND-NOT 162.
    #[serde(default = "default_beam_logic")]
    pub beam_logic: LogicSpec,
    /// Laser-present rule. Default empty (always present).
    #[serde(default)]
    pub laser_logic: LogicSpec,
    /// An intensity below this forces no-beam. Default unset.
    #[serde(default)]
    pub ipm_beam_threshold: Option<f64>,
    /// Peak confirmation fraction. Default 0.5.
    #[serde(default = "default_peak_fraction")]
    pub peak_fraction: f64,
    /// Use the sigmoid fit instead of the filter + peak path. Default false.
    #[serde(default)]
    pub use_fit: bool,
    /// Sigmoid fit start point and limits.
    #[serde(default)]
    pub fit: EdgeFitParams,
    /// Reference used to normalize signal pulses. Default `NoBeam`.
    #[serde(default)]
    pub ref_mode: ReferenceMode,
    /// Fit a gain slope as well as an offset in `GainRatio` mode. Default false.
    #[serde(default)]
    pub ref_fit_slope: bool,
    /// Beam-off pulses between refreshes of the gain correlation. Default 10.
    #[serde(default = "default_ref_update_period")]
    pub ref_update_period: usize,
    /// Directory of persisted references. Default `$HOME`, then `/tmp`.
    #[serde(default)]
    pub reference_dir: Option<PathBuf>,
    /// Length of the normalized-trace window around the edge; 0 disables it.
    #[serde(default)]
    pub window_len: usize,
}

impl Default for FexParams {
    fn default() -> Self {
        Self {
            base_name: default_base_name(),
            phy: 0,
            axis: ProjectionAxis::default(),
            pedestal: 0,
            sig_roi: default_sig_roi(),
            sb_roi: None,
            ref_roi: None,
            sb_convergence: default_sb_convergence(),
            ref_convergence: default_ref_convergence(),
            sig_cut: 0.0,
            ref_cut: 0.0,
            weights: default_weights(),
            calib_poly: default_calib_poly(),
            beam_logic: default_beam_logic(),
            laser_logic: LogicSpec::default(),
            ipm_beam_threshold: None,
            peak_fraction: default_peak_fraction(),
            use_fit: false,
            fit: EdgeFitParams::default(),
            ref_mode: ReferenceMode::NoBeam,
            ref_fit_slope: false,
            ref_update_period: default_ref_update_period(),
            reference_dir: None,
            window_len: 0,
        }
    }
}

/// Which analysis path a configuration selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// FIR filter, peak search and parabolic refinement.
    Peak,
    /// Whole-trace sigmoid fit.
    Edge,
}

/// Validated, immutable engine configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct FexConfig {
    params: FexParams,
    sb_roi: Roi,
    ref_roi: Roi,
    trace_len: usize,
    center_ps: f64,
}

impl FexConfig {
    pub fn new(params: FexParams) -> Result<Self, ConfigError> {
        let axis = params.axis;
        let sb_roi = params.sb_roi.unwrap_or(params.sig_roi);
        let ref_roi = params.ref_roi.unwrap_or(params.sig_roi);

        let mut regions = vec![(RoiName::Signal, params.sig_roi), (RoiName::Sideband, sb_roi)];
        if params.ref_mode.uses_region() {
            regions.push((RoiName::Reference, ref_roi));
        }
        for &(roi, bounds) in &regions {
            if !bounds.is_ordered() {
                return Err(ConfigError::UnorderedRoi { roi, bounds });
            }
        }
        let trace_len = params.sig_roi.projected_len(axis);
        for &(roi, bounds) in &regions[1..] {
            let got = bounds.projected_len(axis);
            if got != trace_len {
                return Err(ConfigError::ExtentMismatch {
                    roi,
                    expected: trace_len,
                    got,
                });
            }
        }

        for (name, value) in [
            ("sb_convergence", params.sb_convergence),
            ("ref_convergence", params.ref_convergence),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Fraction { name, value });
            }
        }
        if !(params.peak_fraction > 0.0 && params.peak_fraction < 1.0) {
            return Err(ConfigError::PeakFraction(params.peak_fraction));
        }
        if params.ref_mode == ReferenceMode::GainRatio && params.ref_update_period == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        if let Some(t) = params.ipm_beam_threshold {
            if !t.is_finite() {
                return Err(ConfigError::Threshold(t));
            }
        }

        if params.use_fit {
            if params.fit.max_iterations == 0 {
                return Err(ConfigError::ZeroIterations);
            }
            if trace_len <= 4 {
                return Err(ConfigError::TraceTooShort(trace_len));
            }
        } else {
            if params.weights.is_empty() {
                return Err(ConfigError::EmptyWeights);
            }
            if params.weights.len() > trace_len {
                return Err(ConfigError::WeightsTooLong {
                    taps: params.weights.len(),
                    len: trace_len,
                });
            }
        }

        let center_ps = polynomial(&params.calib_poly, (trace_len / 2) as f64);

        Ok(Self {
            params,
            sb_roi,
            ref_roi,
            trace_len,
            center_ps,
        })
    }

    #[inline]
    pub fn params(&self) -> &FexParams {
        &self.params
    }

    #[inline]
    pub fn ref_mode(&self) -> ReferenceMode {
        self.params.ref_mode
    }

    #[inline]
    pub fn strategy(&self) -> StrategyKind {
        if self.params.use_fit {
            StrategyKind::Edge
        } else {
            StrategyKind::Peak
        }
    }

    /// Samples per projected trace.
    #[inline]
    pub fn trace_len(&self) -> usize {
        self.trace_len
    }

    #[inline]
    pub fn sig_roi(&self) -> Roi {
        self.params.sig_roi
    }

    #[inline]
    pub fn sb_roi(&self) -> Roi {
        self.sb_roi
    }

    #[inline]
    pub fn ref_roi(&self) -> Roi {
        self.ref_roi
    }

    /// Calibrated position of the trace centre.
    #[inline]
    pub fn center_ps(&self) -> f64 {
        self.center_ps
    }

    /// Map a sample position through the calibration polynomial.
    #[inline]
    pub fn calibrate(&self, position: f64) -> f64 {
        polynomial(&self.params.calib_poly, position)
    }
}

impl TryFrom<FexParams> for FexConfig {
    type Error = ConfigError;

    fn try_from(params: FexParams) -> Result<Self, Self::Error> {
        Self::new(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn small() -> FexParams {
        FexParams {
            sig_roi: Roi::new(0, 9, 0, 99),
            ..FexParams::default()
        }
    }

    #[test]
    fn defaults_validate() {
        let cfg = FexConfig::new(FexParams::default()).expect("valid defaults");
        assert_eq!(cfg.trace_len(), 1024);
        assert_eq!(cfg.strategy(), StrategyKind::Peak);
        assert_eq!(cfg.sb_roi(), cfg.sig_roi());
    }

    #[test]
    fn sideband_extent_must_match() {
        let params = FexParams {
            sb_roi: Some(Roi::new(20, 29, 0, 98)),
            ..small()
        };
        assert_eq!(
            FexConfig::new(params),
            Err(ConfigError::ExtentMismatch {
                roi: RoiName::Sideband,
                expected: 100,
                got: 99
            })
        );
    }

    #[test]
    fn reference_roi_checked_only_when_used() {
        let mut params = FexParams {
            ref_roi: Some(Roi::new(5, 2, 0, 10)),
            ..small()
        };
        assert!(FexConfig::new(params.clone()).is_ok());
        params.ref_mode = ReferenceMode::Region;
        assert!(matches!(
            FexConfig::new(params),
            Err(ConfigError::UnorderedRoi {
                roi: RoiName::Reference,
                ..
            })
        ));
    }

    #[test]
    fn gain_ratio_needs_a_period() {
        let params = FexParams {
            ref_mode: ReferenceMode::GainRatio,
            ref_update_period: 0,
            ..small()
        };
        assert_eq!(FexConfig::new(params.clone()), Err(ConfigError::ZeroPeriod));
        // Unused outside gain-ratio mode.
        assert!(FexConfig::new(FexParams {
            ref_mode: ReferenceMode::Region,
            ..params
        })
        .is_ok());
    }

    #[test]
    fn fractions_are_bounded() {
        let params = FexParams {
            ref_convergence: 0.0,
            ..small()
        };
        assert!(matches!(
            FexConfig::new(params),
            Err(ConfigError::Fraction {
                name: "ref_convergence",
                ..
            })
        ));
        let params = FexParams {
            peak_fraction: 1.0,
            ..small()
        };
        assert_eq!(FexConfig::new(params), Err(ConfigError::PeakFraction(1.0)));
    }

    #[test]
    fn weights_required_only_for_peak_path() {
        let params = FexParams {
            weights: Vec::new(),
            ..small()
        };
        assert_eq!(
            FexConfig::new(params.clone()),
            Err(ConfigError::EmptyWeights)
        );
        let cfg = FexConfig::new(FexParams {
            use_fit: true,
            ..params
        })
        .expect("fit path needs no weights");
        assert_eq!(cfg.strategy(), StrategyKind::Edge);
    }

    #[test]
    fn center_is_calibrated_mid_trace() {
        let cfg = FexConfig::new(FexParams {
            calib_poly: vec![1.0, 0.5, 0.01],
            ..small()
        })
        .unwrap();
        assert_relative_eq!(cfg.center_ps(), 1.0 + 25.0 + 25.0);
        assert_relative_eq!(cfg.calibrate(10.0), 1.0 + 5.0 + 1.0);
    }
}
