use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use timetool_core::{GainLine, RoiClamp};

/// Classification of a pulse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Laser absent; nothing is learned or analysed.
    #[default]
    Dark,
    /// Beam absent; the pulse feeds the reference.
    Reference,
    /// Beam and laser present; the pulse is analysed.
    Signal,
}

/// Reason a pulse produced no result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cut {
    NoLaser,
    BadFrame,
    BelowCut,
    NoReference,
    NoFit,
}

impl Cut {
    pub fn name(self) -> &'static str {
        match self {
            Cut::NoLaser => "no laser",
            Cut::BadFrame => "bad frame",
            Cut::BelowCut => "below cut",
            Cut::NoReference => "no reference",
            Cut::NoFit => "no fit",
        }
    }
}

impl fmt::Display for Cut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one analysis call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PulseStatus {
    /// No pulse analysed since the last reset.
    #[default]
    Idle,
    /// Features were extracted.
    Analyzed,
    /// The pulse was folded into the reference.
    ReferenceUpdated,
    Dropped(Cut),
}

impl PulseStatus {
    #[inline]
    pub fn is_analyzed(self) -> bool {
        self == PulseStatus::Analyzed
    }

    #[inline]
    pub fn cut(self) -> Option<Cut> {
        match self {
            PulseStatus::Dropped(c) => Some(c),
            _ => None,
        }
    }
}

/// Named projection region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoiName {
    Signal,
    Sideband,
    Reference,
}

impl fmt::Display for RoiName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RoiName::Signal => "signal",
            RoiName::Sideband => "sideband",
            RoiName::Reference => "reference",
        })
    }
}

/// Recoverable disagreement between the configuration and the data.
///
/// The engine continues with clamped or ignored values; the caller decides
/// whether that is acceptable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ConfigMismatch {
    /// A region extends beyond the frame along the trace axis.
    RoiClamp { roi: RoiName, clamp: RoiClamp },
    /// A persisted reference has a different shape than the configured trace.
    ReferenceShape {
        path: PathBuf,
        expected: [usize; 2],
        found: [usize; 2],
    },
    /// A persisted reference exists but could not be read.
    ReferenceUnreadable { path: PathBuf, reason: String },
}

impl fmt::Display for ConfigMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigMismatch::RoiClamp { roi, clamp } => write!(f, "{roi} {clamp}"),
            ConfigMismatch::ReferenceShape {
                path,
                expected,
                found,
            } => write!(
                f,
                "reference {} has shape {}x{}, expected {}x{}; ignored",
                path.display(),
                found[0],
                found[1],
                expected[0],
                expected[1]
            ),
            ConfigMismatch::ReferenceUnreadable { path, reason } => {
                write!(f, "reference {} unreadable: {reason}", path.display())
            }
        }
    }
}

/// Features of an analysed pulse.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Features {
    /// Peak amplitude of the filtered response, or sigmoid level `a`.
    pub amplitude: f64,
    /// Sub-sample edge position in trace samples.
    pub position: f64,
    /// Position mapped through the calibration polynomial.
    pub position_ps: f64,
    /// `position_ps` relative to the calibrated trace centre.
    pub position_adj: f64,
    /// Full width at half maximum of the filtered peak, or sigmoid sharpness `b`.
    pub width: f64,
    /// Sample index of the strongest peak before refinement.
    pub raw_position: usize,
    pub raw_amplitude: f64,
    /// Amplitude of the second-best peak, if one was found and refined.
    pub next_amplitude: Option<f64>,
    /// Reference level at the edge, or sigmoid baseline `d`.
    pub ref_amplitude: f64,
    pub chi2_per_dof: Option<f64>,
    /// Uncertainties of `[a, b, c, d]` for the sigmoid fit.
    pub errors: Option<[f64; 4]>,
    /// Gain correction applied to the reference in gain-ratio mode.
    #[serde(default)]
    pub gain: Option<GainLine>,
}

/// Per-pulse result held by the engine between `reset()` calls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PulseResult {
    pub event_type: EventType,
    pub status: PulseStatus,
    #[serde(default)]
    pub features: Option<Features>,
    #[serde(default)]
    pub mismatch: Option<ConfigMismatch>,
}

impl PulseResult {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
