//! Signal-processing primitives for single-shot timing-edge extraction.
//!
//! Everything here is stateless or owns only its own scratch buffers. The
//! per-pulse engine, the shared reference and configuration live in the
//! `timetool` crate.

mod calib;
mod edge_fit;
mod error;
mod filter;
mod frame;
mod logger;
mod logic;
mod peak;
mod ratio;
mod sideband;

pub use calib::polynomial;
pub use edge_fit::{sigmoid, EdgeFit, EdgeFitError, EdgeFitParams, EdgeFitter, X_OFFSET};
pub use error::LengthMismatch;
pub use filter::FirFilter;
pub use frame::{project, Frame, FrameView, ProjectionAxis, Roi, RoiClamp, RoiError};
pub use logic::{CodeRangeError, LogicOp, LogicSpec, LogicTerm};
pub use peak::{find_peaks, refine_peak, ParabolaFit, Peak, PeakFit, MAX_PEAKS};
pub use ratio::{GainCorrelation, GainFit, GainLine, LineFit, CORRELATION_CONVERGENCE, RATIO_NOISE};
pub use sideband::{rolling_average, SidebandCorrector};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init, init_from_env, init_with_level, LogFilter, LOG_ENV};
