//! Per-pulse timing-edge feature extraction.
//!
//! For every trigger the engine classifies the pulse from its event codes,
//! projects the camera frame onto a trace, removes the common-mode
//! background estimated from a sideband, divides by a reference learned from
//! beam-off pulses and locates the edge. Two strategies are available:
//!
//! - a matched FIR filter, peak search and parabolic refinement,
//! - a whole-trace fit of `d + (a - d) / (1 + (x / c)^b)`.
//!
//! ```no_run
//! use timetool::{Fex, FexConfig, FexParams, Frame};
//!
//! let config = FexConfig::new(FexParams::default())?;
//! let mut fex = Fex::new(config);
//! fex.configure();
//!
//! let frame = Frame::filled(1024, 1024, 0);
//! let status = fex.analyze_frame(&frame.view(), &[140], None);
//! println!("{status:?} {:?}", fex.result().features);
//!
//! fex.unconfigure()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod config;
mod counters;
mod fex;
mod io;
mod observer;
mod reference;
mod result;

pub use config::{ConfigError, FexConfig, FexParams, KeyValues, ReferenceMode, StrategyKind};
pub use counters::CutCounters;
pub use fex::{
    ConfigureReport, EdgeLocator, Fex, FexError, Located, PeakLocator, SigmoidLocator, Strategy,
};
pub use io::{IoError, RunReport};
pub use observer::{FexObserver, NoObserver};
pub use reference::{ReferenceError, ReferenceKey, ReferenceSlot, ReferenceStore, ReferenceTrace};
pub use result::{ConfigMismatch, Cut, EventType, Features, PulseResult, PulseStatus, RoiName};

pub use timetool_core as primitives;
pub use timetool_core::{
    init_from_env, init_with_level, EdgeFitParams, Frame, FrameView, GainLine, LogFilter, LogicOp,
    LogicSpec, LogicTerm, ProjectionAxis, Roi,
};
