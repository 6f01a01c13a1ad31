use crate::config::ConfigError;
use crate::reference::ReferenceError;
use crate::result::RoiName;

/// Errors returned by the engine façade.
///
/// Per-pulse drops are not errors; they are reported as
/// [`crate::PulseStatus::Dropped`].
#[derive(thiserror::Error, Debug)]
pub enum FexError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error("{which} trace has {got} samples, configured for {expected}")]
    TraceLength {
        which: RoiName,
        expected: usize,
        got: usize,
    },
}
