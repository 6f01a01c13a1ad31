/// A trace handed to a fixed-length stage has the wrong number of samples.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("expected {expected} samples, got {got}")]
pub struct LengthMismatch {
    pub expected: usize,
    pub got: usize,
}

impl LengthMismatch {
    #[inline]
    pub(crate) fn check(expected: usize, got: usize) -> Result<(), Self> {
        if expected == got {
            Ok(())
        } else {
            Err(Self { expected, got })
        }
    }
}
