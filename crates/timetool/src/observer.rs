//! Checkpoint hooks for plotting and diagnostics.

use timetool_core::GainLine;

/// Called at fixed points of the per-pulse pipeline. All methods default to
/// no-ops; buffers are only valid for the duration of the call.
pub trait FexObserver {
    /// Signal projection and the sideband estimate subtracted from it.
    fn raw_signal(&mut self, _signal: &[i64], _sideband: &[f64]) {}
    /// Sideband-corrected trace that was folded into a reference.
    fn reference(&mut self, _trace: &[f64]) {}
    /// Signal divided by the reference.
    fn normalized(&mut self, _trace: &[f64]) {}
    /// FIR response of the normalized trace.
    fn filtered(&mut self, _response: &[f64]) {}
    /// Gain fits of the reference region and the signal region of one
    /// beam-off pulse, as accumulated into the gain correlation.
    fn gain(&mut self, _region: GainLine, _signal: GainLine) {}
}

/// Observer that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoObserver;

impl FexObserver for NoObserver {}

impl<O: FexObserver + ?Sized> FexObserver for &mut O {
    fn raw_signal(&mut self, signal: &[i64], sideband: &[f64]) {
        (**self).raw_signal(signal, sideband)
    }
    fn reference(&mut self, trace: &[f64]) {
        (**self).reference(trace)
    }
    fn normalized(&mut self, trace: &[f64]) {
        (**self).normalized(trace)
    }
    fn filtered(&mut self, response: &[f64]) {
        (**self).filtered(response)
    }
    fn gain(&mut self, region: GainLine, signal: GainLine) {
        (**self).gain(region, signal)
    }
}
