//! Camera frames, rectangular regions of interest and 1-D projections.

use serde::{Deserialize, Serialize};

/// Borrowed view of a 2-D camera frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u16], // row-major, len = w*h
}

/// Owned camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u16>,
}

impl Frame {
    /// Frame of the given size filled with `value`.
    pub fn filled(width: usize, height: usize, value: u16) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    #[inline]
    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: u16) {
        self.data[row * self.width + col] = value;
    }
}

impl FrameView<'_> {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.len() < self.width * self.height
    }

    #[inline]
    fn row(&self, row: usize) -> &[u16] {
        &self.data[row * self.width..(row + 1) * self.width]
    }
}

/// Axis collapsed by a projection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionAxis {
    /// Rows are summed; the trace is indexed by column ("project x").
    #[default]
    Row,
    /// Columns are summed; the trace is indexed by row ("project y").
    Column,
}

/// Rectangular region of interest with inclusive bounds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub row_lo: usize,
    pub row_hi: usize,
    pub col_lo: usize,
    pub col_hi: usize,
}

impl Roi {
    pub const fn new(row_lo: usize, row_hi: usize, col_lo: usize, col_hi: usize) -> Self {
        Self {
            row_lo,
            row_hi,
            col_lo,
            col_hi,
        }
    }

    #[inline]
    pub fn is_ordered(&self) -> bool {
        self.row_hi >= self.row_lo && self.col_hi >= self.col_lo
    }

    /// Number of samples in the projected trace for `axis`.
    #[inline]
    pub fn projected_len(&self, axis: ProjectionAxis) -> usize {
        match axis {
            ProjectionAxis::Row => self.col_hi + 1 - self.col_lo,
            ProjectionAxis::Column => self.row_hi + 1 - self.row_lo,
        }
    }

    /// Number of samples summed into each trace entry for `axis`.
    #[inline]
    pub fn summed_len(&self, axis: ProjectionAxis) -> usize {
        match axis {
            ProjectionAxis::Row => self.row_hi + 1 - self.row_lo,
            ProjectionAxis::Column => self.col_hi + 1 - self.col_lo,
        }
    }
}

/// Which bound of the ROI exceeded the frame along the trace axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiClamp {
    pub axis: ProjectionAxis,
    /// Configured far bound along the trace axis.
    pub requested: usize,
    /// Frame extent along the trace axis.
    pub available: usize,
}

impl std::fmt::Display for RoiClamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.axis {
            ProjectionAxis::Row => "column",
            ProjectionAxis::Column => "row",
        };
        write!(
            f,
            "roi {what} bound {} exceeds frame extent {}",
            self.requested, self.available
        )
    }
}

/// Errors that prevent a projection from being computed at all.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoiError {
    #[error("frame is empty or inconsistent ({width}x{height}, {len} samples)")]
    EmptyFrame {
        width: usize,
        height: usize,
        len: usize,
    },
    #[error("roi bounds are not ordered: {0:?}")]
    Unordered(Roi),
    #[error("output buffer holds {got} samples, roi projects to {expected}")]
    OutputLength { expected: usize, got: usize },
}

/// Project `roi` of `frame` onto `axis`, subtracting `pedestal` from every
/// summed sample.
///
/// `out` must hold `roi.projected_len(axis)` entries. Trace entries that
/// fall outside the frame are zero; that case is reported as `Some(RoiClamp)`.
/// Along the summed axis the ROI is clamped silently.
pub fn project(
    frame: &FrameView<'_>,
    roi: &Roi,
    axis: ProjectionAxis,
    pedestal: i64,
    out: &mut [i64],
) -> Result<Option<RoiClamp>, RoiError> {
    if frame.is_empty() {
        return Err(RoiError::EmptyFrame {
            width: frame.width,
            height: frame.height,
            len: frame.data.len(),
        });
    }
    if !roi.is_ordered() {
        return Err(RoiError::Unordered(*roi));
    }
    let expected = roi.projected_len(axis);
    if out.len() != expected {
        return Err(RoiError::OutputLength {
            expected,
            got: out.len(),
        });
    }

    out.fill(0);
    let row_hi = roi.row_hi.min(frame.height - 1);
    let col_hi = roi.col_hi.min(frame.width - 1);

    match axis {
        ProjectionAxis::Row => {
            if roi.col_lo <= col_hi {
                for r in roi.row_lo..=row_hi {
                    let row = &frame.row(r)[roi.col_lo..=col_hi];
                    for (acc, &v) in out.iter_mut().zip(row) {
                        *acc += v as i64 - pedestal;
                    }
                }
            }
            Ok((roi.col_hi >= frame.width).then_some(RoiClamp {
                axis,
                requested: roi.col_hi,
                available: frame.width,
            }))
        }
        ProjectionAxis::Column => {
            if roi.col_lo <= col_hi {
                for (acc, r) in out.iter_mut().zip(roi.row_lo..=row_hi) {
                    *acc = frame.row(r)[roi.col_lo..=col_hi]
                        .iter()
                        .map(|&v| v as i64 - pedestal)
                        .sum();
                }
            }
            Ok((roi.row_hi >= frame.height).then_some(RoiClamp {
                axis,
                requested: roi.row_hi,
                available: frame.height,
            }))
        }
    }
}
