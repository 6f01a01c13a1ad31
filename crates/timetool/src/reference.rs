//! Per-channel adaptive baseline shared by all engines in the process.
//!
//! A single mutex guards every trace; it is held only while one trace is
//! copied out or averaged in.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use timetool_core::{rolling_average, GainFit, GainLine};

/// Which learned trace of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSlot {
    /// Learned from no-beam pulses.
    NoBeam,
    /// Learned from the reference region of every analysed pulse.
    Region,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceKey {
    pub channel: u32,
    pub slot: ReferenceSlot,
}

impl ReferenceKey {
    pub const fn new(channel: u32, slot: ReferenceSlot) -> Self {
        Self { channel, slot }
    }

    /// `timetool.ref.XXXXXXXX`, with a `.roi` suffix for the region slot.
    pub fn file_name(&self) -> String {
        match self.slot {
            ReferenceSlot::NoBeam => format!("timetool.ref.{:08x}", self.channel),
            ReferenceSlot::Region => format!("timetool.ref.{:08x}.roi", self.channel),
        }
    }

    /// Persistence path in `dir`, or `$HOME` / `/tmp` when `dir` is `None`.
    pub fn path_in(&self, dir: Option<&Path>) -> PathBuf {
        let dir = match dir {
            Some(d) => d.to_path_buf(),
            None => std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp")),
        };
        dir.join(self.file_name())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReferenceError {
    #[error("reference shape {found:?} differs from {expected:?}")]
    Shape {
        expected: [usize; 2],
        found: [usize; 2],
    },
    #[error("line {line}: cannot parse {token:?}")]
    Parse { line: usize, token: String },
    #[error("line {line} has {got} values, previous lines have {expected}")]
    Ragged {
        line: usize,
        expected: usize,
        got: usize,
    },
    #[error("reference file is empty")]
    Empty,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Row-major `rows x cols` trace; a 1-D trace has one row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceTrace {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl ReferenceTrace {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, ReferenceError> {
        if data.len() != rows * cols {
            return Err(ReferenceError::Shape {
                expected: [rows, cols],
                found: [1, data.len()],
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn from_row(data: Vec<f64>) -> Self {
        Self {
            rows: 1,
            cols: data.len(),
            data,
        }
    }

    #[inline]
    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// One value per line for a single row; one whitespace-separated row
    /// per line otherwise. Values round-trip exactly.
    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(self.data.len() * 12);
        if self.rows == 1 {
            for v in &self.data {
                let _ = writeln!(out, "{v}");
            }
        } else {
            for row in self.data.chunks(self.cols.max(1)) {
                let mut first = true;
                for v in row {
                    if !first {
                        out.push(' ');
                    }
                    first = false;
                    let _ = write!(out, "{v}");
                }
                out.push('\n');
            }
        }
        out
    }

    /// Inverse of [`ReferenceTrace::to_text`].
    pub fn parse(text: &str) -> Result<Self, ReferenceError> {
        let mut data = Vec::new();
        let mut rows = 0;
        let mut cols = 0;
        for (i, line) in text.lines().enumerate() {
            let start = data.len();
            for token in line.split_whitespace() {
                let v: f64 = token.parse().map_err(|_| ReferenceError::Parse {
                    line: i + 1,
                    token: token.to_string(),
                })?;
                data.push(v);
            }
            let got = data.len() - start;
            if got == 0 {
                continue;
            }
            if rows == 0 {
                cols = got;
            } else if got != cols {
                return Err(ReferenceError::Ragged {
                    line: i + 1,
                    expected: cols,
                    got,
                });
            }
            rows += 1;
        }
        if data.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if cols == 1 {
            return Ok(Self::from_row(data));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReferenceError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Write through a temporary file in the same directory renamed over
    /// `path`; readers see the old or the new file, never a partial one.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ReferenceError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.to_text().as_bytes())?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Shared map of learned references keyed by channel and slot.
#[derive(Debug, Default)]
pub struct ReferenceStore {
    traces: Mutex<HashMap<ReferenceKey, ReferenceTrace>>,
}

impl ReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide store used by engines that are not given one.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ReferenceStore>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ReferenceKey, ReferenceTrace>> {
        self.traces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, key: ReferenceKey) -> bool {
        self.lock().contains_key(&key)
    }

    pub fn shape(&self, key: ReferenceKey) -> Option<[usize; 2]> {
        self.lock().get(&key).map(ReferenceTrace::shape)
    }

    /// Copy the trace for `key` into `out`.
    ///
    /// Returns `false` if there is none or it does not have `out.len()`
    /// samples; `out` is left untouched in that case.
    pub fn read_into(&self, key: ReferenceKey, out: &mut [f64]) -> bool {
        let traces = self.lock();
        match traces.get(&key) {
            Some(t) if t.data.len() == out.len() => {
                out.copy_from_slice(&t.data);
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self, key: ReferenceKey) -> Option<ReferenceTrace> {
        self.lock().get(&key).cloned()
    }

    /// Fold `sample` into the trace for `key` with rolling fraction
    /// `fraction`. The first sample for a key seeds the trace and fixes
    /// its shape.
    pub fn update(
        &self,
        key: ReferenceKey,
        shape: [usize; 2],
        sample: &[f64],
        fraction: f64,
    ) -> Result<(), ReferenceError> {
        self.update_with(key, shape, sample, fraction, |_| ())
            .map(|_| ())
    }

    /// [`update`](Self::update), first fitting the gain of `sample`
    /// relative to the trace learned so far. `Ok(None)` when the sample
    /// seeded the trace.
    pub fn update_with_gain(
        &self,
        key: ReferenceKey,
        shape: [usize; 2],
        sample: &[f64],
        fraction: f64,
        fit: GainFit,
    ) -> Result<Option<GainLine>, ReferenceError> {
        self.update_with(key, shape, sample, fraction, |learned| {
            fit.fit(learned, sample)
        })
    }

    /// `inspect` sees the learned trace before `sample` is rolled in.
    fn update_with<T>(
        &self,
        key: ReferenceKey,
        shape: [usize; 2],
        sample: &[f64],
        fraction: f64,
        inspect: impl FnOnce(&[f64]) -> T,
    ) -> Result<Option<T>, ReferenceError> {
        if sample.len() != shape[0] * shape[1] {
            return Err(ReferenceError::Shape {
                expected: shape,
                found: [1, sample.len()],
            });
        }
        let mut traces = self.lock();
        match traces.get_mut(&key) {
            Some(t) if t.shape() != shape => Err(ReferenceError::Shape {
                expected: t.shape(),
                found: shape,
            }),
            Some(t) => {
                let seen = inspect(&t.data);
                rolling_average(&mut t.data, sample.iter().copied(), fraction);
                Ok(Some(seen))
            }
            None => {
                traces.insert(
                    key,
                    ReferenceTrace {
                        rows: shape[0],
                        cols: shape[1],
                        data: sample.to_vec(),
                    },
                );
                Ok(None)
            }
        }
    }

    /// Replace the trace for `key`.
    pub fn insert(&self, key: ReferenceKey, trace: ReferenceTrace) -> Option<ReferenceTrace> {
        self.lock().insert(key, trace)
    }

    /// Insert `trace` unless `key` is already populated; returns whether
    /// it was inserted.
    pub fn insert_if_absent(&self, key: ReferenceKey, trace: ReferenceTrace) -> bool {
        let mut traces = self.lock();
        if traces.contains_key(&key) {
            return false;
        }
        traces.insert(key, trace);
        true
    }

    pub fn remove(&self, key: ReferenceKey) -> Option<ReferenceTrace> {
        self.lock().remove(&key)
    }

    /// Write the trace for `key` to `path`; `Ok(false)` if nothing is learned.
    pub fn save(&self, key: ReferenceKey, path: impl AsRef<Path>) -> Result<bool, ReferenceError> {
        // Copy out so the file write happens without the lock.
        let Some(trace) = self.snapshot(key) else {
            return Ok(false);
        };
        trace.save(path)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const KEY: ReferenceKey = ReferenceKey::new(0x1b00_0a00, ReferenceSlot::NoBeam);

    #[test]
    fn file_names_carry_channel_in_hex() {
        assert_eq!(KEY.file_name(), "timetool.ref.1b000a00");
        let roi = ReferenceKey::new(7, ReferenceSlot::Region);
        assert_eq!(roi.file_name(), "timetool.ref.00000007.roi");
        assert_eq!(
            roi.path_in(Some(Path::new("/data"))),
            PathBuf::from("/data/timetool.ref.00000007.roi")
        );
    }

    #[test]
    fn first_update_seeds_then_rolls() {
        let store = ReferenceStore::new();
        store.update(KEY, [1, 3], &[2.0, 4.0, 6.0], 0.25).unwrap();
        store.update(KEY, [1, 3], &[6.0, 4.0, 2.0], 0.25).unwrap();

        let mut out = [0.0; 3];
        assert!(store.read_into(KEY, &mut out));
        assert_relative_eq!(out[0], 3.0);
        assert_relative_eq!(out[1], 4.0);
        assert_relative_eq!(out[2], 5.0);
    }

    #[test]
    fn constant_input_converges() {
        let store = ReferenceStore::new();
        store.update(KEY, [1, 2], &[0.0, 100.0], 0.1).unwrap();
        for _ in 0..500 {
            store.update(KEY, [1, 2], &[7.5, 7.5], 0.1).unwrap();
        }
        let t = store.snapshot(KEY).unwrap();
        for &v in t.data() {
            assert_relative_eq!(v, 7.5, epsilon = 1e-9);
        }
    }

    #[test]
    fn shape_is_fixed_once_established() {
        let store = ReferenceStore::new();
        store.update(KEY, [2, 2], &[1.0; 4], 0.5).unwrap();
        assert!(matches!(
            store.update(KEY, [1, 4], &[1.0; 4], 0.5),
            Err(ReferenceError::Shape {
                expected: [2, 2],
                found: [1, 4]
            })
        ));
        let mut wrong = [0.0; 3];
        assert!(!store.read_into(KEY, &mut wrong));
    }

    #[test]
    fn gain_is_fitted_against_trace_before_rolling() {
        let store = ReferenceStore::new();
        let base: Vec<f64> = (0..50).map(|k| 1000.0 + k as f64).collect();
        let fit = GainFit::new(true);
        assert_eq!(store.update_with_gain(KEY, [1, 50], &base, 0.5, fit).unwrap(), None);

        let brighter: Vec<f64> = base.iter().map(|v| 1.2 * v).collect();
        let line = store
            .update_with_gain(KEY, [1, 50], &brighter, 0.5, fit)
            .unwrap()
            .unwrap();
        assert_relative_eq!(line.offset, 1.2, epsilon = 1e-9);
        assert_relative_eq!(line.slope, 0.0, epsilon = 1e-9);
        let t = store.snapshot(KEY).unwrap();
        assert_relative_eq!(t.data()[0], 1100.0);
    }

    #[test]
    fn concurrent_saves_leave_one_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = KEY.path_in(Some(dir.path()));
        let traces: Vec<ReferenceTrace> = (0..6)
            .map(|w| ReferenceTrace::from_row(vec![w as f64 + 0.5; 200 + 150 * w]))
            .collect();

        std::thread::scope(|s| {
            for trace in &traces {
                let path = &path;
                s.spawn(move || {
                    for _ in 0..20 {
                        trace.save(path).unwrap();
                    }
                });
            }
        });

        let loaded = ReferenceTrace::load(&path).unwrap();
        assert!(traces.contains(&loaded));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn text_round_trip_is_exact() {
        let row = ReferenceTrace::from_row(vec![0.1, 1.0 / 3.0, -2.5e-17, 12345.678901234]);
        let back = ReferenceTrace::parse(&row.to_text()).unwrap();
        assert_eq!(back, row);

        let grid = ReferenceTrace::new(2, 3, vec![1.0, 2.0, 3.0, 4.5, 5.25, 6.125]).unwrap();
        assert_eq!(grid.to_text(), "1 2 3\n4.5 5.25 6.125\n");
        assert_eq!(ReferenceTrace::parse(&grid.to_text()).unwrap(), grid);
    }

    #[test]
    fn ragged_text_is_rejected() {
        assert!(matches!(
            ReferenceTrace::parse("1 2\n3\n"),
            Err(ReferenceError::Ragged { line: 2, .. })
        ));
        assert!(matches!(
            ReferenceTrace::parse("\n\n"),
            Err(ReferenceError::Empty)
        ));
    }

    #[test]
    fn save_then_load_through_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReferenceStore::new();
        let sample: Vec<f64> = (0..64).map(|i| (i as f64).sqrt() * 0.7).collect();
        store.update(KEY, [1, 64], &sample, 0.3).unwrap();

        let path = KEY.path_in(Some(dir.path()));
        assert!(store.save(KEY, &path).unwrap());

        let loaded = ReferenceTrace::load(&path).unwrap();
        assert_eq!(loaded.shape(), [1, 64]);
        assert_eq!(loaded.data(), &sample[..]);

        let empty = ReferenceKey::new(1, ReferenceSlot::NoBeam);
        assert!(!store.save(empty, dir.path().join("x")).unwrap());
    }
}
