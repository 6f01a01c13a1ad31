//! Per-pulse feature extraction engine.
//!
//! A [`Fex`] owns its configuration, scratch buffers and analysis strategy
//! and shares only the [`ReferenceStore`] with other engines of the same
//! channel. Buffers are sized once at construction; analysing a pulse does
//! not allocate.

mod error;
mod strategy;

pub use error::FexError;
pub use strategy::{EdgeLocator, Located, PeakLocator, SigmoidLocator, Strategy};

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use timetool_core::{
    project, FrameView, GainCorrelation, GainFit, GainLine, RoiClamp, SidebandCorrector,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::config::{FexConfig, FexParams, ReferenceMode, StrategyKind};
use crate::counters::CutCounters;
use crate::observer::{FexObserver, NoObserver};
use crate::reference::{
    ReferenceError, ReferenceKey, ReferenceSlot, ReferenceStore, ReferenceTrace,
};
use crate::result::{
    ConfigMismatch, Cut, EventType, Features, PulseResult, PulseStatus, RoiName,
};

/// What `configure()` found while (re)loading persisted references.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigureReport {
    /// Slots populated from disk.
    pub loaded: Vec<ReferenceSlot>,
    pub mismatches: Vec<ConfigMismatch>,
}

/// Feature extraction engine for one channel.
pub struct Fex<O: FexObserver = NoObserver> {
    config: FexConfig,
    store: Arc<ReferenceStore>,
    observer: O,
    sideband: SidebandCorrector,
    strategy: Strategy,
    counters: CutCounters,
    result: PulseResult,
    sig: Vec<i64>,
    sb: Vec<i64>,
    refp: Vec<i64>,
    corrected: Vec<f64>,
    ref_corrected: Vec<f64>,
    reference: Vec<f64>,
    normalized: Vec<f64>,
    window: Vec<f64>,
    region_gain: GainLine,
    correlation: GainCorrelation,
    clamp_reported: bool,
}

impl Fex<NoObserver> {
    /// Engine sharing the process-wide reference store.
    pub fn new(config: FexConfig) -> Self {
        Self::with_store(config, ReferenceStore::global())
    }

    /// Validate `params` and build an engine on the process-wide store.
    pub fn from_params(params: FexParams) -> Result<Self, FexError> {
        Ok(Self::new(FexConfig::new(params)?))
    }

    pub fn with_store(config: FexConfig, store: Arc<ReferenceStore>) -> Self {
        Self::with_observer(config, store, NoObserver)
    }
}

impl<O: FexObserver> Fex<O> {
    pub fn with_observer(config: FexConfig, store: Arc<ReferenceStore>, observer: O) -> Self {
        let n = config.trace_len();
        let ref_len = if config.ref_mode().uses_region() { n } else { 0 };
        let correlation = GainCorrelation::new(config.params().ref_update_period);
        let sideband = SidebandCorrector::new(n, config.params().sb_convergence);
        let strategy = Strategy::from_config(&config);
        let window = vec![0.0; config.params().window_len];
        Self {
            config,
            store,
            observer,
            sideband,
            strategy,
            counters: CutCounters::default(),
            result: PulseResult::default(),
            sig: vec![0; n],
            sb: vec![0; n],
            refp: vec![0; ref_len],
            corrected: vec![0.0; n],
            ref_corrected: vec![0.0; ref_len],
            reference: vec![0.0; n],
            normalized: vec![0.0; n],
            window,
            region_gain: GainLine::IDENTITY,
            correlation,
            clamp_reported: false,
        }
    }

    #[inline]
    pub fn config(&self) -> &FexConfig {
        &self.config
    }

    #[inline]
    pub fn store(&self) -> &Arc<ReferenceStore> {
        &self.store
    }

    #[inline]
    pub fn observer(&self) -> &O {
        &self.observer
    }

    #[inline]
    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    #[inline]
    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    #[inline]
    pub fn counters(&self) -> &CutCounters {
        &self.counters
    }

    /// Result of the last analysed pulse.
    #[inline]
    pub fn result(&self) -> &PulseResult {
        &self.result
    }

    /// Normalized trace of the last signal pulse that reached normalization.
    #[inline]
    pub fn normalized(&self) -> &[f64] {
        &self.normalized
    }

    /// Filtered response of the peak path; empty for the sigmoid path.
    pub fn filtered(&self) -> &[f64] {
        match &self.strategy {
            Strategy::Peak(p) => p.response(),
            Strategy::Edge(_) => &[],
        }
    }

    /// Fitted model curve of the sigmoid path; empty for the peak path.
    pub fn fitted_curve(&self) -> &[f64] {
        match &self.strategy {
            Strategy::Edge(s) => s.curve(),
            Strategy::Peak(_) => &[],
        }
    }

    /// Normalized trace around the raw edge position, zero padded.
    #[inline]
    pub fn window(&self) -> &[f64] {
        &self.window
    }

    #[inline]
    pub fn reference_key(&self, slot: ReferenceSlot) -> ReferenceKey {
        ReferenceKey::new(self.config.params().phy, slot)
    }

    pub fn reference_path(&self, slot: ReferenceSlot) -> PathBuf {
        self.reference_key(slot)
            .path_in(self.config.params().reference_dir.as_deref())
    }

    /// Gain drift last measured on the reference region.
    #[inline]
    pub fn region_gain(&self) -> GainLine {
        self.region_gain
    }

    #[inline]
    pub fn gain_correlation(&self) -> &GainCorrelation {
        &self.correlation
    }

    fn slots(&self) -> &'static [ReferenceSlot] {
        if self.config.ref_mode().uses_region() {
            &[ReferenceSlot::NoBeam, ReferenceSlot::Region]
        } else {
            &[ReferenceSlot::NoBeam]
        }
    }

    /// Start a run: clear counters and the sideband average and load
    /// persisted references for slots not yet learned in this process.
    pub fn configure(&mut self) -> ConfigureReport {
        self.counters.clear();
        self.result.clear();
        self.sideband.clear();
        self.region_gain = GainLine::IDENTITY;
        self.correlation.reset();
        self.clamp_reported = false;

        let name = self.config.params().base_name.clone();
        let shape = [1, self.config.trace_len()];
        let mut report = ConfigureReport::default();

        for &slot in self.slots() {
            let key = self.reference_key(slot);
            let path = self.reference_path(slot);
            match ReferenceTrace::load(&path) {
                Ok(trace) if trace.shape() != shape => {
                    let m = ConfigMismatch::ReferenceShape {
                        path,
                        expected: shape,
                        found: trace.shape(),
                    };
                    warn!("{name}: {m}");
                    report.mismatches.push(m);
                }
                Ok(trace) => {
                    if self.store.insert_if_absent(key, trace) {
                        info!("{name}: loaded reference from {}", path.display());
                        report.loaded.push(slot);
                    } else {
                        debug!(
                            "{name}: {slot:?} reference already learned, {} not loaded",
                            path.display()
                        );
                    }
                }
                Err(ReferenceError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    debug!("{name}: no reference file {}", path.display());
                }
                Err(e) => {
                    let m = ConfigMismatch::ReferenceUnreadable {
                        path,
                        reason: e.to_string(),
                    };
                    warn!("{name}: {m}");
                    report.mismatches.push(m);
                }
            }
        }

        info!(
            "{name}: configured channel {:08x}, {} samples, {:?} strategy",
            self.config.params().phy,
            self.config.trace_len(),
            self.strategy.kind()
        );
        report
    }

    /// End a run: persist learned references and log the drop summary.
    pub fn unconfigure(&mut self) -> Result<CutCounters, FexError> {
        let name = &self.config.params().base_name;
        for &slot in self.slots() {
            let path = self.reference_path(slot);
            if self.store.save(self.reference_key(slot), &path)? {
                info!("{name}: saved reference to {}", path.display());
            } else {
                info!("{name}: no reference to save to {}", path.display());
            }
        }
        info!("{name}: {}", self.counters);
        Ok(self.counters)
    }

    /// Clear the per-pulse result.
    #[inline]
    pub fn reset(&mut self) {
        self.result.clear();
    }

    /// Whether the reference region takes part in a pulse of type `event`.
    fn projects_region(&self, event: EventType) -> bool {
        match self.config.ref_mode() {
            ReferenceMode::NoBeam => false,
            ReferenceMode::Region => event == EventType::Signal,
            ReferenceMode::GainRatio => event != EventType::Dark,
        }
    }

    /// Classify a pulse from its event codes and optional beam intensity.
    pub fn classify(&self, tags: &[u32], intensity: Option<f64>) -> EventType {
        let p = self.config.params();
        if !p.laser_logic.evaluate(tags) {
            return EventType::Dark;
        }
        let mut beam = p.beam_logic.evaluate(tags);
        if let (Some(threshold), Some(v)) = (p.ipm_beam_threshold, intensity) {
            if v < threshold {
                beam = false;
            }
        }
        if beam {
            EventType::Signal
        } else {
            EventType::Reference
        }
    }

    /// Analyse one camera frame.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(phy = self.config.params().phy))
    )]
    pub fn analyze_frame(
        &mut self,
        frame: &FrameView<'_>,
        tags: &[u32],
        intensity: Option<f64>,
    ) -> PulseStatus {
        self.reset();
        let event = self.classify(tags, intensity);
        self.result.event_type = event;
        if event == EventType::Dark {
            return self.finish(PulseStatus::Dropped(Cut::NoLaser));
        }

        let axis = self.config.params().axis;
        let pedestal = self.config.params().pedestal;
        let mut mismatch = None;
        let with_ref = self.projects_region(event);
        let regions = [
            (RoiName::Signal, self.config.sig_roi(), &mut self.sig),
            (RoiName::Sideband, self.config.sb_roi(), &mut self.sb),
            (RoiName::Reference, self.config.ref_roi(), &mut self.refp),
        ];
        let mut failed = None;
        for (name, roi, out) in regions {
            if name == RoiName::Reference && !with_ref {
                continue;
            }
            match project(frame, &roi, axis, pedestal, out) {
                Ok(Some(clamp)) => note_clamp(&mut mismatch, name, clamp),
                Ok(None) => {}
                Err(e) => {
                    failed = Some((name, e));
                    break;
                }
            }
        }
        if let Some((name, e)) = failed {
            debug!("{}: {name} projection failed: {e}", self.config.params().base_name);
            return self.finish(PulseStatus::Dropped(Cut::BadFrame));
        }
        if let Some(m) = mismatch {
            if !self.clamp_reported {
                warn!("{}: {m}", self.config.params().base_name);
                self.clamp_reported = true;
            }
            self.result.mismatch = Some(m);
        }

        let status = self.process(event);
        self.finish(status)
    }

    /// Analyse pre-projected traces tagged with their event type.
    ///
    /// `reference` is required whenever the configured reference mode uses
    /// the reference region for this event type and ignored otherwise.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(phy = self.config.params().phy))
    )]
    pub fn analyze_projections(
        &mut self,
        signal: &[i64],
        sideband: &[i64],
        reference: Option<&[i64]>,
        event: EventType,
    ) -> Result<PulseStatus, FexError> {
        let expected = self.config.trace_len();
        let check = |which, got: usize| {
            if got == expected {
                Ok(())
            } else {
                Err(FexError::TraceLength {
                    which,
                    expected,
                    got,
                })
            }
        };
        check(RoiName::Signal, signal.len())?;
        check(RoiName::Sideband, sideband.len())?;
        let with_ref = self.projects_region(event);
        if with_ref {
            check(RoiName::Reference, reference.map_or(0, <[i64]>::len))?;
        }

        self.reset();
        self.result.event_type = event;
        if event == EventType::Dark {
            return Ok(self.finish(PulseStatus::Dropped(Cut::NoLaser)));
        }

        self.sig.copy_from_slice(signal);
        self.sb.copy_from_slice(sideband);
        if let (true, Some(r)) = (with_ref, reference) {
            self.refp.copy_from_slice(r);
        }

        let status = self.process(event);
        Ok(self.finish(status))
    }

    fn finish(&mut self, status: PulseStatus) -> PulseStatus {
        self.result.status = status;
        self.counters.record(status);
        if let Some(cut) = status.cut() {
            debug!("{}: pulse dropped ({cut})", self.config.params().base_name);
        }
        status
    }

    /// Sideband correction, reference learning or normalization and edge
    /// location for a projected Reference or Signal pulse.
    fn process(&mut self, event: EventType) -> PulseStatus {
        let p = self.config.params();
        let (sig_cut, ref_cut, fraction) = (p.sig_cut, p.ref_cut, p.ref_convergence);
        let mode = p.ref_mode;
        let gain_fit = (mode == ReferenceMode::GainRatio).then(|| GainFit::new(p.ref_fit_slope));
        let with_region = self.projects_region(event);
        let shape = [1, self.config.trace_len()];

        let estimate = match self.sideband.process(&self.sb) {
            Ok(estimate) => estimate,
            Err(e) => {
                warn!("{}: sideband rejected: {e}", self.config.params().base_name);
                return PulseStatus::Dropped(Cut::BadFrame);
            }
        };
        for ((c, &s), &e) in self.corrected.iter_mut().zip(&self.sig).zip(estimate) {
            *c = s as f64 - e;
        }
        self.observer.raw_signal(&self.sig, estimate);

        let mut region_gain = None;
        if with_region {
            for ((c, &s), &e) in self.ref_corrected.iter_mut().zip(&self.refp).zip(estimate) {
                *c = s as f64 - e;
            }
            if self.ref_corrected.iter().any(|&v| v > ref_cut) {
                self.observer.reference(&self.ref_corrected);
                let key = self.reference_key(ReferenceSlot::Region);
                match learn(&self.store, key, shape, &self.ref_corrected, fraction, gain_fit) {
                    Ok(gain) => region_gain = gain.filter(GainLine::is_finite),
                    Err(e) => warn!(
                        "{}: region reference not updated: {e}",
                        self.config.params().base_name
                    ),
                }
            }
        }
        if let Some(gain) = region_gain {
            self.region_gain = gain;
        }

        if !self.corrected.iter().any(|&v| v > sig_cut) {
            return PulseStatus::Dropped(Cut::BelowCut);
        }

        if event == EventType::Reference {
            self.observer.reference(&self.corrected);
            let key = self.reference_key(ReferenceSlot::NoBeam);
            return match learn(&self.store, key, shape, &self.corrected, fraction, gain_fit) {
                Ok(signal_gain) => {
                    if let (Some(r), Some(s)) =
                        (region_gain, signal_gain.filter(GainLine::is_finite))
                    {
                        self.correlation.accum(r, s);
                        self.observer.gain(r, s);
                    }
                    PulseStatus::ReferenceUpdated
                }
                Err(e) => {
                    warn!("{}: reference not updated: {e}", self.config.params().base_name);
                    PulseStatus::Dropped(Cut::NoReference)
                }
            };
        }

        let slot = if mode == ReferenceMode::Region {
            ReferenceSlot::Region
        } else {
            ReferenceSlot::NoBeam
        };
        if !self.store.read_into(self.reference_key(slot), &mut self.reference) {
            return PulseStatus::Dropped(Cut::NoReference);
        }

        let gain = (mode == ReferenceMode::GainRatio)
            .then(|| self.correlation.predict(self.region_gain));
        let offset = self.strategy.offset();
        let n = self.normalized.len();
        for (k, ((out, &c), &r)) in self
            .normalized
            .iter_mut()
            .zip(&self.corrected)
            .zip(&self.reference)
            .enumerate()
        {
            let r = gain.map_or(r, |g| r * g.at(k, n));
            let v = if c > sig_cut { c / r - offset } else { 0.0 };
            *out = if v.is_finite() { v } else { 0.0 };
        }
        self.observer.normalized(&self.normalized);

        let located = self.strategy.locate(&self.normalized);
        if let Strategy::Peak(peak) = &self.strategy {
            self.observer.filtered(peak.response());
        }
        let Some(loc) = located else {
            return PulseStatus::Dropped(Cut::NoFit);
        };

        fill_window(&mut self.window, &self.normalized, loc.raw_position);

        let position_ps = self.config.calibrate(loc.position);
        let ref_amplitude = loc.baseline.unwrap_or_else(|| {
            self.reference
                .get(loc.raw_position)
                .copied()
                .unwrap_or(0.0)
        });
        self.result.features = Some(Features {
            amplitude: loc.amplitude,
            position: loc.position,
            position_ps,
            position_adj: position_ps - self.config.center_ps(),
            width: loc.width,
            raw_position: loc.raw_position,
            raw_amplitude: loc.raw_amplitude,
            next_amplitude: loc.next_amplitude,
            ref_amplitude,
            chi2_per_dof: loc.chi2_per_dof,
            errors: loc.errors,
            gain,
        });
        PulseStatus::Analyzed
    }
}

/// Roll `trace` into `key`, fitting its gain first when `fit` is given.
fn learn(
    store: &ReferenceStore,
    key: ReferenceKey,
    shape: [usize; 2],
    trace: &[f64],
    fraction: f64,
    fit: Option<GainFit>,
) -> Result<Option<GainLine>, ReferenceError> {
    match fit {
        Some(fit) => store.update_with_gain(key, shape, trace, fraction, fit),
        None => store.update(key, shape, trace, fraction).map(|()| None),
    }
}

fn note_clamp(slot: &mut Option<ConfigMismatch>, roi: RoiName, clamp: RoiClamp) {
    if slot.is_none() {
        *slot = Some(ConfigMismatch::RoiClamp { roi, clamp });
    }
}

/// Copy `trace` around `center` into `window`, zero padded at both ends.
fn fill_window(window: &mut [f64], trace: &[f64], center: usize) {
    let half = window.len() / 2;
    for (k, w) in window.iter_mut().enumerate() {
        *w = (center + k)
            .checked_sub(half)
            .and_then(|i| trace.get(i))
            .copied()
            .unwrap_or(0.0);
    }
}
