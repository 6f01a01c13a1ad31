//! JSON configuration and report helpers.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{FexParams, KeyValues};
use crate::counters::CutCounters;
use crate::result::PulseResult;

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FexParams {
    /// Load parameters from JSON on disk; absent fields take defaults.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write these parameters to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), IoError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl KeyValues {
    /// Read key/value text from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IoError> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }
}

/// Per-pulse results and the drop summary of one run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub params: FexParams,
    pub counters: CutCounters,
    #[serde(default)]
    pub pulses: Vec<PulseResult>,
}

impl RunReport {
    pub fn new(params: FexParams) -> Self {
        Self {
            params,
            counters: CutCounters::default(),
            pulses: Vec::new(),
        }
    }

    /// Load a report from JSON on disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this report to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), IoError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{EventType, PulseStatus};
    use timetool_core::Roi;

    #[test]
    fn params_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fex.json");
        let params = FexParams {
            phy: 42,
            sig_roi: Roi::new(1, 2, 3, 400),
            ipm_beam_threshold: Some(0.3),
            ..FexParams::default()
        };
        params.write_json(&path).unwrap();
        assert_eq!(FexParams::load_json(&path).unwrap(), params);
    }

    #[test]
    fn sparse_json_takes_defaults() {
        let params: FexParams = serde_json::from_str(r#"{ "phy": 7, "use_fit": true }"#).unwrap();
        assert_eq!(params.phy, 7);
        assert!(params.use_fit);
        assert_eq!(params.peak_fraction, 0.5);
        assert_eq!(params.beam_logic, FexParams::default().beam_logic);
    }

    #[test]
    fn report_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut report = RunReport::new(FexParams::default());
        report.pulses.push(PulseResult {
            event_type: EventType::Reference,
            status: PulseStatus::ReferenceUpdated,
            ..PulseResult::default()
        });
        report.counters.record(PulseStatus::ReferenceUpdated);
        report.write_json(&path).unwrap();

        let back = RunReport::load_json(&path).unwrap();
        assert_eq!(back.counters, report.counters);
        assert_eq!(back.pulses, report.pulses);
    }
}
