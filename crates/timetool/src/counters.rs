use std::fmt;

use serde::{Deserialize, Serialize};

use crate::result::{Cut, PulseStatus};

/// Per-stage drop counters, reset at configure time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutCounters {
    pub calls: u64,
    pub no_laser: u64,
    pub bad_frame: u64,
    pub below_cut: u64,
    pub no_beam: u64,
    pub no_reference: u64,
    pub no_fit: u64,
    pub analyzed: u64,
}

impl CutCounters {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Count the outcome of one call.
    pub fn record(&mut self, status: PulseStatus) {
        self.calls += 1;
        match status {
            PulseStatus::Idle => {}
            PulseStatus::Analyzed => self.analyzed += 1,
            PulseStatus::ReferenceUpdated => self.no_beam += 1,
            PulseStatus::Dropped(cut) => *self.cut_mut(cut) += 1,
        }
    }

    pub fn get(&self, cut: Cut) -> u64 {
        match cut {
            Cut::NoLaser => self.no_laser,
            Cut::BadFrame => self.bad_frame,
            Cut::BelowCut => self.below_cut,
            Cut::NoReference => self.no_reference,
            Cut::NoFit => self.no_fit,
        }
    }

    fn cut_mut(&mut self, cut: Cut) -> &mut u64 {
        match cut {
            Cut::NoLaser => &mut self.no_laser,
            Cut::BadFrame => &mut self.bad_frame,
            Cut::BelowCut => &mut self.below_cut,
            Cut::NoReference => &mut self.no_reference,
            Cut::NoFit => &mut self.no_fit,
        }
    }

    /// Fraction of calls that ended at `count`.
    fn fraction(&self, count: u64) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            count as f64 / self.calls as f64
        }
    }
}

impl fmt::Display for CutCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} calls", self.calls)?;
        let stages = [
            ("no laser", self.no_laser),
            ("bad frame", self.bad_frame),
            ("below cut", self.below_cut),
            ("no beam", self.no_beam),
            ("no reference", self.no_reference),
            ("no fit", self.no_fit),
            ("analyzed", self.analyzed),
        ];
        for (name, count) in stages {
            write!(
                f,
                ", {name} {count} ({:.1}%)",
                100.0 * self.fraction(count)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_outcome_bumps_one_counter() {
        let mut c = CutCounters::default();
        c.record(PulseStatus::Dropped(Cut::BelowCut));
        c.record(PulseStatus::ReferenceUpdated);
        c.record(PulseStatus::Analyzed);
        c.record(PulseStatus::Dropped(Cut::NoFit));

        assert_eq!(c.calls, 4);
        assert_eq!(c.get(Cut::BelowCut), 1);
        assert_eq!(c.no_beam, 1);
        assert_eq!(c.analyzed, 1);
        assert_eq!(c.get(Cut::NoFit), 1);
        assert_eq!(c.get(Cut::NoLaser), 0);
    }

    #[test]
    fn summary_reports_fractions() {
        let mut c = CutCounters::default();
        c.record(PulseStatus::Dropped(Cut::NoLaser));
        c.record(PulseStatus::Analyzed);
        let s = c.to_string();
        assert!(s.starts_with("2 calls"));
        assert!(s.contains("no laser 1 (50.0%)"));
        assert!(s.contains("analyzed 1 (50.0%)"));
    }
}
