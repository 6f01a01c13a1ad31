//! Stderr logger driven by `TIMETOOL_LOG`.
//!
//! The variable holds comma-separated directives. A bare level sets the
//! default and `target=level` overrides it for a module path, so
//! `warn,timetool::fex=debug` keeps everything quiet except the engine.
//! Lines are printed as `[elapsed LEVEL target] message`.

use std::io::Write;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record};

#[cfg(feature = "tracing")]
use tracing_subscriber::fmt::format::FmtSpan;
#[cfg(feature = "tracing")]
use tracing_subscriber::util::SubscriberInitExt;
#[cfg(feature = "tracing")]
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable read by [`init_from_env`] and `init_tracing`.
pub const LOG_ENV: &str = "TIMETOOL_LOG";

/// Per-target level filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFilter {
    default: LevelFilter,
    targets: Vec<(String, LevelFilter)>,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self::new(LevelFilter::Info)
    }
}

impl LogFilter {
    pub fn new(default: LevelFilter) -> Self {
        Self {
            default,
            targets: Vec::new(),
        }
    }

    /// Parse `level` and `target=level` directives; malformed ones are skipped.
    pub fn parse(spec: &str) -> Self {
        let mut filter = Self::default();
        for directive in spec.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            match directive.split_once('=') {
                Some((target, level)) => {
                    if let Ok(level) = LevelFilter::from_str(level.trim()) {
                        filter = filter.with_target(target.trim(), level);
                    }
                }
                None => {
                    if let Ok(level) = LevelFilter::from_str(directive) {
                        filter.default = level;
                    }
                }
            }
        }
        filter
    }

    /// Filter from `TIMETOOL_LOG`, `info` when unset.
    pub fn from_env() -> Self {
        std::env::var(LOG_ENV)
            .map(|spec| Self::parse(&spec))
            .unwrap_or_default()
    }

    pub fn with_target(mut self, target: impl Into<String>, level: LevelFilter) -> Self {
        let target = target.into();
        self.targets.retain(|(t, _)| *t != target);
        self.targets.push((target, level));
        self
    }

    /// Level of the longest directive matching `target` at a `::` boundary.
    pub fn level_for(&self, target: &str) -> LevelFilter {
        self.targets
            .iter()
            .filter(|(prefix, _)| {
                target
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(self.default, |&(_, level)| level)
    }

    /// Most verbose level any target may log at.
    pub fn max_level(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|&(_, level)| level)
            .fold(self.default, Ord::max)
    }
}

struct StderrLogger {
    filter: LogFilter,
    started: Instant,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter.level_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let _ = writeln!(
            std::io::stderr().lock(),
            "[{elapsed:8.3}s {:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: OnceLock<StderrLogger> = OnceLock::new();

/// Install the stderr logger. Only the first call in a process has an effect.
pub fn init(filter: LogFilter) -> Result<(), log::SetLoggerError> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let max = filter.max_level();
    let logger = LOGGER.get_or_init(|| StderrLogger {
        filter,
        started: Instant::now(),
    });
    log::set_logger(logger)?;
    log::set_max_level(max);
    Ok(())
}

pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    init(LogFilter::new(level))
}

pub fn init_from_env() -> Result<(), log::SetLoggerError> {
    init(LogFilter::from_env())
}

/// Install a `tracing` subscriber filtered by `TIMETOOL_LOG`, which
/// accepts the same directive syntax.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE);
    let _ = if json {
        builder.json().flatten_event(true).finish().try_init()
    } else {
        builder
            .with_timer(fmt::time::Uptime::default())
            .finish()
            .try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_set_default_and_target_levels() {
        let f = LogFilter::parse("warn, timetool::fex=debug,bogus=loud,,nonsense");
        assert_eq!(f.level_for("timetool"), LevelFilter::Warn);
        assert_eq!(f.level_for("timetool::fex"), LevelFilter::Debug);
        assert_eq!(f.level_for("timetool::fex::strategy"), LevelFilter::Debug);
        assert_eq!(f.max_level(), LevelFilter::Debug);
    }

    #[test]
    fn prefix_must_end_at_module_boundary() {
        let f = LogFilter::new(LevelFilter::Error).with_target("timetool", LevelFilter::Trace);
        assert_eq!(f.level_for("timetool_core::peak"), LevelFilter::Error);
        assert_eq!(f.level_for("timetool::reference"), LevelFilter::Trace);
    }

    #[test]
    fn longest_prefix_wins_and_later_directive_replaces() {
        let f = LogFilter::parse("off,timetool=info,timetool::fex=trace,timetool=error");
        assert_eq!(f.level_for("timetool::config"), LevelFilter::Error);
        assert_eq!(f.level_for("timetool::fex"), LevelFilter::Trace);
        assert_eq!(f.level_for("other"), LevelFilter::Off);
    }

    #[test]
    fn only_first_install_takes_effect() {
        init_with_level(LevelFilter::Warn).unwrap();
        init(LogFilter::new(LevelFilter::Trace)).unwrap();
        assert_eq!(log::max_level(), LevelFilter::Warn);
        assert!(!log::log_enabled!(target: "timetool", log::Level::Info));
    }
}
