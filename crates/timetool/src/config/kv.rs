//! Line-oriented `name value value ...` configuration text.

use std::path::PathBuf;
use std::str::FromStr;

use timetool_core::{LogicSpec, ProjectionAxis, Roi};

use super::{ConfigError, FexParams, ReferenceMode};

/// Ordered `name -> values` entries read from configuration text.
///
/// Names are lower-cased. A later entry with the same name overrides an
/// earlier one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValues {
    entries: Vec<(String, Vec<String>)>,
}

impl KeyValues {
    /// Split `text` into entries; blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = match line.find('#') {
                Some(at) => &line[..at],
                None => line,
            };
            let mut tokens = line.split_whitespace();
            let Some(name) = tokens.next() else {
                continue;
            };
            entries.push((
                name.to_ascii_lowercase(),
                tokens.map(str::to_string).collect(),
            ));
        }
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Values of the last entry named `name`.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }
}

fn parse_one<T: FromStr>(key: &str, values: &[String]) -> Result<T, ConfigError> {
    let [value] = values else {
        return Err(ConfigError::Arity {
            key: key.to_string(),
            expected: 1,
            got: values.len(),
        });
    };
    parse_token(key, value)
}

fn parse_token<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Value {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_list<T: FromStr>(key: &str, values: &[String]) -> Result<Vec<T>, ConfigError> {
    values.iter().map(|v| parse_token(key, v)).collect()
}

fn parse_exact<T: FromStr + Copy + Default, const N: usize>(
    key: &str,
    values: &[String],
) -> Result<[T; N], ConfigError> {
    if values.len() != N {
        return Err(ConfigError::Arity {
            key: key.to_string(),
            expected: N,
            got: values.len(),
        });
    }
    let mut out = [T::default(); N];
    for (o, v) in out.iter_mut().zip(values) {
        *o = parse_token(key, v)?;
    }
    Ok(out)
}

fn parse_bool(key: &str, values: &[String]) -> Result<bool, ConfigError> {
    let raw: String = parse_one(key, values)?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Value {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn parse_axis(key: &str, values: &[String]) -> Result<ProjectionAxis, ConfigError> {
    let raw: String = parse_one(key, values)?;
    match raw.chars().next() {
        Some('x' | 'X') => Ok(ProjectionAxis::Row),
        Some('y' | 'Y') => Ok(ProjectionAxis::Column),
        _ => Err(ConfigError::Value {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn parse_roi(key: &str, values: &[String]) -> Result<Roi, ConfigError> {
    let [row_lo, row_hi, col_lo, col_hi] = parse_exact::<usize, 4>(key, values)?;
    Ok(Roi::new(row_lo, row_hi, col_lo, col_hi))
}

impl FexParams {
    /// Apply `kv` on top of the defaults. Unknown keys are logged and skipped.
    pub fn from_key_values(kv: &KeyValues) -> Result<Self, ConfigError> {
        let mut p = Self::default();
        p.apply_key_values(kv)?;
        Ok(p)
    }

    /// Override fields named in `kv`.
    pub fn apply_key_values(&mut self, kv: &KeyValues) -> Result<(), ConfigError> {
        for (key, values) in kv.iter() {
            match key {
                "base_name" => self.base_name = parse_one(key, values)?,
                "phy" => self.phy = parse_phy(key, values)?,
                "project" => self.axis = parse_axis(key, values)?,
                "pedestal" => self.pedestal = parse_one(key, values)?,
                "sig_roi" => self.sig_roi = parse_roi(key, values)?,
                "sb_roi" => self.sb_roi = Some(parse_roi(key, values)?),
                "ref_roi" => self.ref_roi = Some(parse_roi(key, values)?),
                "sb_convergence" => self.sb_convergence = parse_one(key, values)?,
                "ref_convergence" => self.ref_convergence = parse_one(key, values)?,
                "sig_cut" => self.sig_cut = parse_one(key, values)?,
                "ref_cut" => self.ref_cut = parse_one(key, values)?,
                "weights" => self.weights = parse_list(key, values)?,
                "calib_poly" => self.calib_poly = parse_list(key, values)?,
                "beam_logic" => self.beam_logic = parse_logic(key, values)?,
                "laser_logic" => self.laser_logic = parse_logic(key, values)?,
                "ipm_beam_threshold" => self.ipm_beam_threshold = Some(parse_one(key, values)?),
                "peak_fraction" => self.peak_fraction = parse_one(key, values)?,
                "use_fit" => self.use_fit = parse_bool(key, values)?,
                "fit_params" => self.fit.initial = parse_exact::<f64, 4>(key, values)?,
                "fit_max_iterations" => self.fit.max_iterations = parse_one(key, values)?,
                "fit_weights_factor" => self.fit.weights_scale = parse_one(key, values)?,
                "use_ref" => self.ref_mode = parse_ref_mode(key, values)?,
                "use_ref_roi" => {
                    self.ref_mode = if parse_bool(key, values)? {
                        ReferenceMode::Region
                    } else {
                        ReferenceMode::NoBeam
                    }
                }
                "ref_fit_slope" => self.ref_fit_slope = parse_bool(key, values)?,
                "ref_update_period" => self.ref_update_period = parse_one(key, values)?,
                "reference_dir" => {
                    self.reference_dir = Some(PathBuf::from(parse_one::<String>(key, values)?))
                }
                "window_len" => self.window_len = parse_one(key, values)?,
                other => log::warn!("{}: unknown parameter {other:?} ignored", self.base_name),
            }
        }
        Ok(())
    }
}

/// Signed event codes; a code whose magnitude exceeds `u32` is rejected.
fn parse_logic(key: &str, values: &[String]) -> Result<LogicSpec, ConfigError> {
    LogicSpec::from_signed_codes(&parse_list::<i64>(key, values)?).map_err(|e| {
        ConfigError::Value {
            key: key.to_string(),
            value: e.0.to_string(),
        }
    })
}

/// `0`/`1`/`2` or `no_beam`/`region`/`gain_ratio`.
fn parse_ref_mode(key: &str, values: &[String]) -> Result<ReferenceMode, ConfigError> {
    let raw: String = parse_one(key, values)?;
    match raw.to_ascii_lowercase().as_str() {
        "0" | "no_beam" => Ok(ReferenceMode::NoBeam),
        "1" | "region" => Ok(ReferenceMode::Region),
        "2" | "gain_ratio" => Ok(ReferenceMode::GainRatio),
        _ => Err(ConfigError::Value {
            key: key.to_string(),
            value: raw,
        }),
    }
}

/// Channel ids are accepted in decimal or `0x` hex.
fn parse_phy(key: &str, values: &[String]) -> Result<u32, ConfigError> {
    let raw: String = parse_one(key, values)?;
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    };
    parsed.ok_or(ConfigError::Value {
        key: key.to_string(),
        value: raw,
    })
}
