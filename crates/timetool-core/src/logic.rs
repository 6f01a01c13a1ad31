//! Boolean rules over the discrete event codes present on a pulse.

use serde::{Deserialize, Serialize};

/// How a term is folded into the running truth value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOp {
    And,
    AndNot,
    Or,
    OrNot,
}

impl LogicOp {
    #[inline]
    fn is_and_class(self) -> bool {
        matches!(self, LogicOp::And | LogicOp::AndNot)
    }
}

/// One `(code, operator)` pair of a rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicTerm {
    pub code: u32,
    pub op: LogicOp,
}

/// A signed event code whose magnitude does not fit an event code.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("event code {0} is out of range")]
pub struct CodeRangeError(pub i64);

impl LogicTerm {
    /// `+n` is `AND n`, `-n` is `AND NOT n`.
    pub fn from_signed(code: i64) -> Result<Self, CodeRangeError> {
        let magnitude = u32::try_from(code.unsigned_abs()).map_err(|_| CodeRangeError(code))?;
        Ok(Self {
            code: magnitude,
            op: if code < 0 { LogicOp::AndNot } else { LogicOp::And },
        })
    }
}

/// Ordered list of terms evaluated left to right.
///
/// The fold is seeded with `true` when the first term is AND-class and with
/// `false` when it is OR-class. An empty rule evaluates to `true`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicSpec {
    pub terms: Vec<LogicTerm>,
}

impl LogicSpec {
    pub fn new(terms: Vec<LogicTerm>) -> Self {
        Self { terms }
    }

    /// Build a rule from signed codes, see [`LogicTerm::from_signed`].
    pub fn from_signed_codes(codes: &[i64]) -> Result<Self, CodeRangeError> {
        let terms = codes
            .iter()
            .map(|&c| LogicTerm::from_signed(c))
            .collect::<Result<_, _>>()?;
        Ok(Self { terms })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Evaluate against the codes present on the pulse.
    pub fn evaluate(&self, tags: &[u32]) -> bool {
        let seed = self.terms.first().is_none_or(|t| t.op.is_and_class());
        self.terms.iter().fold(seed, |acc, t| {
            let present = tags.contains(&t.code);
            match t.op {
                LogicOp::And => acc && present,
                LogicOp::AndNot => acc && !present,
                LogicOp::Or => acc || present,
                LogicOp::OrNot => acc || !present,
            }
        })
    }
}
