//! Values exchanged with the statistics engine.
//!
//! Wire shape of an evaluation result:
//! `{"type": "doubles" | "integers" | "strings" | "null", "values": [...]}`.
//! Missing numeric values (NA/NaN) travel as JSON `null`.

use serde::{Deserialize, Serialize};

use crate::error::StatsError;

/// A vector assigned to a symbol in the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsVector {
    Doubles(Vec<f64>),
    Strings(Vec<String>),
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsValue {
    Doubles(Vec<f64>),
    Integers(Vec<i64>),
    Strings(Vec<String>),
    Null,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
enum WireValue {
    Doubles(Vec<Option<f64>>),
    Integers(Vec<Option<i64>>),
    Strings(Vec<String>),
    Null,
}

impl StatsValue {
    pub fn from_wire(result: serde_json::Value) -> Result<Self, StatsError> {
        let wire: WireValue = serde_json::from_value(result)
            .map_err(|e| StatsError::Protocol(format!("unrecognised result: {e}")))?;
        Ok(match wire {
            WireValue::Doubles(v) => {
                Self::Doubles(v.into_iter().map(|d| d.unwrap_or(f64::NAN)).collect())
            }
            WireValue::Integers(v) => {
                // NA integers have no i64 representation; keep the rest in order.
                Self::Integers(v.into_iter().flatten().collect())
            }
            WireValue::Strings(v) => Self::Strings(v),
            WireValue::Null => Self::Null,
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Doubles(_) => "doubles",
            Self::Integers(_) => "integers",
            Self::Strings(_) => "strings",
            Self::Null => "null",
        }
    }

    /// Numeric view. Integers widen to doubles.
    pub fn into_doubles(self, expression: &str) -> Result<Vec<f64>, StatsError> {
        match self {
            Self::Doubles(v) => Ok(v),
            Self::Integers(v) => Ok(v.into_iter().map(|i| i as f64).collect()),
            other => Err(other.mismatch(expression, "doubles")),
        }
    }

    /// Integer view. Doubles are accepted when they hold whole numbers,
    /// which is how several R functions report indices.
    pub fn into_integers(self, expression: &str) -> Result<Vec<i64>, StatsError> {
        match self {
            Self::Integers(v) => Ok(v),
            Self::Doubles(v) if v.iter().all(|d| d.is_finite() && d.fract() == 0.0) => {
                Ok(v.into_iter().map(|d| d as i64).collect())
            }
            Self::Null => Ok(Vec::new()),
            other => Err(other.mismatch(expression, "integers")),
        }
    }

    pub fn into_strings(self, expression: &str) -> Result<Vec<String>, StatsError> {
        match self {
            Self::Strings(v) => Ok(v),
            other => Err(other.mismatch(expression, "strings")),
        }
    }

    fn mismatch(&self, expression: &str, expected: &'static str) -> StatsError {
        StatsError::UnexpectedType {
            expression: expression.to_string(),
            expected,
            actual: self.type_name(),
        }
    }
}
