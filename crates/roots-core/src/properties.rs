//! Flat string properties carried by detector descriptors.
//!
//! Descriptors are loaded from TOML and flattened into dotted keys
//! (`detector.period`, `detector.period.timeUnit`, ...). Typed accessors
//! return `Ok(None)` for absent keys and an error for unparseable values.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PropertyError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown time unit: {0}")]
    UnknownTimeUnit(String),
}

// ─── TimeUnit ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    pub fn to_seconds(self, amount: u64) -> u64 {
        match self {
            Self::Seconds => amount,
            Self::Minutes => amount * 60,
            Self::Hours => amount * 3600,
        }
    }
}

impl FromStr for TimeUnit {
    type Err = PropertyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SECONDS" => Ok(Self::Seconds),
            "MINUTES" => Ok(Self::Minutes),
            "HOURS" => Ok(Self::Hours),
            other => Err(PropertyError::UnknownTimeUnit(other.to_string())),
        }
    }
}

// ─── Properties ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for tests and programmatic descriptors.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `key` into `T`. Absent keys yield `Ok(None)`.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, PropertyError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| PropertyError::InvalidValue {
                    key: key.to_string(),
                    value: raw.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, PropertyError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Read a duration stored as `key` (amount) plus `key.timeUnit`.
    /// The unit defaults to seconds. Returns seconds.
    pub fn duration_secs(&self, key: &str) -> Result<Option<u64>, PropertyError> {
        let Some(amount) = self.parse::<u64>(key)? else {
            return Ok(None);
        };
        let unit = self
            .parse::<TimeUnit>(&format!("{key}.timeUnit"))?
            .unwrap_or(TimeUnit::Seconds);
        Ok(Some(unit.to_seconds(amount)))
    }
}

impl FromIterator<(String, String)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
