//! Numeric score values.
//!
//! Recap cells stay text until [`coerce_score`] turns them into a [`Score`].
//! Coercion never fails: text without a numeric prefix becomes NaN, which is
//! stored as JSON `null` and read back as NaN.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Leading floating-point literal, after surrounding whitespace is trimmed.
static NUMERIC_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?").expect("numeric prefix regex")
});

/// A coerced score value. NaN marks a cell that held no number.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Score(pub f64);

impl Score {
    /// The "not a number" sentinel.
    pub const NAN: Score = Score(f64::NAN);

    /// `true` when coercion did not find a number.
    pub fn is_nan(&self) -> bool {
        self.0.is_nan()
    }

    /// The numeric value, or `None` for the NaN sentinel.
    pub fn value(&self) -> Option<f64> {
        if self.0.is_finite() { Some(self.0) } else { None }
    }
}

impl Default for Score {
    fn default() -> Self {
        Self::NAN
    }
}

impl From<f64> for Score {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl Serialize for Score {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.value() {
            Some(v) => serializer.serialize_f64(v),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Score {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(Self(value.unwrap_or(f64::NAN)))
    }
}

/// Coerce score text into a number, parsing the longest numeric prefix.
///
/// `"87.250"` → 87.25, `" 12.5 (3)"` → 12.5, `"DNP"` → NaN.
pub fn coerce_score(text: &str) -> Score {
    NUMERIC_PREFIX_RE
        .find(text.trim())
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(Score)
        .unwrap_or(Score::NAN)
}
