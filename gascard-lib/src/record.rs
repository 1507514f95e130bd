use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;

use crate::error::GascardError;
use crate::mode::Mode;

/// A single decoded field.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric where the token reads as a number, text otherwise (`CO2`, `N2`).
    pub fn parse_token(token: &str) -> Self {
        let numeric_start = token
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.'));
        if numeric_start {
            if let Ok(value) = token.parse::<f64>() {
                if value.is_finite() {
                    return FieldValue::Number(value);
                }
            }
        }
        FieldValue::Text(token.to_string())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Number(_) => None,
            FieldValue::Text(s) => Some(s),
        }
    }
}

/// Wire formatting: integral numbers are written without a fractional part.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(v) if v.fract() == 0.0 && v.abs() < 1e15 => write!(f, "{}", *v as i64),
            FieldValue::Number(v) => write!(f, "{v}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Number(v.into())
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Number(v.into())
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Ordered field name to value mapping decoded from one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldRecord {
    entries: Vec<(String, FieldValue)>,
}

impl FieldRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame of `mode` against its label list.
    ///
    /// NUL padding is stripped, the leading token must belong to `mode` and
    /// the token count must equal the label count.
    pub fn decode(mode: Mode, labels: &[String], line: &str) -> Result<Self, GascardError> {
        let cleaned = line.replace('\0', "");
        let tokens: Vec<&str> = cleaned.split_whitespace().collect();
        let lead = tokens.first().copied().unwrap_or_default();
        if !mode.matches_token(lead) {
            return Err(GascardError::ModeMismatch {
                expected: mode,
                token: lead.to_string(),
            });
        }
        if tokens.len() != labels.len() {
            return Err(GascardError::FrameShape {
                mode,
                expected: labels.len(),
                actual: tokens.len(),
            });
        }
        let entries = labels
            .iter()
            .zip(tokens)
            .map(|(label, token)| (label.clone(), FieldValue::parse_token(token)))
            .collect();
        Ok(Self { entries })
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }
}

impl FromIterator<(String, FieldValue)> for FieldRecord {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        let mut record = FieldRecord::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

impl Serialize for FieldRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
