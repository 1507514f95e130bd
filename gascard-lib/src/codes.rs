//! Field catalog: which mode owns each field and which wire code writes it.
//!
//! The catalog is data, not code. A built-in table ships with the library
//! (`codes.json`); [`CodeTable::from_path`] loads a replacement in the same
//! format:
//!
//! ```json
//! { "modes": { "X": { "fields": [ { "name": "Mode" },
//!                                 { "name": "Time Constant", "code": "T", "min": 0, "max": 120 } ] } } }
//! ```
//!
//! A field may also list the only values it `accepts`; frames and writes
//! carrying anything else are rejected.
//!
//! Field order is the order of tokens in the mode's frames. The leading
//! `Mode` label names the frame's mode token and is not addressable.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::error::GascardError;
use crate::mode::Mode;
use crate::record::{FieldRecord, FieldValue};

const BUILTIN_CATALOG: &str = include_str!("../codes.json");

/// Label of the leading mode token in every frame.
pub const MODE_LABEL: &str = "Mode";

static BUILTIN: LazyLock<Arc<CodeTable>> =
    LazyLock::new(|| Arc::new(CodeTable::from_json(BUILTIN_CATALOG).expect("built-in catalog is valid")));

#[derive(Debug, Deserialize)]
struct CatalogFile {
    modes: BTreeMap<String, ModeEntry>,
}

#[derive(Debug, Deserialize)]
struct ModeEntry {
    fields: Vec<FieldEntry>,
}

#[derive(Debug, Deserialize)]
struct FieldEntry {
    name: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    accepts: Option<Vec<String>>,
}

/// Where a field lives and how it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub mode: Mode,
    /// Wire prefix for writes; `None` for read-only fields.
    pub code: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Closed set of permitted values, compared as text.
    pub accepts: Option<Vec<String>>,
}

impl FieldSpec {
    /// Whether `value` is permitted by the field's accepted list.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        match &self.accepts {
            Some(allowed) => {
                let text = value.to_string();
                allowed.iter().any(|a| *a == text)
            }
            None => true,
        }
    }

    fn check_accepted(&self, value: &FieldValue) -> Result<(), GascardError> {
        if self.accepts(value) {
            Ok(())
        } else {
            Err(GascardError::NotAccepted {
                field: self.name.clone(),
                value: value.to_string(),
            })
        }
    }

    /// Check a value against the field's bounds and produce the wire command.
    pub fn command(&self, value: &FieldValue) -> Result<String, GascardError> {
        let code = self
            .code
            .as_deref()
            .ok_or_else(|| GascardError::ReadOnlyField(self.name.clone()))?;
        self.check_accepted(value)?;
        if self.min.is_some() || self.max.is_some() {
            let number = match value {
                FieldValue::Number(v) => *v,
                FieldValue::Text(s) => s.trim().parse::<f64>().map_err(|_| GascardError::NotNumeric {
                    field: self.name.clone(),
                    value: s.clone(),
                })?,
            };
            let min = self.min.unwrap_or(f64::NEG_INFINITY);
            let max = self.max.unwrap_or(f64::INFINITY);
            if !(min..=max).contains(&number) {
                return Err(GascardError::OutOfRange {
                    field: self.name.clone(),
                    value: number,
                    min,
                    max,
                });
            }
        }
        Ok(format!("{code}{value}"))
    }
}

/// Immutable field catalog shared by every device.
#[derive(Debug, Clone)]
pub struct CodeTable {
    labels: BTreeMap<Mode, Vec<String>>,
    fields: HashMap<String, FieldSpec>,
}

impl CodeTable {
    /// The catalog embedded in the library.
    pub fn builtin() -> Arc<CodeTable> {
        Arc::clone(&BUILTIN)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GascardError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let table = Self::from_json(&text)?;
        debug!(path = %path.as_ref().display(), fields = table.fields.len(), "Loaded code table");
        Ok(table)
    }

    pub fn from_json(text: &str) -> Result<Self, GascardError> {
        let file: CatalogFile = serde_json::from_str(text)?;
        let mut labels = BTreeMap::new();
        let mut fields = HashMap::new();

        for (code, entry) in file.modes {
            let mode: Mode = code.parse()?;
            match entry.fields.first() {
                Some(first) if first.name == MODE_LABEL => {}
                _ => {
                    return Err(GascardError::Catalog(format!(
                        "mode {mode}: first field must be {MODE_LABEL:?}"
                    )));
                }
            }
            let mut mode_labels = Vec::with_capacity(entry.fields.len());
            for field in entry.fields {
                mode_labels.push(field.name.clone());
                if field.name == MODE_LABEL {
                    continue;
                }
                let spec = FieldSpec {
                    name: field.name.clone(),
                    mode,
                    code: field.code.filter(|c| !c.is_empty()),
                    min: field.min,
                    max: field.max,
                    accepts: field.accepts,
                };
                if let Some(previous) = fields.insert(field.name.clone(), spec) {
                    return Err(GascardError::Catalog(format!(
                        "field {:?} defined in both {} and {}",
                        field.name, previous.mode, mode
                    )));
                }
            }
            if mode_labels.iter().filter(|l| *l == MODE_LABEL).count() != 1 {
                return Err(GascardError::Catalog(format!("mode {mode}: {MODE_LABEL:?} listed twice")));
            }
            labels.insert(mode, mode_labels);
        }

        Ok(Self { labels, fields })
    }

    /// Ordered label list of a mode's frames.
    pub fn labels(&self, mode: Mode) -> Result<&[String], GascardError> {
        self.labels
            .get(&mode)
            .map(Vec::as_slice)
            .ok_or(GascardError::NoLabels(mode))
    }

    pub fn field(&self, name: &str) -> Result<&FieldSpec, GascardError> {
        self.fields
            .get(name)
            .ok_or_else(|| GascardError::UnknownField(name.to_string()))
    }

    /// Fields of one mode, in frame order.
    pub fn fields_of(&self, mode: Mode) -> Vec<&FieldSpec> {
        self.labels
            .get(&mode)
            .into_iter()
            .flatten()
            .filter_map(|label| self.fields.get(label))
            .collect()
    }

    /// Reject a decoded record holding a value outside a field's accepted list.
    pub fn check_record(&self, record: &FieldRecord) -> Result<(), GascardError> {
        for (name, value) in record.iter() {
            if let Some(spec) = self.fields.get(name) {
                spec.check_accepted(value)?;
            }
        }
        Ok(())
    }

    pub fn modes(&self) -> impl Iterator<Item = Mode> + '_ {
        self.labels.keys().copied()
    }

    /// Group requested names by owning mode, modes in first-appearance order.
    ///
    /// One entry per distinct mode, so one frame read per entry satisfies the
    /// whole request.
    pub fn group_by_mode<'a, I>(&self, names: I) -> Result<Vec<(Mode, Vec<&str>)>, GascardError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut groups: Vec<(Mode, Vec<&str>)> = Vec::new();
        for name in names {
            let spec = self.field(name)?;
            match groups.iter_mut().find(|(mode, _)| *mode == spec.mode) {
                Some((_, members)) => {
                    if !members.contains(&spec.name.as_str()) {
                        members.push(spec.name.as_str());
                    }
                }
                None => groups.push((spec.mode, vec![spec.name.as_str()])),
            }
        }
        Ok(groups)
    }
}
