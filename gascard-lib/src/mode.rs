use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::Display;

use crate::error::GascardError;

/// Register page of the sensor. Exactly one is active on the device at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Default, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "N")]
    #[strum(to_string = "N (Normal)")]
    Normal,
    #[serde(rename = "N1")]
    #[strum(to_string = "N1 (Normal Raw)")]
    NormalRaw,
    #[serde(rename = "C1")]
    #[strum(to_string = "C1 (Coefficient)")]
    Coefficient,
    #[serde(rename = "E1")]
    #[strum(to_string = "E1 (Environmental)")]
    Environmental,
    #[serde(rename = "O1")]
    #[strum(to_string = "O1 (Output)")]
    Output,
    #[serde(rename = "X")]
    #[strum(to_string = "X (Settings)")]
    Settings,
    /// Boot default of the device.
    #[default]
    #[serde(rename = "U")]
    #[strum(to_string = "U (User Interface)")]
    UserInterface,
    #[serde(rename = "D")]
    #[strum(to_string = "D (Diagnostic)")]
    Diagnostic,
}

impl Mode {
    pub const ALL: [Mode; 8] = [
        Mode::Normal,
        Mode::NormalRaw,
        Mode::Coefficient,
        Mode::Environmental,
        Mode::Output,
        Mode::Settings,
        Mode::UserInterface,
        Mode::Diagnostic,
    ];

    /// Mode-select command, also the leading token of the mode's frames.
    pub fn code(&self) -> &'static str {
        match self {
            Mode::Normal => "N",
            Mode::NormalRaw => "N1",
            Mode::Coefficient => "C1",
            Mode::Environmental => "E1",
            Mode::Output => "O1",
            Mode::Settings => "X",
            Mode::UserInterface => "U",
            Mode::Diagnostic => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Mode> {
        Mode::ALL.into_iter().find(|m| m.code() == code)
    }

    /// Byte prefixes that mark the clean start of a reply frame.
    pub fn lead_ins() -> Vec<Vec<u8>> {
        Mode::ALL
            .iter()
            .map(|m| {
                let mut lead = m.code().as_bytes().to_vec();
                lead.push(b' ');
                lead
            })
            .collect()
    }

    /// Whether `token` identifies a frame of this mode.
    ///
    /// Prefix match, unless a longer mode code also prefixes the token:
    /// `N` accepts `N` and `N2`, but not `N1`.
    pub fn matches_token(&self, token: &str) -> bool {
        let code = self.code();
        token.starts_with(code)
            && !Mode::ALL
                .iter()
                .any(|other| other.code().len() > code.len() && token.starts_with(other.code()))
    }

    /// The mode whose token leads the frame, if any.
    pub fn identify(token: &str) -> Option<Mode> {
        Mode::ALL.into_iter().find(|m| m.matches_token(token))
    }
}

impl FromStr for Mode {
    type Err = GascardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::from_code(s).ok_or_else(|| GascardError::Catalog(format!("unknown mode code {s:?}")))
    }
}
