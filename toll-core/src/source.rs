use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A toll authority whose back office can be queried for a balance.
///
/// The declaration order is also the query and display order: NY first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "NY")]
    Ny,
    #[serde(rename = "NJ")]
    Nj,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Ny, Source::Nj];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ny => "NY",
            Self::Nj => "NJ",
        }
    }
}

/// Accounts without an explicit source are NY accounts.
impl Default for Source {
    fn default() -> Self {
        Self::Ny
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NY" => Ok(Self::Ny),
            "NJ" => Ok(Self::Nj),
            _ => Err(Error::UnsupportedSource(s.to_string())),
        }
    }
}
