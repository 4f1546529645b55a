use std::fmt;
use std::str::FromStr;

use harsh::Harsh;
use lazy_static::lazy_static;
use miette::Diagnostic;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

lazy_static! {
    static ref HARSH: Harsh = Harsh::builder()
        .salt("local.tolls.accounts")
        .build()
        .unwrap();
}

/// Account UUID as exposed in URLs and API payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortId(Uuid);

impl ShortId {
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn into_uuid(self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for ShortId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<&Uuid> for ShortId {
    fn from(id: &Uuid) -> Self {
        Self(*id)
    }
}

impl From<ShortId> for Uuid {
    fn from(id: ShortId) -> Self {
        id.0
    }
}

impl FromStr for ShortId {
    type Err = ParseShortIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = HARSH
            .decode(s)
            .map_err(|_| ParseShortIdError::DecodeFailure)?;
        match decoded[..] {
            [lo, hi] => Ok(Self(Uuid::from_u128(lo as u128 | ((hi as u128) << 64)))),
            _ => Err(ParseShortIdError::DecodeFailure),
        }
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.as_u128();
        let hi = (n >> 64) as u64;
        let lo = n as u64;
        f.write_str(&HARSH.encode(&[lo, hi]))
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ParseShortIdError {
    #[error("not a valid account identifier")]
    #[diagnostic(code(toll::error::bad_argument))]
    DecodeFailure,
}

impl Serialize for ShortId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ShortId {
    fn deserialize<D>(deserializer: D) -> Result<ShortId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
